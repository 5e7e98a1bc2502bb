#![forbid(unsafe_code)]

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

use fp_bisect::bisect_cmd::EngineOptions;
use fp_bisect::config::DEFAULT_CONFIG_FILE;
use fp_bisect::{auto_cmd, bisect_cmd};

#[derive(Parser, Debug)]
#[command(name = "fp-bisect")]
#[command(about = "Localize floating-point divergence caused by compiler flags", long_about = None)]
struct Cli {
    /// Enable verbose logging (or set FP_BISECT_LOG)
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct EngineArgs {
    /// Project config file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Concurrent compiles within one build
    #[arg(short = 'j', long, default_value_t = 1)]
    jobs: usize,
    /// Delete each trial directory once it is scored
    #[arg(long)]
    delete: bool,
    /// Directory for trial artifacts (overrides the config)
    #[arg(long)]
    artifacts: Option<PathBuf>,
    /// Append every trial to this JSONL file
    #[arg(long)]
    trial_log: Option<PathBuf>,
    /// Per-command build timeout in seconds (0 = none)
    #[arg(long, default_value_t = 0)]
    build_timeout: u64,
    /// Stop after localizing files
    #[arg(long)]
    no_symbols: bool,
}

impl EngineArgs {
    fn options(&self) -> EngineOptions {
        EngineOptions {
            delete: self.delete,
            artifacts: self.artifacts.clone(),
            trial_log: self.trial_log.clone(),
            build_timeout_secs: self.build_timeout,
            no_symbols: self.no_symbols,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bisect one configuration against the trusted flags
    Bisect {
        /// Precision the test runs at (e.g. float, double)
        precision: String,
        /// Variant flags, quoted: "<compiler> <optimization> [switches...]"
        compilation: String,
        /// Test name
        test: String,
        #[command(flatten)]
        engine: EngineArgs,
        /// Write machine-readable JSON report to this file
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Bisect every flagged row of a results CSV
    Auto {
        /// Results CSV (name, precision, compiler, optl, switches, comparison)
        results: PathBuf,
        /// Configurations bisected at the same time
        #[arg(long, default_value_t = 1)]
        parallel: usize,
        /// Test used for rows with an empty name
        #[arg(long, default_value = "")]
        test: String,
        #[command(flatten)]
        engine: EngineArgs,
        /// Combined JSON report path
        #[arg(long, default_value = "fp-bisect-report.json")]
        output: PathBuf,
        /// Also write a Markdown summary
        #[arg(long)]
        markdown: Option<PathBuf>,
        /// Also write one CSV row per localized symbol
        #[arg(long)]
        csv: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool) {
    let env = std::env::var("FP_BISECT_LOG").unwrap_or_else(|_| {
        if verbose { "fp_bisect=debug".to_string() } else { "fp_bisect=info".to_string() }
    });
    let _ = tracing_subscriber::fmt()
        .with_span_events(FmtSpan::ACTIVE)
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_env_filter(EnvFilter::new(env))
        .try_init();
}

fn main() {
    color_eyre::install().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Bisect { precision, compilation, test, engine, json } => bisect_cmd::run(
            engine.config.clone(),
            precision,
            compilation,
            test,
            engine.jobs,
            engine.options(),
            json,
        ),
        Commands::Auto { results, parallel, test, engine, output, markdown, csv } => {
            auto_cmd::run(
                engine.config.clone(),
                results,
                test,
                parallel,
                engine.jobs,
                engine.options(),
                output,
                markdown,
                csv,
            )
        }
    };

    if let Err(e) = result {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}
