//! `fp-bisect bisect`: one configuration, printed as it runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::artifacts::ArtifactManager;
use crate::build::{BuildPipeline, ShellBuildPipeline};
use crate::config::{DEFAULT_CONFIG_FILE, ProjectConfig};
use crate::core::{FlagSet, TrialRecord};
use crate::engine::exec::{CommandRunner, ProcessRunner};
use crate::engine::{BisectEngine, BisectRequest, BisectSettings};
use crate::report::{ReportStatus, render_text};
use crate::storage::JsonlWriter;
use crate::{BisectError, BisectResult, write_json};

/// Options shared by the `bisect` and `auto` commands.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Remove each trial's directory once it is scored
    pub delete: bool,
    /// Overrides `[artifacts] root`
    pub artifacts: Option<PathBuf>,
    /// Append every trial to this JSONL file
    pub trial_log: Option<PathBuf>,
    /// Per-command build timeout in seconds (0 = none)
    pub build_timeout_secs: u64,
    /// Stop after the file phase
    pub no_symbols: bool,
}

/// Build an engine driving the real toolchain described by `config`.
pub fn engine_from_config(config: &ProjectConfig, options: &EngineOptions) -> BisectResult<BisectEngine> {
    let root = options.artifacts.clone().unwrap_or_else(|| config.artifacts_root());
    let artifacts = Arc::new(ArtifactManager::new(root, options.delete)?);
    let process: Arc<dyn ProcessRunner> = Arc::new(CommandRunner::new());
    let pipeline: Arc<dyn BuildPipeline> =
        Arc::new(ShellBuildPipeline::new(config.shell_settings(), process.clone()));

    let settings = BisectSettings {
        build_timeout: Duration::from_secs(options.build_timeout_secs),
        verify: true,
        symbols: !options.no_symbols,
    };
    let mut engine = BisectEngine::new(
        pipeline,
        process,
        Arc::from(config.comparator()),
        artifacts,
        config.trusted_flags(),
    )
    .with_run_settings(config.run_settings())
    .with_settings(settings);
    if let Some(path) = &options.trial_log {
        engine = engine.with_trial_log(JsonlWriter::new(path));
    }
    Ok(engine)
}

/// Load `path`; a missing default config file means "all defaults".
pub(crate) fn load_config(path: &Path) -> BisectResult<ProjectConfig> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG_FILE) {
        warn!("no {DEFAULT_CONFIG_FILE} found, using default configuration");
        return Ok(ProjectConfig::default());
    }
    info!(config = %path.display(), "loading project config");
    ProjectConfig::load(path)
}

fn print_trial(record: &TrialRecord) {
    let cached = if record.cached { " (cached)" } else { "" };
    println!("[{:>3}] {} -> {}{}", record.seq, record.description, record.outcome_label(), cached);
}

pub fn run(
    config_path: PathBuf,
    precision: String,
    compiler: String,
    test: String,
    jobs: usize,
    options: EngineOptions,
    json_out: Option<PathBuf>,
) -> BisectResult<()> {
    let config = load_config(&config_path)?;
    let variant = FlagSet::parse(&compiler)?;
    let engine = engine_from_config(&config, &options)?;
    let request = BisectRequest::new(test, precision, variant).with_jobs(jobs);

    println!(
        "Bisecting {} [{}]: {} against {}",
        request.test,
        request.precision,
        request.variant,
        engine.trusted()
    );
    let report = engine.bisect_with_observer(&request, Some(&print_trial))?;

    println!();
    print!("{}", render_text(&report));

    if let Some(path) = json_out {
        write_json(&path, &report)?;
        info!(path = %path.display(), "wrote report");
    }

    match report.status {
        ReportStatus::Aborted => Err(BisectError::Message("bisection did not complete".into())),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_from_config_applies_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let options = EngineOptions {
            delete: true,
            artifacts: Some(dir.path().join("work")),
            ..Default::default()
        };
        let engine = engine_from_config(&ProjectConfig::default(), &options).unwrap();

        assert_eq!(engine.artifacts().root(), dir.path().canonicalize().unwrap().join("work"));
        assert!(engine.artifacts().deletes());
        assert_eq!(engine.trusted().to_string(), "g++ -O0");
        assert_eq!(engine.pipeline().name(), "shell");
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(&dir.path().join("absent.toml")).is_err());
    }
}
