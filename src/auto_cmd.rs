//! `fp-bisect auto`: bisect every flagged row of a results store.

use std::collections::BTreeSet;
use std::path::PathBuf;

use tracing::info;

use crate::bisect_cmd::{EngineOptions, engine_from_config, load_config};
use crate::core::EnvironmentInfo;
use crate::engine::{AutoRunOptions, run_all};
use crate::report::{ReportStatus, write_markdown};
use crate::storage::{CsvExporter, ResultsStore};
use crate::{BisectResult, write_json};

#[allow(clippy::too_many_arguments)]
pub fn run(
    config_path: PathBuf,
    results: PathBuf,
    default_test: String,
    parallel: usize,
    jobs: usize,
    options: EngineOptions,
    output: PathBuf,
    markdown: Option<PathBuf>,
    csv_out: Option<PathBuf>,
) -> BisectResult<()> {
    let config = load_config(&config_path)?;
    let store = ResultsStore::load(&results)?;
    let engine = engine_from_config(&config, &options)?;

    let mut compilers: BTreeSet<String> = BTreeSet::new();
    compilers.insert(engine.pipeline().compiler_binary(engine.trusted()));
    for (_, row) in store.flagged() {
        compilers.insert(engine.pipeline().compiler_binary(&row.to_flagset()));
    }
    let environment =
        EnvironmentInfo::detect().with_compilers(compilers.iter().map(String::as_str));

    let auto = AutoRunOptions { parallel, jobs, default_test };
    let report = run_all(&engine, &store, &auto)?.with_environment(environment);

    write_json(&output, &report)?;
    info!(path = %output.display(), "wrote combined report");
    if let Some(path) = markdown {
        write_markdown(&path, &report)?;
    }
    if let Some(path) = csv_out {
        CsvExporter::new().export(&report, &path)?;
    }

    println!(
        "{} rows, {} skipped, {} bisected ({} completed, {} without baseline, {} aborted)",
        report.rows_total,
        report.rows_skipped,
        report.entries.len(),
        report.count_status(ReportStatus::Completed) + report.count_status(ReportStatus::NoDivergence),
        report.count_status(ReportStatus::GroundTruthFailure),
        report.count_status(ReportStatus::Aborted)
    );
    for entry in &report.entries {
        let files: Vec<String> = entry.report.file_keys();
        println!(
            "  #{} {} {}: {} [{}]",
            entry.index,
            entry.report.precision,
            entry.report.variant,
            entry.report.status.label(),
            files.join(" ")
        );
    }
    println!("Report written to {}", output.display());
    Ok(())
}
