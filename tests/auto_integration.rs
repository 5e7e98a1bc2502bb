//! Integration tests for the auto run over a results store.

use std::path::Path;
use std::sync::Arc;

use fp_bisect::artifacts::ArtifactManager;
use fp_bisect::build::MockBuildPipeline;
use fp_bisect::core::FlagSet;
use fp_bisect::engine::{
    AutoRunOptions, BisectEngine, BisectSettings, CancelToken, MockResponse, MockRunner,
    NumericComparator, RunSettings, run_all,
};
use fp_bisect::report::{IssueKind, ReportStatus, render_markdown};
use fp_bisect::storage::{CSV_HEADERS, CsvExporter, ResultRow, ResultsStore};

fn row(precision: &str, optl: &str, switches: &str, comparison: Option<f64>) -> ResultRow {
    ResultRow {
        name: "Dot".to_string(),
        precision: precision.to_string(),
        compiler: "g++".to_string(),
        optl: optl.to_string(),
        switches: switches.to_string(),
        comparison,
    }
}

/// Seven rows, five of them flagged.
fn store() -> ResultsStore {
    ResultsStore::from_rows(vec![
        row("double", "-O3", "-ffast-math", Some(0.5)),
        row("double", "-O2", "", Some(0.0)),
        row("double", "-O3", "-mavx2", Some(1e-9)),
        row("double", "-O3", "-mfma", Some(2.0)),
        row("double", "-O1", "", None),
        row("double", "-O2", "-ffp-contract=fast", Some(0.1)),
        row("double", "-Ofast", "", Some(3.0)),
    ])
}

/// unit2 diverges under every variant.
fn process() -> MockRunner {
    MockRunner::from_manifest(|m, _| {
        let value = if m.is_variant_unit("unit2.cpp") { "1.5" } else { "1.0" };
        MockResponse::Output(format!("{value}\n"))
    })
}

fn engine(process: MockRunner, root: &Path) -> BisectEngine {
    BisectEngine::new(
        Arc::new(MockBuildPipeline::numbered(5)),
        Arc::new(process),
        Arc::new(NumericComparator::new(0.0)),
        Arc::new(ArtifactManager::new(root, true).unwrap()),
        FlagSet::parse("g++ -O0").unwrap(),
    )
    .with_settings(BisectSettings { symbols: false, ..Default::default() })
}

#[test]
fn test_only_flagged_rows_are_bisected() {
    let root = tempfile::tempdir().unwrap();
    let engine = engine(process(), root.path());
    let options = AutoRunOptions { parallel: 3, jobs: 2, ..Default::default() };

    let combined = run_all(&engine, &store(), &options).unwrap();

    assert_eq!(combined.rows_total, 7);
    assert_eq!(combined.rows_skipped, 2);
    let indices: Vec<usize> = combined.entries.iter().map(|e| e.index).collect();
    assert_eq!(indices, vec![0, 2, 3, 5, 6]);
    for entry in &combined.entries {
        assert_eq!(entry.report.status, ReportStatus::Completed);
        assert_eq!(entry.report.file_keys(), vec!["unit2.cpp"]);
        assert_eq!(entry.report.variant, entry.row.to_flagset().to_string());
    }
    // one baseline shared by every configuration of the same precision
    assert_eq!(engine.ground_truth().builds(), 1);
}

#[test]
fn test_deleted_artifacts_stay_bounded() {
    let root = tempfile::tempdir().unwrap();
    let engine = engine(process(), root.path());
    let options = AutoRunOptions { parallel: 2, jobs: 1, ..Default::default() };

    run_all(&engine, &store(), &options).unwrap();

    let artifacts = engine.artifacts();
    assert_eq!(artifacts.active(), 0);
    assert_eq!(artifacts.disk_usage(), 0);
    assert!(artifacts.acquired() > 5);
    // a halving batch holds two workspaces per running configuration
    assert!(artifacts.peak_active() <= 4, "peak {}", artifacts.peak_active());
}

#[test]
fn test_ground_truth_failure_does_not_stop_other_rows() {
    let process = MockRunner::from_manifest(|m, inv| {
        if m.is_all_trusted() && inv.args.iter().any(|a| a == "float") {
            return MockResponse::Exit { code: 1, stderr: "no float kernel".into() };
        }
        let value = if m.is_variant_unit("unit2.cpp") { "1.5" } else { "1.0" };
        MockResponse::Output(format!("{value}\n"))
    });
    let root = tempfile::tempdir().unwrap();
    let engine = engine(process, root.path());
    let store = ResultsStore::from_rows(vec![
        row("double", "-O3", "", Some(1.0)),
        row("float", "-O3", "", Some(1.0)),
        row("double", "-O2", "", Some(1.0)),
    ]);
    let options = AutoRunOptions { parallel: 2, ..Default::default() };

    let combined = run_all(&engine, &store, &options).unwrap();

    assert_eq!(combined.entries.len(), 3);
    assert_eq!(combined.count_status(ReportStatus::Completed), 2);
    let float = &combined.entries[1].report;
    assert_eq!(float.status, ReportStatus::GroundTruthFailure);
    assert!(float.has_issue(IssueKind::GroundTruthFailure));
    assert!(float.issues[0].detail.contains("no float kernel"));
    assert_eq!(engine.ground_truth().builds(), 2);
}

#[test]
fn test_non_reentrant_test_runs_serially() {
    let root = tempfile::tempdir().unwrap();
    let run = RunSettings { reentrant: false, ..Default::default() };
    let engine = engine(process(), root.path()).with_run_settings(run);
    let options = AutoRunOptions { parallel: 4, ..Default::default() };

    let combined = run_all(&engine, &store(), &options).unwrap();

    assert_eq!(combined.entries.len(), 5);
    assert!(engine.artifacts().peak_active() <= 2);
}

#[test]
fn test_cancelled_run_reports_every_row() {
    let root = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    let engine = engine(process(), root.path()).with_cancel_token(cancel);

    let combined = run_all(&engine, &store(), &AutoRunOptions::default()).unwrap();

    assert_eq!(combined.entries.len(), 5);
    assert_eq!(combined.count_status(ReportStatus::Aborted), 5);
    assert!(combined.entries.iter().all(|e| e.report.has_issue(IssueKind::Cancelled)));
    assert_eq!(engine.artifacts().acquired(), 0);
}

#[test]
fn test_results_csv_to_exports() {
    let dir = tempfile::tempdir().unwrap();
    let results = dir.path().join("results.csv");
    std::fs::write(
        &results,
        "name,precision,compiler,optl,switches,comparison\n\
         ,double,g++,-O3,-ffast-math,0.25\n\
         ,double,g++,-O2,,0\n",
    )
    .unwrap();

    let store = ResultsStore::load(&results).unwrap();
    let engine = engine(process(), &dir.path().join("work"));
    let options = AutoRunOptions { default_test: "Dot".into(), ..Default::default() };
    let combined = run_all(&engine, &store, &options).unwrap();

    assert_eq!(combined.entries.len(), 1);
    assert_eq!(combined.entries[0].report.test, "Dot");

    let csv_path = dir.path().join("out/findings.csv");
    CsvExporter::new().export(&combined, &csv_path).unwrap();
    let mut reader = csv::Reader::from_path(&csv_path).unwrap();
    let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
    assert_eq!(headers, CSV_HEADERS);
    let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0][6], "unit2.cpp");

    let markdown = render_markdown(&combined);
    assert!(markdown.contains("unit2.cpp"));
    assert!(markdown.contains("g++ -O3 -ffast-math"));
}

#[test]
fn test_setup_error_is_not_reported_as_build_failure() {
    let root = tempfile::tempdir().unwrap();
    let engine = BisectEngine::new(
        Arc::new(MockBuildPipeline::new(Vec::<String>::new())),
        Arc::new(process()),
        Arc::new(NumericComparator::new(0.0)),
        Arc::new(ArtifactManager::new(root.path(), true).unwrap()),
        FlagSet::parse("g++ -O0").unwrap(),
    );
    let store = ResultsStore::from_rows(vec![row("double", "-O3", "-ffast-math", Some(0.5))]);

    let combined = run_all(&engine, &store, &AutoRunOptions::default()).unwrap();

    let report = &combined.entries[0].report;
    assert_eq!(report.status, ReportStatus::Aborted);
    assert!(report.has_issue(IssueKind::EngineError));
    assert!(!report.has_issue(IssueKind::BuildFailure));
}
