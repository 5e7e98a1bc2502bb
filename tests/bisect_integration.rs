//! Integration tests for single-configuration bisection.
//!
//! Every scenario runs against `MockBuildPipeline` and `MockRunner`: the mock test
//! executable prints `1 + <number of guilty elements compiled with the variant flags>`,
//! so no compiler is required.

use std::path::Path;
use std::sync::{Arc, Mutex};

use fp_bisect::BisectError;
use fp_bisect::artifacts::ArtifactManager;
use fp_bisect::build::MockBuildPipeline;
use fp_bisect::core::{FlagSet, Score, TrialRecord};
use fp_bisect::engine::{
    BisectEngine, BisectRequest, BisectSettings, MockResponse, MockRunner, NumericComparator,
};
use fp_bisect::report::{BisectReport, IssueKind, ReportStatus};
use fp_bisect::storage::JsonlWriter;

/// Output diverges by one per guilty unit compiled with the variant flags.
fn guilty_units(units: &'static [&'static str]) -> MockRunner {
    MockRunner::from_manifest(move |m, _| {
        let n = units.iter().filter(|u| m.is_variant_unit(u)).count();
        MockResponse::Output(format!("{}\n", 1 + n))
    })
}

fn engine(pipeline: MockBuildPipeline, process: MockRunner, root: &Path) -> BisectEngine {
    BisectEngine::new(
        Arc::new(pipeline),
        Arc::new(process),
        Arc::new(NumericComparator::new(0.0)),
        Arc::new(ArtifactManager::new(root, true).unwrap()),
        FlagSet::parse("g++ -O0").unwrap(),
    )
    .with_settings(BisectSettings { symbols: false, ..Default::default() })
}

fn request() -> BisectRequest {
    BisectRequest::new("Dot", "double", FlagSet::parse("g++ -O3 -ffast-math").unwrap())
}

fn bisect(pipeline: MockBuildPipeline, process: MockRunner) -> BisectReport {
    let root = tempfile::tempdir().unwrap();
    engine(pipeline, process, root.path()).bisect(&request()).unwrap()
}

#[test]
fn test_single_guilty_file_among_six() {
    let report = bisect(MockBuildPipeline::numbered(6), guilty_units(&["unit4.cpp"]));

    assert_eq!(report.status, ReportStatus::Completed);
    assert_eq!(report.file_keys(), vec!["unit4.cpp"]);
    assert_eq!(report.files[0].score, Score::new(1.0));
    assert!(report.issues.is_empty(), "unexpected issues: {:?}", report.issues);
    // precondition plus three halving rounds
    assert!(report.trials_executed <= 7, "took {} trials", report.trials_executed);
}

#[test]
fn test_independent_files_are_all_reported() {
    let report =
        bisect(MockBuildPipeline::numbered(6), guilty_units(&["unit2.cpp", "unit5.cpp"]));

    assert_eq!(report.file_keys(), vec!["unit2.cpp", "unit5.cpp"]);
    assert!(report.interactions.is_empty());
}

#[test]
fn test_verification_reproduces_whole_score() {
    let report =
        bisect(MockBuildPipeline::numbered(8), guilty_units(&["unit1.cpp", "unit7.cpp"]));

    assert_eq!(report.whole_score, Some(Score::new(2.0)));
    assert_eq!(report.verification_score, report.whole_score);
}

#[test]
fn test_bisection_is_deterministic() {
    let run = || bisect(MockBuildPipeline::numbered(7), guilty_units(&["unit3.cpp", "unit6.cpp"]));
    let a = run();
    let b = run();

    assert_eq!(a.file_keys(), b.file_keys());
    let signatures = |r: &BisectReport| -> Vec<String> {
        r.trials.iter().map(|t| t.signature.clone()).collect()
    };
    assert_eq!(signatures(&a), signatures(&b));
    assert_eq!(a.trials_executed, b.trials_executed);
}

#[test]
fn test_interaction_is_flagged_not_guessed() {
    // Diverges only when unit1 and unit2 are both variant.
    let process = MockRunner::from_manifest(|m, _| {
        let both = m.is_variant_unit("unit1.cpp") && m.is_variant_unit("unit2.cpp");
        MockResponse::Output(if both { "2\n" } else { "1\n" }.to_string())
    });
    let report = bisect(MockBuildPipeline::numbered(4), process);

    assert_eq!(report.status, ReportStatus::Completed);
    assert!(report.files.is_empty());
    assert!(report.has_issue(IssueKind::InteractionDetected));
    assert_eq!(report.interactions.len(), 1);
    let interaction = &report.interactions[0];
    assert_eq!(interaction.scope, "files");
    assert_eq!(interaction.members, vec!["unit1.cpp", "unit2.cpp"]);
    assert!(interaction.attributed.is_empty());
}

#[test]
fn test_hung_half_only_abandons_its_branch() {
    let process = MockRunner::from_manifest(|m, _| {
        if m.is_variant_unit("unit2.cpp") && !m.is_variant_unit("unit4.cpp") {
            return MockResponse::Hang;
        }
        let value = if m.is_variant_unit("unit4.cpp") { 2 } else { 1 };
        MockResponse::Output(format!("{value}\n"))
    });
    let report = bisect(MockBuildPipeline::numbered(4), process);

    assert_eq!(report.status, ReportStatus::Completed);
    assert_eq!(report.file_keys(), vec!["unit4.cpp"]);
    let runtime: Vec<_> =
        report.issues.iter().filter(|i| i.kind == IssueKind::RuntimeFailure).collect();
    assert_eq!(runtime.len(), 1);
    assert!(runtime[0].detail.contains("timed out"));
}

#[test]
fn test_precondition_build_failure_aborts_configuration() {
    let root = tempfile::tempdir().unwrap();
    let pipeline = MockBuildPipeline::numbered(3).failing_when_variant("unit1.cpp");
    let engine = engine(pipeline, guilty_units(&["unit2.cpp"]), root.path());

    let report = engine.bisect(&request()).unwrap();
    assert_eq!(report.status, ReportStatus::Aborted);
    assert!(report.has_issue(IssueKind::BuildFailure));
    assert!(report.files.is_empty());
    assert_eq!(engine.artifacts().active(), 0);
    assert_eq!(engine.artifacts().disk_usage(), 0);
}

#[test]
fn test_ground_truth_failure_is_an_error() {
    let process = MockRunner::from_manifest(|m, _| {
        if m.is_all_trusted() {
            MockResponse::Exit { code: 139, stderr: "Segmentation fault".into() }
        } else {
            MockResponse::Output("1\n".into())
        }
    });
    let root = tempfile::tempdir().unwrap();
    let engine = engine(MockBuildPipeline::numbered(3), process, root.path());

    let err = engine.bisect(&request()).unwrap_err();
    assert!(matches!(err, BisectError::GroundTruth { .. }), "got {err}");
    assert!(err.to_string().contains("Segmentation fault"));

    // cached: the second attempt does not rebuild
    assert!(engine.bisect(&request()).is_err());
    assert_eq!(engine.ground_truth().builds(), 1);
}

#[test]
fn test_symbol_phase_finds_every_guilty_symbol() {
    let process = MockRunner::from_manifest(|m, _| {
        let n = ["b", "d"].iter().filter(|s| m.is_variant_symbol("unit3.cpp", s)).count();
        MockResponse::Output(format!("{}\n", 1 + n))
    });
    let pipeline =
        MockBuildPipeline::numbered(4).with_symbols("unit3.cpp", &["a", "b", "c", "d"]);
    let root = tempfile::tempdir().unwrap();
    let engine = engine(pipeline, process, root.path()).with_settings(BisectSettings::default());

    let report = engine.bisect(&request()).unwrap();

    assert_eq!(report.file_keys(), vec!["unit3.cpp"]);
    let file = &report.files[0];
    let symbols: Vec<&str> = file.symbols.iter().map(|s| s.site.symbol.as_str()).collect();
    assert_eq!(symbols, vec!["b", "d"]);
    assert!(file.symbols.iter().all(|s| s.score == Score::new(1.0)));
    assert_eq!(file.symbol_verification_score, Some(Score::new(2.0)));
    assert_eq!(file.symbols[1].site.location(), "unit3.cpp:40");
    assert!(report.issues.is_empty(), "unexpected issues: {:?}", report.issues);
}

#[test]
fn test_observer_and_trial_log_see_every_trial() {
    let root = tempfile::tempdir().unwrap();
    let log_path = root.path().join("trials.jsonl");
    let engine = engine(
        MockBuildPipeline::numbered(5),
        guilty_units(&["unit5.cpp"]),
        &root.path().join("work"),
    )
    .with_trial_log(JsonlWriter::new(&log_path));

    let seen = Mutex::new(Vec::new());
    let observer = |record: &TrialRecord| seen.lock().unwrap().push(record.seq);
    let report = engine.bisect_with_observer(&request(), Some(&observer)).unwrap();

    let seen = seen.into_inner().unwrap();
    assert_eq!(seen.len(), report.trials.len());
    assert_eq!(seen, (1..=seen.len()).collect::<Vec<_>>());

    let logged = JsonlWriter::new(&log_path).read_all().unwrap();
    assert_eq!(logged.len(), report.trials.len());
    assert_eq!(logged[0].description, report.trials[0].description);
}

#[test]
fn test_kept_artifacts_stay_on_disk() {
    let root = tempfile::tempdir().unwrap();
    let engine = BisectEngine::new(
        Arc::new(MockBuildPipeline::numbered(4)),
        Arc::new(guilty_units(&["unit1.cpp"])),
        Arc::new(NumericComparator::new(0.0)),
        Arc::new(ArtifactManager::new(root.path(), false).unwrap()),
        FlagSet::parse("g++ -O0").unwrap(),
    )
    .with_settings(BisectSettings { symbols: false, ..Default::default() });

    let report = engine.bisect(&request()).unwrap();
    assert_eq!(report.file_keys(), vec!["unit1.cpp"]);
    assert_eq!(engine.artifacts().active(), 0);
    assert!(engine.artifacts().disk_usage() > 0);

    let dirs = std::fs::read_dir(root.path()).unwrap().count();
    assert_eq!(dirs, engine.artifacts().acquired());
}
