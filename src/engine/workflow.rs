//! Two-phase bisection of one configuration.
//!
//! This module composes the `BuildPipeline`, `ProcessRunner` and `Comparator`
//! collaborators into a complete bisection:
//!
//! 1. Establish (or reuse) the ground-truth baseline
//! 2. Confirm that the all-variant build diverges
//! 3. Bisect compilation units down to the minimal suspect files
//! 4. For every suspect file, bisect its symbols down to the minimal suspect functions
//!
//! Phases 3 and 4 each end with a verification trial that makes exactly the suspects
//! variant, so the report shows whether they reproduce the divergence on their own.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, info_span, warn};

use crate::artifacts::ArtifactManager;
use crate::build::BuildPipeline;
use crate::core::{Candidate, CompilationUnit, FlagSet, Score, SymbolSite, TrialOutcome};
use crate::report::{BisectReport, FileFinding, Issue, IssueKind, ReportStatus, SymbolFinding};
use crate::storage::JsonlWriter;
use crate::{BisectError, BisectResult};

use super::bisect::{Partitioner, Suspect};
use super::compare::Comparator;
use super::exec::{CancelToken, ProcessRunner};
use super::ground_truth::GroundTruthManager;
use super::trial::{RunSettings, TestTarget, TrialEnv, TrialObserver, TrialRunner};

/// Knobs that apply to every bisection of an engine.
#[derive(Debug, Clone)]
pub struct BisectSettings {
    /// Per-command build timeout (zero = none)
    pub build_timeout: Duration,
    /// Run the suspects-only verification trials
    pub verify: bool,
    /// Run the symbol phase for suspect files
    pub symbols: bool,
}

impl Default for BisectSettings {
    fn default() -> Self {
        BisectSettings { build_timeout: Duration::ZERO, verify: true, symbols: true }
    }
}

/// One configuration to bisect.
#[derive(Debug, Clone)]
pub struct BisectRequest {
    pub test: String,
    pub precision: String,
    /// Flag set under investigation
    pub variant: FlagSet,
    /// Concurrent compiles within one build
    pub jobs: usize,
}

impl BisectRequest {
    pub fn new(test: impl Into<String>, precision: impl Into<String>, variant: FlagSet) -> Self {
        BisectRequest { test: test.into(), precision: precision.into(), variant, jobs: 1 }
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }
}

/// Bisection engine shared by the single-configuration command and the auto run.
pub struct BisectEngine {
    pipeline: Arc<dyn BuildPipeline>,
    process: Arc<dyn ProcessRunner>,
    comparator: Arc<dyn Comparator>,
    artifacts: Arc<ArtifactManager>,
    ground_truth: GroundTruthManager,
    trusted: FlagSet,
    run: RunSettings,
    settings: BisectSettings,
    cancel: CancelToken,
    trial_log: Option<JsonlWriter>,
}

impl BisectEngine {
    pub fn new(
        pipeline: Arc<dyn BuildPipeline>,
        process: Arc<dyn ProcessRunner>,
        comparator: Arc<dyn Comparator>,
        artifacts: Arc<ArtifactManager>,
        trusted: FlagSet,
    ) -> Self {
        BisectEngine {
            pipeline,
            process,
            comparator,
            artifacts,
            ground_truth: GroundTruthManager::new(),
            trusted,
            run: RunSettings::default(),
            settings: BisectSettings::default(),
            cancel: CancelToken::new(),
            trial_log: None,
        }
    }

    pub fn with_run_settings(mut self, run: RunSettings) -> Self {
        self.run = run;
        self
    }

    pub fn with_settings(mut self, settings: BisectSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_trial_log(mut self, log: JsonlWriter) -> Self {
        self.trial_log = Some(log);
        self
    }

    pub fn trusted(&self) -> &FlagSet {
        &self.trusted
    }

    pub fn run_settings(&self) -> &RunSettings {
        &self.run
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn artifacts(&self) -> &ArtifactManager {
        &self.artifacts
    }

    pub fn ground_truth(&self) -> &GroundTruthManager {
        &self.ground_truth
    }

    pub fn pipeline(&self) -> &dyn BuildPipeline {
        self.pipeline.as_ref()
    }

    fn env(&self, jobs: usize) -> TrialEnv<'_> {
        TrialEnv {
            pipeline: self.pipeline.as_ref(),
            process: self.process.as_ref(),
            artifacts: &self.artifacts,
            run: &self.run,
            cancel: &self.cancel,
            jobs: jobs.max(1),
            build_timeout: self.settings.build_timeout,
        }
    }

    /// Run the full two-phase bisection for one configuration.
    pub fn bisect(&self, request: &BisectRequest) -> BisectResult<BisectReport> {
        self.bisect_with_observer(request, None)
    }

    /// Like `bisect`, calling `observer` with every trial as it is recorded.
    ///
    /// # Errors
    /// `BisectError::GroundTruth` when no baseline can be established; other errors
    /// when the target's units cannot be listed. Failures of individual trials are
    /// reported in the returned report instead.
    pub fn bisect_with_observer(
        &self,
        request: &BisectRequest,
        observer: Option<&TrialObserver<'_>>,
    ) -> BisectResult<BisectReport> {
        let target = TestTarget::new(&request.test, &request.precision);
        let _span =
            info_span!("bisect", target_test = %target, variant = %request.variant).entered();

        let mut report = BisectReport::new(
            &request.test,
            &request.precision,
            self.trusted.to_string(),
            request.variant.to_string(),
        );

        let units = self.pipeline.units()?;
        if units.is_empty() {
            return Err(BisectError::Message(format!(
                "build pipeline '{}' lists no compilation units",
                self.pipeline.name()
            )));
        }

        let env = self.env(request.jobs);
        let baseline = self.ground_truth.establish(&env, &self.trusted, &target)?;
        let runner = TrialRunner::new(
            env,
            self.comparator.as_ref(),
            baseline,
            &self.trusted,
            &request.variant,
            &target,
        )
        .with_observer(observer)
        .with_log(self.trial_log.as_ref());

        self.run_phases(&runner, &units, &mut report)?;

        if self.cancel.is_cancelled() && report.status == ReportStatus::Completed {
            report.status = ReportStatus::Aborted;
        }
        report.trials = runner.records();
        report.trials_executed = runner.executed();
        info!(
            status = report.status.label(),
            files = report.files.len(),
            symbols = report.symbol_count(),
            trials = report.trials_executed,
            "bisection finished"
        );
        Ok(report)
    }

    fn run_phases(
        &self,
        runner: &TrialRunner<'_>,
        units: &[CompilationUnit],
        report: &mut BisectReport,
    ) -> BisectResult<()> {
        let files = Partitioner::for_units(runner, units);
        let whole = match files.confirm()? {
            Ok(score) => score,
            Err(failure) => {
                report.status = ReportStatus::Aborted;
                report.issues.push(Issue::from_failure("all files variant", &failure));
                return Ok(());
            }
        };
        report.whole_score = Some(whole);
        if !whole.is_divergent() {
            info!("all-variant build matches ground truth");
            report.status = ReportStatus::NoDivergence;
            return Ok(());
        }

        info!(units = units.len(), score = %whole, "bisecting files");
        let outcome = files.search(whole)?;
        report.interactions.extend(outcome.interactions);
        report.issues.extend(outcome.issues);
        if outcome.cancelled {
            report.status = ReportStatus::Aborted;
        }

        if self.settings.verify && !outcome.suspects.is_empty() {
            let subset: Vec<CompilationUnit> =
                outcome.suspects.iter().map(|s| s.candidate.clone()).collect();
            report.verification_score =
                self.verification(files.verify(&subset)?, "suspect files variant", report);
        }

        for Suspect { candidate: unit, score } in outcome.suspects {
            let mut finding = FileFinding {
                unit,
                score,
                symbols: Vec::new(),
                symbol_verification_score: None,
            };
            if self.settings.symbols {
                if self.cancel.is_cancelled() {
                    report.issues.push(Issue::new(
                        IssueKind::Cancelled,
                        format!("symbols of {}", finding.unit),
                        "symbol search skipped",
                    ));
                } else {
                    self.bisect_symbols(runner, &mut finding, report)?;
                }
            }
            report.files.push(finding);
        }
        Ok(())
    }

    fn bisect_symbols(
        &self,
        runner: &TrialRunner<'_>,
        finding: &mut FileFinding,
        report: &mut BisectReport,
    ) -> BisectResult<()> {
        let unit = finding.unit.clone();
        let context = format!("symbols of {unit}");

        let symbols = match self.extract_symbols(runner, &unit) {
            Ok(symbols) if symbols.is_empty() => {
                report.issues.push(Issue::new(
                    IssueKind::NoSymbols,
                    context,
                    "no global function symbols",
                ));
                return Ok(());
            }
            Ok(symbols) => symbols,
            Err(e) => {
                warn!(unit = %unit, error = %e, "symbol extraction failed");
                report.issues.push(Issue::new(IssueKind::NoSymbols, context, e.to_string()));
                return Ok(());
            }
        };

        let partitioner = Partitioner::for_symbols(runner, &unit, &symbols);
        let whole = match partitioner.confirm()? {
            Ok(score) => score,
            Err(failure) => {
                report.issues.push(Issue::from_failure(context, &failure));
                return Ok(());
            }
        };
        if !whole.is_divergent() {
            report.issues.push(Issue::new(
                IssueKind::SymbolsNotReproducing,
                context,
                format!(
                    "{unit} diverges but its {} symbols do not when swapped together",
                    symbols.len()
                ),
            ));
            return Ok(());
        }

        info!(unit = %unit, symbols = symbols.len(), score = %whole, "bisecting symbols");
        let outcome = partitioner.search(whole)?;
        report.interactions.extend(outcome.interactions);
        report.issues.extend(outcome.issues);
        if outcome.cancelled {
            report.status = ReportStatus::Aborted;
        }

        if self.settings.verify && !outcome.suspects.is_empty() {
            let subset: Vec<SymbolSite> =
                outcome.suspects.iter().map(|s| s.candidate.clone()).collect();
            let label = format!("suspect symbols of {unit} variant");
            finding.symbol_verification_score =
                self.verification(partitioner.verify(&subset)?, &label, report);
        }

        finding.symbols = outcome
            .suspects
            .into_iter()
            .map(|s| SymbolFinding { site: s.candidate, score: s.score })
            .collect();
        Ok(())
    }

    /// Symbols of `unit`, extracted from a trusted build in a scratch workspace.
    fn extract_symbols(
        &self,
        runner: &TrialRunner<'_>,
        unit: &CompilationUnit,
    ) -> BisectResult<Vec<SymbolSite>> {
        let env = runner.env();
        let workspace = env.artifacts.acquire(&format!("symbols-{}", unit.object_stem()))?;
        let symbols = env.pipeline.symbols(
            unit,
            &self.trusted,
            workspace.path(),
            env.build_timeout,
            env.cancel,
        )?;
        workspace.release()?;

        // Partition keys are symbol names; keep the first site of each.
        let mut seen = BTreeSet::new();
        Ok(symbols.into_iter().filter(|s| seen.insert(s.key())).collect())
    }

    fn verification(
        &self,
        outcome: TrialOutcome,
        context: &str,
        report: &mut BisectReport,
    ) -> Option<Score> {
        match outcome {
            Ok(score) => {
                info!(context, score = %score, "verification");
                Some(score)
            }
            Err(failure) => {
                report.issues.push(Issue::from_failure(context, &failure));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::MockBuildPipeline;
    use crate::engine::compare::NumericComparator;
    use crate::engine::exec::{MockResponse, MockRunner};

    fn engine(pipeline: MockBuildPipeline, root: &std::path::Path) -> BisectEngine {
        let process = MockRunner::from_manifest(|m, _| {
            let unit = m.is_variant_unit("unit3.cpp");
            let symbol = m.is_variant_symbol("unit3.cpp", "hot");
            let value = if unit || symbol { 1.25 } else { 1.0 };
            MockResponse::Output(format!("{value}\n"))
        });
        BisectEngine::new(
            Arc::new(pipeline),
            Arc::new(process),
            Arc::new(NumericComparator::new(0.0)),
            Arc::new(ArtifactManager::new(root, true).unwrap()),
            FlagSet::parse("g++ -O0").unwrap(),
        )
    }

    #[test]
    fn test_two_phase_bisection_finds_file_and_symbol() {
        let root = tempfile::tempdir().unwrap();
        let pipeline =
            MockBuildPipeline::numbered(4).with_symbols("unit3.cpp", &["cold", "hot", "warm"]);
        let engine = engine(pipeline, root.path());
        let request = BisectRequest::new("Dot", "double", FlagSet::parse("g++ -O3").unwrap());

        let report = engine.bisect(&request).unwrap();

        assert_eq!(report.status, ReportStatus::Completed);
        assert_eq!(report.file_keys(), vec!["unit3.cpp"]);
        let symbols: Vec<&str> =
            report.files[0].symbols.iter().map(|s| s.site.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["hot"]);
        assert_eq!(report.verification_score, Some(Score::new(0.25)));
        assert_eq!(report.files[0].symbol_verification_score, Some(Score::new(0.25)));
        assert!(report.issues.is_empty());
        let built = report.trials.iter().filter(|t| !t.cached).count();
        assert_eq!(built, report.trials_executed);
        assert!(report.trials.len() > built);
        assert_eq!(engine.artifacts().disk_usage(), 0);
    }

    #[test]
    fn test_no_divergence_stops_after_precondition() {
        let root = tempfile::tempdir().unwrap();
        // unit3 is the only culprit and a two-unit target does not have it
        let engine = engine(MockBuildPipeline::numbered(2), root.path());
        let request = BisectRequest::new("Dot", "double", FlagSet::parse("g++ -O3").unwrap());

        let report = engine.bisect(&request).unwrap();
        assert_eq!(report.status, ReportStatus::NoDivergence);
        assert_eq!(report.trials_executed, 1);
        assert!(report.files.is_empty());
    }

    #[test]
    fn test_missing_symbols_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(MockBuildPipeline::numbered(3), root.path());
        let request = BisectRequest::new("Dot", "double", FlagSet::parse("g++ -O3").unwrap());

        let report = engine.bisect(&request).unwrap();
        assert_eq!(report.file_keys(), vec!["unit3.cpp"]);
        assert!(report.has_issue(IssueKind::NoSymbols));
        assert!(report.files[0].symbols.is_empty());
    }
}
