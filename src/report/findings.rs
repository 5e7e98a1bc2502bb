//! Report structures for one bisection and for a whole auto run.
//!
//! `BisectReport` is the stable per-configuration output: the minimal suspect files, the
//! suspect symbols inside each of them, every trial that was run, and the issues that
//! stopped a branch. `CombinedReport` keys these by the results-store row they came from.

use serde::{Deserialize, Serialize};

use crate::core::{
    CompilationUnit, EnvironmentInfo, FailureKind, SCHEMA_VERSION, Score, SymbolSite,
    TrialFailure, TrialRecord,
};
use crate::storage::ResultRow;

/// Schema version for CombinedReport
pub const COMBINED_REPORT_VERSION: u32 = 1;

/// Something the operator must look at; never silently resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// No baseline could be produced; the configuration was abandoned
    GroundTruthFailure,
    /// A partition did not compile or link
    BuildFailure,
    /// A trial exited non-zero or timed out
    RuntimeFailure,
    /// Neither half diverged on its own
    InteractionDetected,
    /// The run was cancelled before the branch finished
    Cancelled,
    /// A suspect file exposed no splittable symbols
    NoSymbols,
    /// The file diverges but none of its symbols do in isolation
    SymbolsNotReproducing,
    /// The configuration stopped on an error outside any trial (sources, I/O, comparison)
    EngineError,
}

impl IssueKind {
    /// Get emoji representation for markdown.
    pub fn emoji(&self) -> &'static str {
        match self {
            IssueKind::GroundTruthFailure => "❌",
            IssueKind::BuildFailure => "🔨",
            IssueKind::RuntimeFailure => "💥",
            IssueKind::InteractionDetected => "🔀",
            IssueKind::Cancelled => "⏹️",
            IssueKind::NoSymbols => "⚠️",
            IssueKind::SymbolsNotReproducing => "⚠️",
            IssueKind::EngineError => "🛑",
        }
    }

    /// Get short text label.
    pub fn label(&self) -> &'static str {
        match self {
            IssueKind::GroundTruthFailure => "GROUND_TRUTH",
            IssueKind::BuildFailure => "BUILD",
            IssueKind::RuntimeFailure => "RUNTIME",
            IssueKind::InteractionDetected => "INTERACTION",
            IssueKind::Cancelled => "CANCELLED",
            IssueKind::NoSymbols => "NO_SYMBOLS",
            IssueKind::SymbolsNotReproducing => "NOT_REPRODUCING",
            IssueKind::EngineError => "ENGINE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    /// Partition or unit the issue belongs to
    pub context: String,
    pub detail: String,
}

impl Issue {
    pub fn new(kind: IssueKind, context: impl Into<String>, detail: impl Into<String>) -> Self {
        Issue { kind, context: context.into(), detail: detail.into() }
    }

    /// Surface a failed trial.
    pub fn from_failure(context: impl Into<String>, failure: &TrialFailure) -> Self {
        let kind = match failure.kind {
            FailureKind::Build => IssueKind::BuildFailure,
            FailureKind::Runtime => IssueKind::RuntimeFailure,
        };
        Issue::new(kind, context, failure.detail.clone())
    }
}

/// A candidate set that diverges as a whole while neither of its halves does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    /// What was being split, e.g. `files` or `symbols of a.cpp`
    pub scope: String,
    /// Every member of the set that hit the (0, 0) case
    pub members: Vec<String>,
    /// Members that diverge when made variant alone
    pub attributed: Vec<String>,
}

impl Interaction {
    /// Members whose contribution could not be isolated.
    pub fn unattributed(&self) -> Vec<&str> {
        self.members
            .iter()
            .filter(|m| !self.attributed.contains(m))
            .map(String::as_str)
            .collect()
    }
}

/// How a configuration's bisection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    /// Search ran to completion
    Completed,
    /// The all-variant build already matched the baseline
    NoDivergence,
    /// No baseline; nothing could be compared
    GroundTruthFailure,
    /// The precondition trial failed or the run was cancelled
    Aborted,
}

impl ReportStatus {
    pub fn emoji(&self) -> &'static str {
        match self {
            ReportStatus::Completed => "✅",
            ReportStatus::NoDivergence => "⚪",
            ReportStatus::GroundTruthFailure => "❌",
            ReportStatus::Aborted => "⚠️",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReportStatus::Completed => "COMPLETED",
            ReportStatus::NoDivergence => "NO_DIVERGENCE",
            ReportStatus::GroundTruthFailure => "NO_BASELINE",
            ReportStatus::Aborted => "ABORTED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolFinding {
    pub site: SymbolSite,
    pub score: Score,
}

/// A minimal suspect file together with the symbol search run inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileFinding {
    pub unit: CompilationUnit,
    pub score: Score,
    #[serde(default)]
    pub symbols: Vec<SymbolFinding>,
    /// Score with exactly the suspect symbols variant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_verification_score: Option<Score>,
}

/// Findings of the two-phase bisection for one configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BisectReport {
    pub schema_version: u32,
    pub test: String,
    pub precision: String,
    /// Trusted flag set, as `compiler opt switches`
    pub trusted: String,
    /// Variant flag set under investigation
    pub variant: String,
    pub status: ReportStatus,
    /// Score of the all-variant build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whole_score: Option<Score>,
    pub files: Vec<FileFinding>,
    #[serde(default)]
    pub interactions: Vec<Interaction>,
    #[serde(default)]
    pub issues: Vec<Issue>,
    /// Score with exactly the suspect files variant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_score: Option<Score>,
    #[serde(default)]
    pub trials: Vec<TrialRecord>,
    /// Trials actually built and run (memoized repeats excluded)
    pub trials_executed: usize,
    pub generated_at: String,
}

impl BisectReport {
    pub fn new(
        test: impl Into<String>,
        precision: impl Into<String>,
        trusted: impl Into<String>,
        variant: impl Into<String>,
    ) -> Self {
        BisectReport {
            schema_version: SCHEMA_VERSION,
            test: test.into(),
            precision: precision.into(),
            trusted: trusted.into(),
            variant: variant.into(),
            status: ReportStatus::Completed,
            whole_score: None,
            files: Vec::new(),
            interactions: Vec::new(),
            issues: Vec::new(),
            verification_score: None,
            trials: Vec::new(),
            trials_executed: 0,
            generated_at: crate::now_string(),
        }
    }

    /// Report for a configuration whose baseline could not be established.
    pub fn ground_truth_failure(mut self, detail: impl Into<String>) -> Self {
        self.status = ReportStatus::GroundTruthFailure;
        let context = format!("{} {}", self.precision, self.trusted);
        self.issues.push(Issue::new(IssueKind::GroundTruthFailure, context, detail));
        self
    }

    pub fn symbol_count(&self) -> usize {
        self.files.iter().map(|f| f.symbols.len()).sum()
    }

    pub fn has_issue(&self, kind: IssueKind) -> bool {
        self.issues.iter().any(|i| i.kind == kind)
    }

    /// Keys of the suspect files, in search order.
    pub fn file_keys(&self) -> Vec<String> {
        self.files.iter().map(|f| crate::core::schema::unit_key(&f.unit.path)).collect()
    }
}

/// One results-store row and what its bisection found.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigReport {
    /// Position of the row in the results store
    pub index: usize,
    pub row: ResultRow,
    pub report: BisectReport,
}

/// Every flagged configuration of one auto run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedReport {
    pub version: u32,
    pub generated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentInfo>,
    pub trusted: String,
    pub rows_total: usize,
    /// Rows dropped because their recorded comparison was zero or missing
    pub rows_skipped: usize,
    pub entries: Vec<ConfigReport>,
}

impl CombinedReport {
    pub fn new(trusted: impl Into<String>, rows_total: usize, rows_skipped: usize) -> Self {
        CombinedReport {
            version: COMBINED_REPORT_VERSION,
            generated_at: crate::now_string(),
            environment: None,
            trusted: trusted.into(),
            rows_total,
            rows_skipped,
            entries: Vec::new(),
        }
    }

    pub fn with_environment(mut self, env: EnvironmentInfo) -> Self {
        self.environment = Some(env);
        self
    }

    pub fn count_status(&self, status: ReportStatus) -> usize {
        self.entries.iter().filter(|e| e.report.status == status).count()
    }

    pub fn issue_count(&self) -> usize {
        self.entries.iter().map(|e| e.report.issues.len()).sum()
    }
}
