//! Auto run: bisect every flagged configuration of a results store.
//!
//! Configurations run on a bounded pool of `parallel` worker threads; each build inside
//! them compiles at most `jobs` units at a time. A configuration that fails (no baseline,
//! cancelled) is reported and never stops the others.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{info, warn};

use crate::report::{BisectReport, CombinedReport, ConfigReport, Issue, IssueKind, ReportStatus};
use crate::storage::{ResultRow, ResultsStore};
use crate::{BisectError, BisectResult};

use super::workflow::{BisectEngine, BisectRequest};

/// Concurrency and defaults for an auto run.
#[derive(Debug, Clone)]
pub struct AutoRunOptions {
    /// Configurations bisected at the same time
    pub parallel: usize,
    /// Concurrent compiles within one build
    pub jobs: usize,
    /// Test used for rows that leave `name` empty
    pub default_test: String,
}

impl Default for AutoRunOptions {
    fn default() -> Self {
        AutoRunOptions { parallel: 1, jobs: 1, default_test: String::new() }
    }
}

impl AutoRunOptions {
    /// Worker count actually used for `pending` configurations.
    ///
    /// A non-reentrant test writes to fixed paths, so its trials are serialized.
    pub fn effective_parallel(&self, reentrant: bool, pending: usize) -> usize {
        let parallel = if reentrant { self.parallel.max(1) } else { 1 };
        parallel.min(pending.max(1))
    }
}

/// Bisect every flagged row of `store` and combine the reports.
///
/// Rows whose recorded comparison is zero or missing are skipped and do not appear in
/// the result. Entries are ordered by row position regardless of completion order.
pub fn run_all(
    engine: &BisectEngine,
    store: &ResultsStore,
    options: &AutoRunOptions,
) -> BisectResult<CombinedReport> {
    let flagged = store.flagged();
    let skipped = store.len() - flagged.len();
    let reentrant = engine.run_settings().reentrant;
    let workers = options.effective_parallel(reentrant, flagged.len());
    if !reentrant && options.parallel > 1 {
        warn!(
            requested = options.parallel,
            "test is not reentrant, running configurations one at a time"
        );
    }
    info!(
        rows = store.len(),
        flagged = flagged.len(),
        skipped,
        parallel = workers,
        jobs = options.jobs,
        "starting auto run"
    );

    let next = AtomicUsize::new(0);
    let entries: Mutex<Vec<ConfigReport>> = Mutex::new(Vec::with_capacity(flagged.len()));

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let i = next.fetch_add(1, Ordering::SeqCst);
                    let Some(&(index, row)) = flagged.get(i) else {
                        break;
                    };
                    let report = bisect_row(engine, row, options);
                    info!(
                        index,
                        status = report.status.label(),
                        files = report.files.len(),
                        "configuration finished"
                    );
                    let entry = ConfigReport { index, row: row.clone(), report };
                    entries.lock().unwrap_or_else(|e| e.into_inner()).push(entry);
                }
            });
        }
    });

    let mut entries = entries.into_inner().unwrap_or_else(|e| e.into_inner());
    entries.sort_by_key(|e| e.index);

    let mut combined = CombinedReport::new(engine.trusted().to_string(), store.len(), skipped);
    combined.entries = entries;
    Ok(combined)
}

fn bisect_row(engine: &BisectEngine, row: &ResultRow, options: &AutoRunOptions) -> BisectReport {
    let test = row.test_or(&options.default_test).to_string();
    let variant = row.to_flagset();
    let blank = || {
        BisectReport::new(
            test.clone(),
            row.precision.clone(),
            engine.trusted().to_string(),
            variant.to_string(),
        )
    };

    if engine.cancel_token().is_cancelled() {
        let mut report = blank();
        report.status = ReportStatus::Aborted;
        report.issues.push(Issue::new(IssueKind::Cancelled, variant.to_string(), "not started"));
        return report;
    }

    let request = BisectRequest::new(test.clone(), row.precision.clone(), variant.clone())
        .with_jobs(options.jobs);
    match engine.bisect(&request) {
        Ok(report) => report,
        Err(BisectError::GroundTruth { detail, .. }) => blank().ground_truth_failure(detail),
        Err(e) => {
            warn!(test = %test, variant = %variant, error = %e, "configuration aborted");
            let mut report = blank();
            report.status = ReportStatus::Aborted;
            let issue = Issue::new(abort_kind(&e), variant.to_string(), e.to_string());
            report.issues.push(issue);
            report
        }
    }
}

/// Issue kind recorded for a configuration that stopped on `error`.
fn abort_kind(error: &BisectError) -> IssueKind {
    match error {
        BisectError::Build(_) => IssueKind::BuildFailure,
        BisectError::Runtime(_) => IssueKind::RuntimeFailure,
        BisectError::GroundTruth { .. } => IssueKind::GroundTruthFailure,
        _ => IssueKind::EngineError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_parallel() {
        let options = AutoRunOptions { parallel: 4, ..Default::default() };
        assert_eq!(options.effective_parallel(true, 10), 4);
        assert_eq!(options.effective_parallel(true, 2), 2);
        assert_eq!(options.effective_parallel(false, 10), 1);
        assert_eq!(options.effective_parallel(true, 0), 1);
    }

    #[test]
    fn test_abort_kind_follows_error() {
        assert_eq!(abort_kind(&BisectError::Build("link".into())), IssueKind::BuildFailure);
        assert_eq!(abort_kind(&BisectError::Runtime("spawn".into())), IssueKind::RuntimeFailure);
        assert_eq!(abort_kind(&BisectError::Message("no sources".into())), IssueKind::EngineError);
        let io = BisectError::io("write", std::io::Error::other("disk full"));
        assert_eq!(abort_kind(&io), IssueKind::EngineError);
    }
}
