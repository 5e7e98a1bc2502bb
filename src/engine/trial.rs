//! Trial execution: build one partition, run it, score it against the baseline.
//!
//! Trials are submitted in batches. Every build of a batch finishes before any of its
//! executables runs, so CPU-bound compiles never overlap the timed test runs. Outcomes
//! are memoized by partition signature for the lifetime of the runner.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::absolute_path;
use crate::artifacts::{ArtifactManager, TrialWorkspace};
use crate::build::{BuildOutput, BuildPipeline, BuildRequest};
use crate::core::{FlagSet, Partition, Score, TrialFailure, TrialOutcome, TrialRecord};
use crate::engine::compare::Comparator;
use crate::engine::exec::{CancelToken, Invocation, ProcessRunner};
use crate::engine::ground_truth::Baseline;
use crate::storage::JsonlWriter;

/// Callback invoked with every recorded trial, in completion order.
pub type TrialObserver<'a> = dyn Fn(&TrialRecord) + Send + Sync + 'a;

/// How the test executable is launched.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    /// Argument templates; `{precision}`, `{test}` and `{workdir}` are substituted
    pub args: Vec<String>,
    /// Wrapper such as `mpirun -n 4`
    pub launcher: Vec<String>,
    /// Zero means no limit
    pub timeout: Duration,
    /// Read the compared output from this file (relative to the trial directory)
    /// instead of stdout
    pub output_file: Option<PathBuf>,
    /// Whether trials may run concurrently
    pub reentrant: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        RunSettings {
            args: vec!["--precision".into(), "{precision}".into(), "{test}".into()],
            launcher: Vec::new(),
            timeout: Duration::from_secs(600),
            output_file: None,
            reentrant: true,
        }
    }
}

impl RunSettings {
    /// Invocation of `executable` for `target`, running inside `workdir`.
    pub fn invocation(&self, executable: &Path, target: &TestTarget, workdir: &Path) -> Invocation {
        let workdir_str = workdir.to_string_lossy();
        let args = self.args.iter().map(|arg| {
            arg.replace("{precision}", &target.precision)
                .replace("{test}", &target.test)
                .replace("{workdir}", &workdir_str)
        });
        Invocation::new(absolute_path(executable))
            .args(args)
            .current_dir(workdir)
            .with_launcher(self.launcher.clone())
    }
}

/// Test and precision a bisection runs against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestTarget {
    pub test: String,
    pub precision: String,
}

impl TestTarget {
    pub fn new(test: impl Into<String>, precision: impl Into<String>) -> Self {
        TestTarget { test: test.into(), precision: precision.into() }
    }
}

impl fmt::Display for TestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.test, self.precision)
    }
}

/// Collaborators shared by every trial of one bisection.
#[derive(Clone, Copy)]
pub struct TrialEnv<'a> {
    pub pipeline: &'a dyn BuildPipeline,
    pub process: &'a dyn ProcessRunner,
    pub artifacts: &'a ArtifactManager,
    pub run: &'a RunSettings,
    pub cancel: &'a CancelToken,
    /// Concurrent compiles within one build
    pub jobs: usize,
    /// Per-command build timeout (zero = none)
    pub build_timeout: Duration,
}

impl TrialEnv<'_> {
    /// Build `partition` into `workdir`.
    pub fn build(
        &self,
        partition: &Partition,
        trusted: &FlagSet,
        variant: &FlagSet,
        workdir: &Path,
    ) -> Result<BuildOutput, TrialFailure> {
        let request = BuildRequest {
            partition,
            trusted,
            variant,
            workdir,
            jobs: self.jobs.max(1),
            timeout: self.build_timeout,
            cancel: self.cancel,
        };
        self.pipeline.build(&request).map_err(|e| TrialFailure::build(e.to_string()))
    }

    /// Run a built executable and return its output and run time.
    ///
    /// A spawn error, a non-zero exit, a timeout or a missing output file are all
    /// runtime failures.
    pub fn execute(
        &self,
        executable: &Path,
        target: &TestTarget,
        workdir: &Path,
    ) -> Result<(String, u128), TrialFailure> {
        let invocation = self.run.invocation(executable, target, workdir);
        let output = self
            .process
            .run(&invocation, self.run.timeout, self.cancel)
            .map_err(|e| TrialFailure::runtime(e.to_string()))?;
        if !output.success() {
            return Err(TrialFailure::runtime(output.failure_summary()));
        }

        let text = match &self.run.output_file {
            None => output.stdout,
            Some(file) => {
                let path = workdir.join(file);
                std::fs::read_to_string(&path).map_err(|e| {
                    TrialFailure::runtime(format!("failed to read {}: {e}", path.display()))
                })?
            }
        };
        Ok((text, output.elapsed_ms))
    }
}

struct Built<'w> {
    slot: usize,
    workspace: TrialWorkspace<'w>,
    output: BuildOutput,
}

/// Runs trials for one (configuration, test) pair against a fixed baseline.
pub struct TrialRunner<'a> {
    env: TrialEnv<'a>,
    comparator: &'a dyn Comparator,
    baseline: Arc<Baseline>,
    trusted: &'a FlagSet,
    variant: &'a FlagSet,
    target: &'a TestTarget,
    cache: Mutex<HashMap<String, TrialOutcome>>,
    records: Mutex<Vec<TrialRecord>>,
    seq: AtomicUsize,
    executed: AtomicUsize,
    observer: Option<&'a TrialObserver<'a>>,
    log: Option<&'a JsonlWriter>,
}

impl<'a> TrialRunner<'a> {
    pub fn new(
        env: TrialEnv<'a>,
        comparator: &'a dyn Comparator,
        baseline: Arc<Baseline>,
        trusted: &'a FlagSet,
        variant: &'a FlagSet,
        target: &'a TestTarget,
    ) -> Self {
        TrialRunner {
            env,
            comparator,
            baseline,
            trusted,
            variant,
            target,
            cache: Mutex::new(HashMap::new()),
            records: Mutex::new(Vec::new()),
            seq: AtomicUsize::new(0),
            executed: AtomicUsize::new(0),
            observer: None,
            log: None,
        }
    }

    pub fn with_observer(mut self, observer: Option<&'a TrialObserver<'a>>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_log(mut self, log: Option<&'a JsonlWriter>) -> Self {
        self.log = log;
        self
    }

    pub fn env(&self) -> &TrialEnv<'a> {
        &self.env
    }

    pub fn cancel(&self) -> &CancelToken {
        self.env.cancel
    }

    /// Trials actually built, excluding memoized repeats.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    /// Every trial recorded so far, including memoized repeats.
    pub fn records(&self) -> Vec<TrialRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Run a single trial.
    pub fn run(&self, partition: &Partition) -> TrialOutcome {
        self.run_batch(std::slice::from_ref(partition))
            .into_iter()
            .next()
            .unwrap_or_else(|| Err(TrialFailure::runtime("trial produced no outcome")))
    }

    /// Run a batch of trials: build all, then run all.
    ///
    /// Outcomes are returned in the order of `partitions`.
    pub fn run_batch(&self, partitions: &[Partition]) -> Vec<TrialOutcome> {
        let signatures: Vec<String> = partitions.iter().map(Partition::signature).collect();
        let mut outcomes: Vec<Option<TrialOutcome>> = vec![None; partitions.len()];
        let mut pending: Vec<usize> = Vec::new();

        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            for (i, signature) in signatures.iter().enumerate() {
                if let Some(outcome) = cache.get(signature) {
                    debug!(trial = %partitions[i].describe(), "reusing memoized outcome");
                    outcomes[i] = Some(outcome.clone());
                    self.record(&partitions[i], outcome, None, None, true);
                } else if !pending.iter().any(|&p| signatures[p] == *signature) {
                    pending.push(i);
                }
            }
        }

        // Build phase
        let mut built: Vec<Built<'a>> = Vec::new();
        let mut build_ms: HashMap<usize, u128> = HashMap::new();
        for &i in &pending {
            let partition = &partitions[i];
            self.executed.fetch_add(1, Ordering::SeqCst);
            let label = format!("trial-{}", &signatures[i][..12]);
            let workspace = match self.env.artifacts.acquire(&label) {
                Ok(ws) => ws,
                Err(e) => {
                    let failure = Err(TrialFailure::build(e.to_string()));
                    outcomes[i] = Some(self.finish(partition, &signatures[i], failure, None, None));
                    continue;
                }
            };
            match self.env.build(partition, self.trusted, self.variant, workspace.path()) {
                Ok(output) => {
                    build_ms.insert(i, output.build_time_ms);
                    built.push(Built { slot: i, workspace, output });
                }
                Err(failure) => {
                    warn!(trial = %partition.describe(), error = %failure.detail, "build failed");
                    drop(workspace);
                    let failure = Err(failure);
                    outcomes[i] = Some(self.finish(partition, &signatures[i], failure, None, None));
                }
            }
        }

        // Run phase
        for Built { slot, workspace, output } in built {
            let partition = &partitions[slot];
            let result = self
                .env
                .execute(&output.executable, self.target, workspace.path())
                .and_then(|(text, run_ms)| {
                    self.comparator
                        .compare(&self.baseline.output, &text)
                        .map(|value| (Score::new(value), run_ms))
                        .map_err(|e| TrialFailure::runtime(format!("comparison failed: {e}")))
                });
            if let Err(e) = workspace.release() {
                warn!(error = %e, "workspace cleanup failed");
            }
            let (outcome, run_ms) = match result {
                Ok((score, run_ms)) => (Ok(score), Some(run_ms)),
                Err(failure) => (Err(failure), None),
            };
            let build_ms = build_ms.get(&slot).copied();
            outcomes[slot] =
                Some(self.finish(partition, &signatures[slot], outcome, build_ms, run_ms));
        }

        // Duplicates within the batch share the outcome of their first occurrence.
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        outcomes
            .into_iter()
            .enumerate()
            .map(|(i, outcome)| match outcome {
                Some(outcome) => outcome,
                None => {
                    let outcome = cache
                        .get(&signatures[i])
                        .cloned()
                        .unwrap_or_else(|| Err(TrialFailure::runtime("cancelled")));
                    self.record(&partitions[i], &outcome, None, None, true);
                    outcome
                }
            })
            .collect()
    }

    fn finish(
        &self,
        partition: &Partition,
        signature: &str,
        outcome: TrialOutcome,
        build_ms: Option<u128>,
        run_ms: Option<u128>,
    ) -> TrialOutcome {
        // A cancelled trial says nothing about the partition; do not memoize it.
        if !self.env.cancel.is_cancelled() {
            self.cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(signature.to_string(), outcome.clone());
        }
        self.record(partition, &outcome, build_ms, run_ms, false);
        outcome
    }

    fn record(
        &self,
        partition: &Partition,
        outcome: &TrialOutcome,
        build_ms: Option<u128>,
        run_ms: Option<u128>,
        cached: bool,
    ) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut record = TrialRecord::new(seq, partition, outcome);
        record.build_ms = build_ms;
        record.run_ms = run_ms;
        record.cached = cached;

        info!(
            target_test = %self.target,
            seq,
            trial = %record.description,
            outcome = %record.outcome_label(),
            cached,
            "trial"
        );
        if let Some(log) = self.log {
            if let Err(e) = log.append(&record) {
                warn!(error = %e, "failed to append trial log");
            }
        }
        if let Some(observer) = self.observer {
            observer(&record);
        }
        self.records.lock().unwrap_or_else(|e| e.into_inner()).push(record);
    }
}
