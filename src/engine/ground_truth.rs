//! Ground-truth baselines.
//!
//! A baseline is the output of the all-trusted build for one (trusted flags, precision,
//! test) configuration. It is built once and shared by every bisection of that
//! configuration. Failures are cached too: a configuration whose baseline failed is not
//! rebuilt automatically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::core::schema::keys_of;
use crate::core::{FlagSet, Partition, Scope};
use crate::engine::trial::{TestTarget, TrialEnv};
use crate::{BisectError, BisectResult};

/// Canonical output of the trusted build.
#[derive(Debug, Clone)]
pub struct Baseline {
    pub target: TestTarget,
    pub flags: FlagSet,
    pub output: String,
    pub build_ms: u128,
    pub run_ms: u128,
}

type Slot = Arc<Mutex<Option<Result<Arc<Baseline>, String>>>>;

/// Builds and caches baselines, one per configuration.
#[derive(Debug, Default)]
pub struct GroundTruthManager {
    slots: Mutex<HashMap<String, Slot>>,
    builds: AtomicUsize,
}

impl GroundTruthManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache key of a configuration.
    pub fn key(flags: &FlagSet, target: &TestTarget) -> String {
        format!("{flags}|{}|{}", target.precision, target.test)
    }

    /// Baselines actually built (cache hits excluded).
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// The cached baseline for a configuration, if one was established.
    pub fn cached(&self, flags: &FlagSet, target: &TestTarget) -> Option<Arc<Baseline>> {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&Self::key(flags, target))
            .cloned()?;
        let guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().and_then(|r| r.as_ref().ok().cloned())
    }

    /// Return the baseline for `trusted` and `target`, building it on first use.
    ///
    /// Concurrent callers for the same configuration wait for a single build.
    pub fn establish(
        &self,
        env: &TrialEnv<'_>,
        trusted: &FlagSet,
        target: &TestTarget,
    ) -> BisectResult<Arc<Baseline>> {
        let key = Self::key(trusted, target);
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_default()
            .clone();

        let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        let context = format!("{target} with {trusted}");
        if let Some(cached) = guard.as_ref() {
            return cached
                .clone()
                .map_err(|detail| BisectError::GroundTruth { context, detail });
        }

        self.builds.fetch_add(1, Ordering::SeqCst);
        let result = self.compute(env, trusted, target).map(Arc::new);
        match &result {
            Ok(baseline) => info!(
                target_test = %target,
                flags = %trusted,
                build_ms = baseline.build_ms as u64,
                run_ms = baseline.run_ms as u64,
                "ground truth established"
            ),
            Err(detail) => warn!(target_test = %target, flags = %trusted, %detail, "ground truth failed"),
        }

        // A cancelled attempt is not a verdict on the configuration.
        if !env.cancel.is_cancelled() {
            *guard = Some(result.clone());
        }
        result.map_err(|detail| BisectError::GroundTruth { context, detail })
    }

    fn compute(
        &self,
        env: &TrialEnv<'_>,
        trusted: &FlagSet,
        target: &TestTarget,
    ) -> Result<Baseline, String> {
        let units = env.pipeline.units().map_err(|e| e.to_string())?;
        let partition = Partition::all_trusted(Scope::Units, &keys_of(&units));

        let workspace = env
            .artifacts
            .acquire(&format!("truth-{}", target.precision))
            .map_err(|e| e.to_string())?;
        let build = env
            .build(&partition, trusted, trusted, workspace.path())
            .map_err(|f| f.to_string())?;
        let (output, run_ms) = env
            .execute(&build.executable, target, workspace.path())
            .map_err(|f| f.to_string())?;
        workspace.release().map_err(|e| e.to_string())?;

        Ok(Baseline {
            target: target.clone(),
            flags: trusted.clone(),
            output,
            build_ms: build.build_time_ms,
            run_ms,
        })
    }
}
