//! Engine module: the bisection search and the collaborators it drives.
//!
//! # Architecture
//!
//! - **Collaborators**: `ProcessRunner` (`exec`) starts external programs with a timeout
//!   and cancellation, `Comparator` (`compare`) scores an output against the baseline,
//!   and `BuildPipeline` (`crate::build`) turns a partition into an executable.
//!
//! - **Trials**: `GroundTruthManager` (`ground_truth`) produces and caches the trusted
//!   baseline; `TrialRunner` (`trial`) builds, runs and scores partitions in
//!   build-then-run batches with memoization.
//!
//! - **Search**: `Partitioner` (`bisect`) is the frontier search used for both files and
//!   symbols; `BisectEngine` (`workflow`) chains the two phases for one configuration and
//!   `run_all` (`auto`) fans configurations out over a worker pool.
//!
//! # Boundaries
//!
//! - The search only looks at whether a score is zero, never at its magnitude.
//! - Trial failures are values (`TrialOutcome`), never coerced into scores.

pub mod auto;
pub mod bisect;
pub mod compare;
pub mod exec;
pub mod ground_truth;
pub mod trial;
pub mod workflow;

// Re-export key types for convenience
pub use auto::{AutoRunOptions, run_all};
pub use bisect::{Partitioner, SearchOutcome, Suspect};
pub use compare::{
    CompareKind, Comparator, ExactComparator, FnComparator, NumericComparator, comparator_for,
};
pub use exec::{
    CancelToken, CommandRunner, ExitKind, Invocation, MockResponse, MockRunner, ProcessOutput,
    ProcessRunner,
};
pub use ground_truth::{Baseline, GroundTruthManager};
pub use trial::{RunSettings, TestTarget, TrialEnv, TrialObserver, TrialRunner};
pub use workflow::{BisectEngine, BisectRequest, BisectSettings};
