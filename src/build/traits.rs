//! Build pipeline trait and request/output types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::BisectResult;
use crate::core::{CompilationUnit, FlagSet, Partition, SymbolSite};
use crate::engine::exec::CancelToken;

/// Everything needed to produce one trial executable.
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    /// Which elements get which flag set
    pub partition: &'a Partition,
    /// Flags for trusted elements (and for linking)
    pub trusted: &'a FlagSet,
    /// Flags for variant elements
    pub variant: &'a FlagSet,
    /// Isolated directory owned by this trial
    pub workdir: &'a Path,
    /// Upper bound on concurrently compiling units
    pub jobs: usize,
    /// Per-command timeout (zero = none)
    pub timeout: Duration,
    pub cancel: &'a CancelToken,
}

/// A successfully linked executable.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub executable: PathBuf,
    pub build_time_ms: u128,
    /// Number of objects compiled for this build
    pub objects: usize,
}

/// External build collaborator.
///
/// Errors returned from `build` are treated as build failures of that one partition;
/// they never abort the search as a whole.
pub trait BuildPipeline: Send + Sync {
    /// Returns the pipeline name (e.g., "shell", "mock").
    fn name(&self) -> &str;

    /// The target's compilation units, in a stable order.
    fn units(&self) -> BisectResult<Vec<CompilationUnit>>;

    /// Function-level symbols defined by `unit` when compiled with `flags`.
    ///
    /// # Arguments
    /// * `unit` - The unit to inspect
    /// * `flags` - Flag set to compile it with before listing symbols
    /// * `workdir` - Scratch directory for the intermediate object
    fn symbols(
        &self,
        unit: &CompilationUnit,
        flags: &FlagSet,
        workdir: &Path,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> BisectResult<Vec<SymbolSite>>;

    /// Compile and link the executable described by `request`.
    fn build(&self, request: &BuildRequest<'_>) -> BisectResult<BuildOutput>;

    /// Compiler binary this pipeline invokes for `flags`, for provenance.
    fn compiler_binary(&self, flags: &FlagSet) -> String {
        flags.compiler.clone()
    }
}
