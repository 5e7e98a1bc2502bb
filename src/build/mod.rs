//! Build pipeline abstraction.
//!
//! A `BuildPipeline` turns a `Partition` into a linked executable: every element assigned
//! to the variant group is compiled with the variant flag set, everything else with the
//! trusted one. Whole-unit assignment drives the file phase; per-symbol assignment inside
//! one unit drives the symbol phase.

pub mod mock;
pub mod shell;
pub mod traits;

// Re-export key types
pub use mock::{BuildManifest, MockBuildPipeline};
pub use shell::{DefinedGlobal, ShellBuildPipeline, ShellSettings, parse_nm_globals, parse_nm_output};
pub use traits::{BuildOutput, BuildPipeline, BuildRequest};
