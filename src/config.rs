//! Project configuration (`fp-bisect.toml`).
//!
//! Describes the target's sources, the trusted flag set, how the test executable is run
//! and compared, and where trial artifacts go. Every key has a default; relative paths
//! are resolved against the directory holding the config file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::build::ShellSettings;
use crate::core::schema::split_switches;
use crate::core::{CompilationUnit, FlagSet};
use crate::engine::compare::{CompareKind, Comparator, comparator_for};
use crate::engine::trial::RunSettings;
use crate::{BisectError, BisectResult, absolute_path};

/// Default config file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "fp-bisect.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub project: ProjectSection,
    pub ground_truth: GroundTruthSection,
    #[serde(rename = "compiler")]
    pub compilers: Vec<CompilerEntry>,
    pub run: RunSection,
    pub compare: CompareSection,
    pub tools: ToolsSection,
    pub artifacts: ArtifactsSection,
    /// Directory relative paths are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSection {
    pub name: String,
    pub source_dir: PathBuf,
    /// Explicit unit list; every C/C++ source under `source_dir` when empty
    pub sources: Vec<PathBuf>,
    pub cflags: Vec<String>,
    pub ldflags: Vec<String>,
}

impl Default for ProjectSection {
    fn default() -> Self {
        ProjectSection {
            name: "project".to_string(),
            source_dir: PathBuf::from("."),
            sources: Vec::new(),
            cflags: Vec::new(),
            ldflags: Vec::new(),
        }
    }
}

/// The trusted flag set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroundTruthSection {
    pub compiler: String,
    pub optimization: String,
    pub switches: String,
}

impl Default for GroundTruthSection {
    fn default() -> Self {
        GroundTruthSection {
            compiler: "g++".to_string(),
            optimization: "-O0".to_string(),
            switches: String::new(),
        }
    }
}

/// Maps a compiler identifier used in results rows to the binary to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerEntry {
    pub name: String,
    pub binary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    pub args: Vec<String>,
    pub launcher: Vec<String>,
    pub timeout_secs: u64,
    pub output_file: Option<PathBuf>,
    pub reentrant: bool,
}

impl Default for RunSection {
    fn default() -> Self {
        let run = RunSettings::default();
        RunSection {
            args: run.args,
            launcher: run.launcher,
            timeout_secs: run.timeout.as_secs(),
            output_file: run.output_file,
            reentrant: run.reentrant,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompareSection {
    pub kind: CompareKind,
    pub tolerance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub nm: String,
    pub objcopy: String,
}

impl Default for ToolsSection {
    fn default() -> Self {
        ToolsSection { nm: "nm".to_string(), objcopy: "objcopy".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsSection {
    pub root: PathBuf,
}

impl Default for ArtifactsSection {
    fn default() -> Self {
        ArtifactsSection { root: PathBuf::from("bisect-work") }
    }
}

impl ProjectConfig {
    /// Load and parse a config file.
    pub fn load(path: &Path) -> BisectResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BisectError::io(format!("failed to read {}", path.display()), e))?;
        let mut config = Self::from_toml(&text)
            .map_err(|e| BisectError::Message(format!("{}: {e}", path.display())))?;
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        config.base_dir = dir
            .canonicalize()
            .map_err(|e| BisectError::io(format!("failed to resolve {}", dir.display()), e))?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> BisectResult<Self> {
        let mut config: ProjectConfig =
            toml::from_str(text).map_err(|e| BisectError::Message(e.to_string()))?;
        config.base_dir = PathBuf::new();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> BisectResult<()> {
        if self.ground_truth.compiler.trim().is_empty() {
            return Err(BisectError::Message("ground_truth.compiler must not be empty".into()));
        }
        if self.compare.tolerance < 0.0 || self.compare.tolerance.is_nan() {
            return Err(BisectError::Message(format!(
                "compare.tolerance must be a non-negative number, got {}",
                self.compare.tolerance
            )));
        }
        if self.run.args.iter().chain(&self.run.launcher).any(String::is_empty) {
            return Err(BisectError::Message(
                "run.args and run.launcher must not contain empty strings".into(),
            ));
        }
        Ok(())
    }

    /// Absolute form of a config path; relative paths are taken from the config's directory.
    fn resolve(&self, path: &Path) -> PathBuf {
        absolute_path(&self.base_dir.join(path))
    }

    /// Directory relative paths are resolved against.
    pub fn project_dir(&self) -> PathBuf {
        absolute_path(&self.base_dir)
    }

    /// The trusted flag set.
    pub fn trusted_flags(&self) -> FlagSet {
        FlagSet {
            compiler: self.ground_truth.compiler.clone(),
            optimization: self.ground_truth.optimization.clone(),
            switches: split_switches(&self.ground_truth.switches),
        }
    }

    pub fn shell_settings(&self) -> ShellSettings {
        let compilers: HashMap<String, String> = self
            .compilers
            .iter()
            .map(|c| (c.name.clone(), c.binary.clone()))
            .collect();
        ShellSettings {
            source_dir: self.resolve(&self.project.source_dir),
            sources: self.project.sources.iter().map(CompilationUnit::new).collect(),
            cflags: self.project.cflags.clone(),
            ldflags: self.project.ldflags.clone(),
            compilers,
            nm: self.tools.nm.clone(),
            objcopy: self.tools.objcopy.clone(),
            project_dir: self.project_dir(),
            ..ShellSettings::default()
        }
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            args: self.run.args.clone(),
            launcher: self.run.launcher.clone(),
            timeout: Duration::from_secs(self.run.timeout_secs),
            output_file: self.run.output_file.clone(),
            reentrant: self.run.reentrant,
        }
    }

    pub fn comparator(&self) -> Box<dyn Comparator> {
        comparator_for(self.compare.kind, self.compare.tolerance)
    }

    pub fn artifacts_root(&self) -> PathBuf {
        self.resolve(&self.artifacts.root)
    }
}
