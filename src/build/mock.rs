//! Mock build pipeline for testing.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{Candidate, CompilationUnit, FlagSet, Scope, SymbolSite};
use crate::engine::exec::CancelToken;
use crate::{BisectError, BisectResult};

use super::traits::{BuildOutput, BuildPipeline, BuildRequest};

/// File name of the manifest written next to the mock executable.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Name of the fake executable.
pub const MOCK_EXECUTABLE: &str = "test-bin";

/// What a mock build "compiled": which units and symbols were variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildManifest {
    pub trusted: String,
    pub variant: String,
    pub variant_units: BTreeSet<String>,
    pub variant_symbols: BTreeMap<String, BTreeSet<String>>,
}

impl BuildManifest {
    pub fn load(dir: &Path) -> BisectResult<Self> {
        let path = dir.join(MANIFEST_FILE);
        let bytes = std::fs::read(&path)
            .map_err(|e| BisectError::io(format!("failed to read {}", path.display()), e))?;
        serde_json::from_slice(&bytes).map_err(|e| BisectError::Message(e.to_string()))
    }

    pub fn is_variant_unit(&self, unit: &str) -> bool {
        self.variant_units.contains(unit)
    }

    /// Variant either through its whole unit or as a spliced symbol.
    pub fn is_variant_symbol(&self, unit: &str, symbol: &str) -> bool {
        self.is_variant_unit(unit)
            || self.variant_symbols.get(unit).is_some_and(|s| s.contains(symbol))
    }

    /// True when nothing was compiled with the variant flags.
    pub fn is_all_trusted(&self) -> bool {
        self.variant_units.is_empty() && self.variant_symbols.values().all(BTreeSet::is_empty)
    }
}

/// Build pipeline that records assignments instead of compiling.
///
/// Each build writes a `BuildManifest` and a padded fake executable into the trial's
/// working directory, so artifact cleanup can be observed on disk.
#[derive(Debug, Default)]
pub struct MockBuildPipeline {
    units: Vec<CompilationUnit>,
    symbols: BTreeMap<String, Vec<SymbolSite>>,
    failing_units: BTreeSet<String>,
    executable_bytes: usize,
    builds: AtomicUsize,
}

impl MockBuildPipeline {
    /// Create a pipeline over the given unit paths.
    pub fn new<I, S>(units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<PathBuf>,
    {
        MockBuildPipeline {
            units: units.into_iter().map(CompilationUnit::new).collect(),
            executable_bytes: 1024,
            ..Default::default()
        }
    }

    /// `unit1.cpp` .. `unitN.cpp`.
    pub fn numbered(count: usize) -> Self {
        Self::new((1..=count).map(|i| format!("unit{i}.cpp")))
    }

    /// Declare the symbols `symbols()` reports for `unit`.
    pub fn with_symbols(mut self, unit: &str, symbols: &[&str]) -> Self {
        let sites = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| {
                SymbolSite::new(unit, *s)
                    .with_signature(format!("{s}()"))
                    .with_location(unit, 10 * (i as u32 + 1))
            })
            .collect();
        self.symbols.insert(unit.to_string(), sites);
        self
    }

    /// Builds fail whenever `unit` is compiled with the variant flags.
    pub fn failing_when_variant(mut self, unit: &str) -> Self {
        self.failing_units.insert(unit.to_string());
        self
    }

    /// Size of the fake executable written per build.
    pub fn with_executable_bytes(mut self, bytes: usize) -> Self {
        self.executable_bytes = bytes;
        self
    }

    /// Number of builds attempted so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl BuildPipeline for MockBuildPipeline {
    fn name(&self) -> &str {
        "mock"
    }

    fn units(&self) -> BisectResult<Vec<CompilationUnit>> {
        Ok(self.units.clone())
    }

    fn symbols(
        &self,
        unit: &CompilationUnit,
        _flags: &FlagSet,
        _workdir: &Path,
        _timeout: Duration,
        _cancel: &CancelToken,
    ) -> BisectResult<Vec<SymbolSite>> {
        Ok(self.symbols.get(&unit.key()).cloned().unwrap_or_default())
    }

    fn build(&self, request: &BuildRequest<'_>) -> BisectResult<BuildOutput> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if request.cancel.is_cancelled() {
            return Err(BisectError::Build("cancelled".into()));
        }

        let mut manifest = BuildManifest {
            trusted: request.trusted.to_string(),
            variant: request.variant.to_string(),
            ..Default::default()
        };
        match &request.partition.scope {
            Scope::Units => {
                manifest.variant_units = request.partition.variant.iter().cloned().collect();
            }
            Scope::Symbols { unit } => {
                let key = CompilationUnit::new(unit).key();
                manifest
                    .variant_symbols
                    .insert(key, request.partition.variant.iter().cloned().collect());
            }
        }

        let failing_unit = self.failing_units.iter().find(|u| {
            manifest.variant_units.contains(*u)
                || manifest.variant_symbols.get(*u).is_some_and(|s| !s.is_empty())
        });
        if let Some(unit) = failing_unit {
            return Err(BisectError::Build(format!("{unit}: mock compile error")));
        }

        let json =
            serde_json::to_vec_pretty(&manifest).map_err(|e| BisectError::Message(e.to_string()))?;
        std::fs::write(request.workdir.join(MANIFEST_FILE), json)
            .map_err(|e| BisectError::io("failed to write manifest", e))?;
        let executable = request.workdir.join(MOCK_EXECUTABLE);
        std::fs::write(&executable, vec![0u8; self.executable_bytes])
            .map_err(|e| BisectError::io("failed to write mock executable", e))?;

        Ok(BuildOutput { executable, build_time_ms: 1, objects: self.units.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Partition;
    use crate::core::schema::keys_of;

    fn request<'a>(
        partition: &'a Partition,
        flags: &'a FlagSet,
        dir: &'a Path,
        cancel: &'a CancelToken,
    ) -> BuildRequest<'a> {
        BuildRequest {
            partition,
            trusted: flags,
            variant: flags,
            workdir: dir,
            jobs: 1,
            timeout: Duration::ZERO,
            cancel,
        }
    }

    #[test]
    fn test_mock_build_writes_manifest() {
        let pipeline = MockBuildPipeline::numbered(3);
        let keys = keys_of(&pipeline.units().unwrap());
        let partition = Partition::new(Scope::Units, &keys, &keys[1..2]).unwrap();
        let flags = FlagSet::parse("g++ -O0").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();

        let out = pipeline.build(&request(&partition, &flags, dir.path(), &cancel)).unwrap();
        assert!(out.executable.exists());

        let manifest = BuildManifest::load(dir.path()).unwrap();
        assert!(manifest.is_variant_unit("unit2.cpp"));
        assert!(!manifest.is_variant_unit("unit1.cpp"));
        assert_eq!(pipeline.builds(), 1);
    }

    #[test]
    fn test_mock_build_failure_for_variant_unit() {
        let pipeline = MockBuildPipeline::numbered(2).failing_when_variant("unit1.cpp");
        let keys = keys_of(&pipeline.units().unwrap());
        let flags = FlagSet::parse("g++ -O0").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();

        let bad = Partition::new(Scope::Units, &keys, &keys[..1]).unwrap();
        assert!(pipeline.build(&request(&bad, &flags, dir.path(), &cancel)).is_err());

        let good = Partition::new(Scope::Units, &keys, &keys[1..]).unwrap();
        assert!(pipeline.build(&request(&good, &flags, dir.path(), &cancel)).is_ok());
    }

    #[test]
    fn test_mock_symbols() {
        let pipeline = MockBuildPipeline::numbered(1).with_symbols("unit1.cpp", &["f", "g"]);
        let flags = FlagSet::parse("g++ -O0").unwrap();
        let syms = pipeline
            .symbols(
                &CompilationUnit::new("unit1.cpp"),
                &flags,
                Path::new("."),
                Duration::ZERO,
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(syms.len(), 2);
        assert_eq!(syms[1].location(), "unit1.cpp:20");
    }
}
