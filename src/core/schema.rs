//! Data model shared by the partitioners, the trial runner and the reports.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{BisectError, BisectResult};

/// Schema version stamped into persisted reports and trial logs
pub const SCHEMA_VERSION: u32 = 1;

/// One source file of the target; the first-phase search granularity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CompilationUnit {
    /// Path relative to the project's source directory
    pub path: PathBuf,
}

impl CompilationUnit {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CompilationUnit { path: path.into() }
    }

    /// Object file stem that is unique per unit (`dir/a.cpp` -> `dir_a_cpp_<hash>`).
    ///
    /// The flattened key alone collides (`dir/a.cpp` and `dir_a.cpp`), so a short hash of
    /// the key is appended.
    pub fn object_stem(&self) -> String {
        let key = self.key();
        let flat: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("{flat}_{}", &crate::sha256_hex(key.as_bytes())[..8])
    }
}

impl fmt::Display for CompilationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// One linkable function inside a compilation unit; the second-phase granularity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SymbolSite {
    /// Unit the symbol was extracted from
    pub unit: PathBuf,
    /// Linker-visible (mangled) name
    pub symbol: String,
    /// Demangled signature, equal to `symbol` for C linkage
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl SymbolSite {
    pub fn new(unit: impl Into<PathBuf>, symbol: impl Into<String>) -> Self {
        let symbol = symbol.into();
        SymbolSite { unit: unit.into(), signature: symbol.clone(), symbol, file: None, line: None }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    pub fn with_location(mut self, file: impl Into<PathBuf>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    /// `file:line` when known, falling back to the unit path.
    pub fn location(&self) -> String {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => format!("{}:{}", file.display(), line),
            (Some(file), None) => file.display().to_string(),
            _ => self.unit.display().to_string(),
        }
    }
}

impl fmt::Display for SymbolSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.location(), self.signature)
    }
}

/// Anything the bisection can search over.
pub trait Candidate: Clone + fmt::Debug + fmt::Display + Send + Sync {
    /// Stable identifier used in partitions and signatures.
    fn key(&self) -> String;
}

impl Candidate for CompilationUnit {
    fn key(&self) -> String {
        self.path.to_string_lossy().replace('\\', "/")
    }
}

impl Candidate for SymbolSite {
    fn key(&self) -> String {
        self.symbol.clone()
    }
}

/// Which flag set an element is compiled with in one trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Assignment {
    Trusted,
    Variant,
}

/// A compiler together with the optimization level and switches it is invoked with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlagSet {
    pub compiler: String,
    pub optimization: String,
    #[serde(default)]
    pub switches: Vec<String>,
}

impl FlagSet {
    pub fn new(compiler: impl Into<String>, optimization: impl Into<String>, switches: &str) -> Self {
        FlagSet {
            compiler: compiler.into(),
            optimization: optimization.into(),
            switches: split_switches(switches),
        }
    }

    /// Parse a `"<compiler> <optimization> <switches...>"` identifier.
    ///
    /// The first token starting with `-O` is taken as the optimization level;
    /// every other token after the compiler is a switch.
    pub fn parse(identifier: &str) -> BisectResult<Self> {
        let tokens = shlex::split(identifier).ok_or_else(|| {
            BisectError::Message(format!("unbalanced quoting in compiler identifier: {identifier}"))
        })?;
        let mut iter = tokens.into_iter();
        let compiler = iter
            .next()
            .ok_or_else(|| BisectError::Message("empty compiler identifier".into()))?;
        let mut optimization = String::new();
        let mut switches = Vec::new();
        for token in iter {
            if optimization.is_empty() && token.starts_with("-O") {
                optimization = token;
            } else {
                switches.push(token);
            }
        }
        Ok(FlagSet { compiler, optimization, switches })
    }

    /// Flags passed to the compiler, without the compiler itself.
    pub fn args(&self) -> Vec<String> {
        std::iter::once(self.optimization.clone())
            .chain(self.switches.iter().cloned())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

impl fmt::Display for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.compiler)?;
        for arg in self.args() {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Split a switch string the way a shell would, falling back to whitespace.
pub fn split_switches(switches: &str) -> Vec<String> {
    shlex::split(switches)
        .unwrap_or_else(|| switches.split_whitespace().map(str::to_string).collect())
}

/// What a partition's elements are.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scope {
    /// Whole compilation units of the target
    Units,
    /// Symbols of one unit; every other unit stays trusted
    Symbols { unit: PathBuf },
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Units => write!(f, "files"),
            Scope::Symbols { unit } => write!(f, "symbols of {}", unit.display()),
        }
    }
}

/// Bipartition of a candidate set into a variant and a trusted group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub scope: Scope,
    pub variant: Vec<String>,
    pub trusted: Vec<String>,
}

impl Partition {
    /// Split `candidates` so that exactly `variant` is variant and the rest trusted.
    ///
    /// Fails if `variant` names a key outside `candidates` or repeats one.
    pub fn new(scope: Scope, candidates: &[String], variant: &[String]) -> BisectResult<Self> {
        let all: BTreeSet<&String> = candidates.iter().collect();
        let mut seen = BTreeSet::new();
        for key in variant {
            if !all.contains(key) {
                return Err(BisectError::Message(format!(
                    "{key} is not part of the candidate set for {scope}"
                )));
            }
            if !seen.insert(key) {
                return Err(BisectError::Message(format!("{key} assigned twice")));
            }
        }
        let trusted = candidates.iter().filter(|k| !seen.contains(k)).cloned().collect();
        Ok(Partition { scope, variant: variant.to_vec(), trusted })
    }

    /// Everything trusted; the ground-truth build.
    pub fn all_trusted(scope: Scope, candidates: &[String]) -> Self {
        Partition { scope, variant: Vec::new(), trusted: candidates.to_vec() }
    }

    pub fn assignment(&self, key: &str) -> Assignment {
        if self.variant.iter().any(|k| k == key) { Assignment::Variant } else { Assignment::Trusted }
    }

    pub fn is_variant(&self, key: &str) -> bool {
        self.assignment(key) == Assignment::Variant
    }

    /// Order-independent identity of the partition, used for memoization.
    pub fn signature(&self) -> String {
        let variant: BTreeSet<&String> = self.variant.iter().collect();
        let trusted: BTreeSet<&String> = self.trusted.iter().collect();
        let mut canonical = format!("{:?}\n", self.scope);
        for key in variant {
            canonical.push_str("v:");
            canonical.push_str(key);
            canonical.push('\n');
        }
        for key in trusted {
            canonical.push_str("t:");
            canonical.push_str(key);
            canonical.push('\n');
        }
        crate::sha256_hex(canonical.as_bytes())
    }

    /// Human readable one-liner, e.g. `files variant=[a.cpp b.cpp] (2/6)`.
    pub fn describe(&self) -> String {
        format!(
            "{} variant=[{}] ({}/{})",
            self.scope,
            self.variant.join(" "),
            self.variant.len(),
            self.variant.len() + self.trusted.len()
        )
    }
}

/// Comparator output. Only whether it is zero drives the search.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Score(f64);

impl Score {
    pub const ZERO: Score = Score(0.0);

    /// Normalises comparator output to a finite non-negative value.
    pub fn new(value: f64) -> Self {
        if value.is_nan() || value.is_infinite() {
            Score(f64::MAX)
        } else {
            Score(value.abs())
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    pub fn is_divergent(&self) -> bool {
        self.0 != 0.0
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a trial produced no score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Build,
    Runtime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl TrialFailure {
    pub fn build(detail: impl Into<String>) -> Self {
        TrialFailure { kind: FailureKind::Build, detail: detail.into() }
    }

    pub fn runtime(detail: impl Into<String>) -> Self {
        TrialFailure { kind: FailureKind::Runtime, detail: detail.into() }
    }
}

impl fmt::Display for TrialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::Build => write!(f, "build failure: {}", self.detail),
            FailureKind::Runtime => write!(f, "runtime failure: {}", self.detail),
        }
    }
}

/// Result of one trial: a score, or a failure that is never coerced into one.
pub type TrialOutcome = Result<Score, TrialFailure>;

/// One executed (or memoized) trial, as logged and reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialRecord {
    pub schema_version: u32,
    pub seq: usize,
    pub description: String,
    pub signature: String,
    pub variant_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<Score>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TrialFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_ms: Option<u128>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_ms: Option<u128>,
    pub cached: bool,
}

impl TrialRecord {
    pub fn new(seq: usize, partition: &Partition, outcome: &TrialOutcome) -> Self {
        let (score, failure) = match outcome {
            Ok(score) => (Some(*score), None),
            Err(failure) => (None, Some(failure.clone())),
        };
        TrialRecord {
            schema_version: SCHEMA_VERSION,
            seq,
            description: partition.describe(),
            signature: partition.signature(),
            variant_count: partition.variant.len(),
            score,
            failure,
            build_ms: None,
            run_ms: None,
            cached: false,
        }
    }

    pub fn outcome_label(&self) -> String {
        match (&self.score, &self.failure) {
            (Some(score), _) => format!("score={score}"),
            (None, Some(failure)) => failure.to_string(),
            (None, None) => "no result".to_string(),
        }
    }
}

/// Lists the keys of a candidate slice.
pub fn keys_of<C: Candidate>(candidates: &[C]) -> Vec<String> {
    candidates.iter().map(Candidate::key).collect()
}

/// Normalises a unit path for comparison against partition keys.
pub fn unit_key(path: &Path) -> String {
    CompilationUnit::new(path).key()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_partition_covers_candidate_set() {
        let all = keys(&["a.cpp", "b.cpp", "c.cpp"]);
        let p = Partition::new(Scope::Units, &all, &keys(&["b.cpp"])).unwrap();
        assert_eq!(p.variant, keys(&["b.cpp"]));
        assert_eq!(p.trusted, keys(&["a.cpp", "c.cpp"]));
        assert!(p.is_variant("b.cpp"));
        assert_eq!(p.assignment("a.cpp"), Assignment::Trusted);
    }

    #[test]
    fn test_partition_rejects_unknown_and_duplicate_keys() {
        let all = keys(&["a.cpp", "b.cpp"]);
        assert!(Partition::new(Scope::Units, &all, &keys(&["z.cpp"])).is_err());
        assert!(Partition::new(Scope::Units, &all, &keys(&["a.cpp", "a.cpp"])).is_err());
    }

    #[test]
    fn test_signature_ignores_order_but_not_scope() {
        let all = keys(&["a.cpp", "b.cpp", "c.cpp"]);
        let p1 = Partition::new(Scope::Units, &all, &keys(&["a.cpp", "c.cpp"])).unwrap();
        let p2 = Partition::new(Scope::Units, &all, &keys(&["c.cpp", "a.cpp"])).unwrap();
        assert_eq!(p1.signature(), p2.signature());

        let p3 = Partition::new(
            Scope::Symbols { unit: PathBuf::from("a.cpp") },
            &all,
            &keys(&["a.cpp", "c.cpp"]),
        )
        .unwrap();
        assert_ne!(p1.signature(), p3.signature());
    }

    #[test]
    fn test_flagset_parse_identifier() {
        let flags = FlagSet::parse("g++ -O3 -ffast-math -mavx2").unwrap();
        assert_eq!(flags.compiler, "g++");
        assert_eq!(flags.optimization, "-O3");
        assert_eq!(flags.switches, vec!["-ffast-math", "-mavx2"]);
        assert_eq!(flags.to_string(), "g++ -O3 -ffast-math -mavx2");
    }

    #[test]
    fn test_flagset_parse_without_optimization() {
        let flags = FlagSet::parse("clang++ '-fp-model fast'").unwrap();
        assert_eq!(flags.optimization, "");
        assert_eq!(flags.switches, vec!["-fp-model fast"]);
        assert!(FlagSet::parse("").is_err());
    }

    #[test]
    fn test_score_normalisation() {
        assert!(!Score::new(0.0).is_divergent());
        assert!(Score::new(-0.0).value() == 0.0);
        assert!(Score::new(1e-12).is_divergent());
        assert_eq!(Score::new(-2.0).value(), 2.0);
        assert_eq!(Score::new(f64::NAN).value(), f64::MAX);
    }

    #[test]
    fn test_object_stem_is_flat() {
        let stem = CompilationUnit::new("dir/sub/a.cpp").object_stem();
        assert!(stem.starts_with("dir_sub_a_cpp_"));
        assert!(!stem.contains('/'));
        assert_eq!(stem, CompilationUnit::new("dir/sub/a.cpp").object_stem());
    }

    #[test]
    fn test_object_stem_distinguishes_flattened_twins() {
        let nested = CompilationUnit::new("dir/a.cpp").object_stem();
        let flat = CompilationUnit::new("dir_a.cpp").object_stem();
        assert_ne!(nested, flat);
    }

    #[test]
    fn test_symbol_location_fallbacks() {
        let site = SymbolSite::new("a.cpp", "_Z3fooi").with_signature("foo(int)");
        assert_eq!(site.location(), "a.cpp");
        let site = site.with_location("src/a.cpp", 12);
        assert_eq!(site.location(), "src/a.cpp:12");
        assert_eq!(site.to_string(), "src/a.cpp:12 foo(int)");
    }
}
