//! Core types for fp-bisect.
//!
//! This module contains the data model (`schema`) shared by every search phase and the
//! environment provenance (`env`) stamped into reports.

pub mod env;
pub mod schema;

// Re-export key types for convenience
pub use env::EnvironmentInfo;
pub use schema::{
    Assignment, Candidate, CompilationUnit, FailureKind, FlagSet, Partition, SCHEMA_VERSION,
    Scope, Score, SymbolSite, TrialFailure, TrialOutcome, TrialRecord,
};
