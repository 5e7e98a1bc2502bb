//! Storage layer.
//!
//! Reads the results store that drives auto runs and persists trial logs and findings.

pub mod csv;
pub mod jsonl;
pub mod results;

// Re-export key types
pub use csv::{CSV_HEADERS, CsvExporter};
pub use jsonl::JsonlWriter;
pub use results::{ResultRow, ResultsStore};
