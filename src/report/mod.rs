//! Reporting module for bisection results.
//!
//! This module provides:
//! - `BisectReport`: findings of one configuration's two-phase bisection
//! - `CombinedReport`: every configuration of an auto run, keyed by its results-store row
//! - Markdown and plain-text rendering

pub mod findings;
pub mod markdown;

// Re-export key types
pub use findings::{
    BisectReport, COMBINED_REPORT_VERSION, CombinedReport, ConfigReport, FileFinding,
    Interaction, Issue, IssueKind, ReportStatus, SymbolFinding,
};
pub use markdown::{render_markdown, render_text, write_markdown};
