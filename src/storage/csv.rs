//! CSV export of bisection findings.

use std::io::Write;
use std::path::Path;

use crate::BisectError;
use crate::report::{BisectReport, CombinedReport};

/// CSV column headers in deterministic order.
pub const CSV_HEADERS: &[&str] = &[
    "index",
    "test",
    "precision",
    "variant",
    "status",
    "whole_score",
    "file",
    "file_score",
    "symbol",
    "signature",
    "location",
    "symbol_score",
];

/// CSV exporter for bisection findings.
///
/// One row per suspect symbol; a suspect file without symbols gets one row with empty
/// symbol columns, and a configuration without suspects gets one row with only its status.
#[derive(Debug, Clone, Default)]
pub struct CsvExporter;

impl CsvExporter {
    /// Create a new CsvExporter.
    pub fn new() -> Self {
        CsvExporter
    }

    /// Export a combined report to a CSV file.
    ///
    /// # Errors
    /// Returns an error if file operations or CSV writing fails.
    pub fn export(&self, report: &CombinedReport, output: &Path) -> Result<(), BisectError> {
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| BisectError::io("failed to create directory", e))?;
            }
        }

        let file = std::fs::File::create(output)
            .map_err(|e| BisectError::io(format!("failed to create {}", output.display()), e))?;

        self.export_to_writer(report, file)
    }

    /// Export a combined report to any writer implementing Write.
    pub fn export_to_writer<W: Write>(
        &self,
        report: &CombinedReport,
        writer: W,
    ) -> Result<(), BisectError> {
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer
            .write_record(CSV_HEADERS)
            .map_err(|e| BisectError::Message(format!("failed to write CSV headers: {e}")))?;

        for entry in &report.entries {
            for row in self.report_to_rows(entry.index, &entry.report) {
                csv_writer
                    .write_record(&row)
                    .map_err(|e| BisectError::Message(format!("failed to write CSV row: {e}")))?;
            }
        }

        csv_writer
            .flush()
            .map_err(|e| BisectError::io("failed to flush CSV writer", e))?;

        Ok(())
    }

    fn report_to_rows(&self, index: usize, report: &BisectReport) -> Vec<Vec<String>> {
        let prefix = vec![
            index.to_string(),
            report.test.clone(),
            report.precision.clone(),
            report.variant.clone(),
            report.status.label().to_string(),
            report.whole_score.map(|s| s.to_string()).unwrap_or_default(),
        ];
        let row = |cols: [String; 6]| -> Vec<String> {
            prefix.iter().cloned().chain(cols).collect()
        };

        let mut rows = Vec::new();
        for file in &report.files {
            let file_cols = [file.unit.to_string(), file.score.to_string()];
            if file.symbols.is_empty() {
                rows.push(row([
                    file_cols[0].clone(),
                    file_cols[1].clone(),
                    String::new(),
                    String::new(),
                    String::new(),
                    String::new(),
                ]));
            }
            for symbol in &file.symbols {
                rows.push(row([
                    file_cols[0].clone(),
                    file_cols[1].clone(),
                    symbol.site.symbol.clone(),
                    symbol.site.signature.clone(),
                    symbol.site.location(),
                    symbol.score.to_string(),
                ]));
            }
        }
        if rows.is_empty() {
            rows.push(row(Default::default()));
        }
        rows
    }
}
