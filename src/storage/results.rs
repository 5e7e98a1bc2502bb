//! Results store: the CSV of earlier test runs that the auto run bisects.
//!
//! Expected header: `name,precision,compiler,optl,switches,comparison`. A row whose
//! `comparison` is zero or empty did not diverge and is never bisected.

use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::FlagSet;
use crate::core::schema::split_switches;
use crate::{BisectError, BisectResult};

/// One recorded test run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    /// Test name; empty means "the default test"
    #[serde(default)]
    pub name: String,
    pub precision: String,
    pub compiler: String,
    #[serde(default)]
    pub optl: String,
    #[serde(default)]
    pub switches: String,
    /// Recorded comparison score against ground truth
    #[serde(default)]
    pub comparison: Option<f64>,
}

impl ResultRow {
    /// True when the recorded run diverged from ground truth.
    pub fn is_flagged(&self) -> bool {
        self.comparison.is_some_and(|c| c != 0.0)
    }

    /// The variant flag set this row was produced with.
    pub fn to_flagset(&self) -> FlagSet {
        FlagSet {
            compiler: self.compiler.clone(),
            optimization: self.optl.clone(),
            switches: split_switches(&self.switches),
        }
    }

    /// Test name, falling back to `default` when the row leaves it empty.
    pub fn test_or<'a>(&'a self, default: &'a str) -> &'a str {
        if self.name.is_empty() { default } else { &self.name }
    }
}

/// Read-only view over a results CSV.
#[derive(Debug, Clone, Default)]
pub struct ResultsStore {
    source: Option<PathBuf>,
    rows: Vec<ResultRow>,
}

impl ResultsStore {
    pub fn from_rows(rows: Vec<ResultRow>) -> Self {
        ResultsStore { source: None, rows }
    }

    /// Load a results CSV from disk.
    pub fn load(path: &Path) -> BisectResult<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| BisectError::io(format!("failed to open {}", path.display()), e))?;
        let mut store = Self::from_reader(file)?;
        store.source = Some(path.to_path_buf());
        Ok(store)
    }

    pub fn from_reader<R: Read>(reader: R) -> BisectResult<Self> {
        let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut rows = Vec::new();
        for (i, row) in csv_reader.deserialize::<ResultRow>().enumerate() {
            let row = row.map_err(|e| {
                BisectError::Message(format!("failed to parse results row {}: {e}", i + 1))
            })?;
            rows.push(row);
        }
        Ok(ResultsStore { source: None, rows })
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows that diverged, with their position in the store.
    pub fn flagged(&self) -> Vec<(usize, &ResultRow)> {
        self.rows.iter().enumerate().filter(|(_, r)| r.is_flagged()).collect()
    }
}
