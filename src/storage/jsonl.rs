//! JSONL (JSON Lines) trial log.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::BisectError;
use crate::core::schema::{SCHEMA_VERSION, TrialRecord};

/// JSONL writer/reader for trial records.
///
/// Each record is stored as a single JSON line. Clones share one lock, so concurrent
/// bisections can append to the same log without interleaving lines.
#[derive(Debug, Clone)]
pub struct JsonlWriter {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl JsonlWriter {
    /// Create a new JsonlWriter for the given path.
    ///
    /// The file will be created if it doesn't exist when writing.
    pub fn new(path: impl AsRef<Path>) -> Self {
        JsonlWriter {
            path: path.as_ref().to_path_buf(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Get the path to the JSONL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a single record to the JSONL file.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The record's schema_version doesn't match SCHEMA_VERSION
    /// - File operations fail
    /// - JSON serialization fails
    pub fn append(&self, record: &TrialRecord) -> Result<(), BisectError> {
        if record.schema_version != SCHEMA_VERSION {
            return Err(BisectError::Message(format!(
                "schema version mismatch: record has v{}, expected v{}",
                record.schema_version, SCHEMA_VERSION
            )));
        }

        let json = serde_json::to_string(record)
            .map_err(|e| BisectError::Message(format!("failed to serialize record: {e}")))?;

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| BisectError::io("failed to create directory", e))?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| BisectError::io(format!("failed to open {}", self.path.display()), e))?;

        writeln!(file, "{}", json).map_err(|e| BisectError::io("failed to write record", e))?;

        Ok(())
    }

    /// Read all records from the JSONL file.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The file doesn't exist
    /// - JSON deserialization fails for any line
    pub fn read_all(&self) -> Result<Vec<TrialRecord>, BisectError> {
        if !self.path.exists() {
            return Err(BisectError::Message(format!(
                "file not found: {}",
                self.path.display()
            )));
        }

        let file = File::open(&self.path)
            .map_err(|e| BisectError::io(format!("failed to open {}", self.path.display()), e))?;

        let reader = BufReader::new(file);
        let mut records = Vec::new();

        for (line_num, line_result) in reader.lines().enumerate() {
            let line = line_result
                .map_err(|e| BisectError::io(format!("failed to read line {}", line_num + 1), e))?;

            // Skip empty lines
            if line.trim().is_empty() {
                continue;
            }

            let record: TrialRecord = serde_json::from_str(&line).map_err(|e| {
                BisectError::Message(format!("failed to parse line {}: {e}", line_num + 1))
            })?;
            records.push(record);
        }

        Ok(records)
    }

    /// Check if the JSONL file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Partition, Scope, Score, TrialFailure};

    fn partition() -> Partition {
        let keys = vec!["a.cpp".to_string(), "b.cpp".to_string()];
        Partition::new(Scope::Units, &keys, &keys[..1]).unwrap()
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JsonlWriter::new(dir.path().join("logs/trials.jsonl"));

        writer.append(&TrialRecord::new(1, &partition(), &Ok(Score::new(0.5)))).unwrap();
        writer
            .append(&TrialRecord::new(2, &partition(), &Err(TrialFailure::build("ld: error"))))
            .unwrap();

        let records = writer.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].score, Some(Score::new(0.5)));
        assert_eq!(records[1].failure.as_ref().unwrap().detail, "ld: error");
    }

    #[test]
    fn test_schema_version_validation() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JsonlWriter::new(dir.path().join("test.jsonl"));

        let mut record = TrialRecord::new(1, &partition(), &Ok(Score::ZERO));
        record.schema_version = 999;

        let result = writer.append(&record);
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("schema version mismatch")
        );
        assert!(!writer.exists());
    }
}
