pub mod artifacts;
pub mod auto_cmd;
pub mod bisect_cmd;
pub mod build;
pub mod config;
pub mod core;
pub mod engine;
pub mod report;
pub mod storage;

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BisectError {
    #[error("{0}")]
    Message(String),
    #[error("ground truth failed for {context}: {detail}")]
    GroundTruth { context: String, detail: String },
    #[error("build failed: {0}")]
    Build(String),
    #[error("run failed: {0}")]
    Runtime(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl BisectError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BisectError::Io { context: context.into(), source }
    }
}

pub type BisectResult<T> = Result<T, BisectError>;

// Shared helpers
pub fn now_string() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "".to_string())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha256::digest;
    digest(bytes)
}

/// `path` made absolute against the current directory; child processes run elsewhere.
pub fn absolute_path(path: &Path) -> PathBuf {
    if path.as_os_str().is_empty() {
        return std::env::current_dir().unwrap_or_default();
    }
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

pub fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> BisectResult<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .map_err(|e| BisectError::io(format!("failed to create {}", dir.display()), e))?;
        }
    }
    let json = serde_json::to_vec_pretty(value).map_err(|e| BisectError::Message(e.to_string()))?;
    std::fs::write(path, json)
        .map_err(|e| BisectError::io(format!("failed to write {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_is_stable() {
        assert_eq!(sha256_hex(b"abc"), sha256_hex(b"abc"));
        assert_eq!(sha256_hex(b"abc").len(), 64);
        assert_ne!(sha256_hex(b"abc"), sha256_hex(b"abd"));
    }

    #[test]
    fn test_write_json_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.json");
        write_json(&path, &serde_json::json!({ "ok": true })).unwrap();
        let back: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(back["ok"], true);
    }

    #[test]
    fn test_absolute_path_anchors_relative_paths() {
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(absolute_path(Path::new("src")), cwd.join("src"));
        assert_eq!(absolute_path(Path::new("/opt/x")), PathBuf::from("/opt/x"));
    }
}
