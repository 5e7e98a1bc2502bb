//! Scoped lifetime of trial working directories.
//!
//! Every trial (and every ground-truth or symbol-extraction build) acquires a uniquely
//! named directory below the artifacts root. The directory is released when the
//! `TrialWorkspace` is dropped or explicitly released, on success and failure paths
//! alike; with `delete` enabled, release removes it from disk.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, warn};

use crate::{BisectError, BisectResult};

/// Hands out trial workspaces and tracks how many are alive.
#[derive(Debug)]
pub struct ArtifactManager {
    root: PathBuf,
    delete: bool,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    acquired: AtomicUsize,
}

impl ArtifactManager {
    /// Create a manager rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>, delete: bool) -> BisectResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| BisectError::io(format!("failed to create {}", root.display()), e))?;
        let root = root
            .canonicalize()
            .map_err(|e| BisectError::io(format!("failed to resolve {}", root.display()), e))?;
        Ok(ArtifactManager {
            root,
            delete,
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            acquired: AtomicUsize::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn deletes(&self) -> bool {
        self.delete
    }

    /// Acquire a fresh directory whose name starts with `label`.
    pub fn acquire(&self, label: &str) -> BisectResult<TrialWorkspace<'_>> {
        let prefix = format!("{}-", sanitize(label));
        let dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(&self.root)
            .map_err(|e| {
                BisectError::io(format!("failed to create workspace in {}", self.root.display()), e)
            })?;
        let path = dir.path().to_path_buf();

        self.acquired.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
        debug!(path = %path.display(), active = now, "workspace acquired");

        Ok(TrialWorkspace { dir: Some(dir), path, manager: self })
    }

    /// Workspaces currently held.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Largest number of workspaces held at the same time.
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    /// Total workspaces handed out.
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Bytes currently stored below the root.
    pub fn disk_usage(&self) -> u64 {
        dir_size(&self.root)
    }

    fn released(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A trial's working directory; released on drop.
#[derive(Debug)]
pub struct TrialWorkspace<'a> {
    dir: Option<tempfile::TempDir>,
    path: PathBuf,
    manager: &'a ArtifactManager,
}

impl TrialWorkspace<'_> {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release now, surfacing deletion errors instead of logging them.
    pub fn release(mut self) -> BisectResult<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> BisectResult<()> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        self.manager.released();
        if self.manager.delete {
            debug!(path = %self.path.display(), "deleting workspace");
            dir.close().map_err(|e| {
                BisectError::io(format!("failed to delete {}", self.path.display()), e)
            })
        } else {
            let _ = dir.keep();
            Ok(())
        }
    }
}

impl Drop for TrialWorkspace<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!(error = %e, "workspace cleanup failed");
        }
    }
}

fn sanitize(label: &str) -> String {
    let s: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(60)
        .collect();
    if s.is_empty() { "trial".to_string() } else { s }
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.file_type() {
            Ok(ft) if ft.is_dir() => dir_size(&entry.path()),
            Ok(_) => entry.metadata().map(|m| m.len()).unwrap_or(0),
            Err(_) => 0,
        })
        .sum()
}
