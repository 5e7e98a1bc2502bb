//! Environment detection utilities for bisection reports.

use std::collections::BTreeMap;
use std::process::Command;

use serde::{Deserialize, Serialize};

/// Environment information for reproducing a bisection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_ram_bytes: Option<u64>,

    pub os: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_sha: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_dirty: Option<bool>,

    /// First line of `<compiler> --version` for every compiler involved
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub compilers: BTreeMap<String, String>,
}

impl Default for EnvironmentInfo {
    fn default() -> Self {
        EnvironmentInfo {
            cpu_model: None,
            cpu_cores: None,
            total_ram_bytes: None,
            os: std::env::consts::OS.to_string(),
            hostname: None,
            git_sha: None,
            git_dirty: None,
            compilers: BTreeMap::new(),
        }
    }
}

impl EnvironmentInfo {
    /// Detect environment information from the current system
    pub fn detect() -> Self {
        use sysinfo::System;

        let mut sys = System::new_all();
        sys.refresh_all();

        let cpu_model = sys.cpus().first().map(|c| c.brand().to_string());
        let cpu_cores = sys.physical_core_count().map(|c| c as u32);
        let total_ram_bytes = Some(sys.total_memory());
        let os = System::name().unwrap_or_else(|| std::env::consts::OS.to_string());
        let hostname = System::host_name();

        EnvironmentInfo {
            cpu_model,
            cpu_cores,
            total_ram_bytes,
            os,
            hostname,
            git_sha: detect_git_sha(),
            git_dirty: detect_git_dirty(),
            compilers: BTreeMap::new(),
        }
    }

    /// Record the version banner of each compiler binary that answers `--version`.
    pub fn with_compilers<'a>(mut self, binaries: impl IntoIterator<Item = &'a str>) -> Self {
        for binary in binaries {
            if let Some(version) = detect_compiler_version(binary) {
                self.compilers.insert(binary.to_string(), version);
            }
        }
        self
    }
}

/// Detect git SHA from `git rev-parse HEAD`
fn detect_git_sha() -> Option<String> {
    Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Detect if git working directory is dirty
fn detect_git_dirty() -> Option<bool> {
    Command::new("git")
        .args(["status", "--porcelain"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| !o.stdout.is_empty())
}

fn detect_compiler_version(binary: &str) -> Option<String> {
    Command::new(binary)
        .arg("--version")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_detect_has_os() {
        let env = EnvironmentInfo::detect();
        assert!(!env.os.is_empty());
    }

    #[test]
    fn test_environment_default() {
        let env = EnvironmentInfo::default();
        assert!(!env.os.is_empty());
        assert!(env.cpu_model.is_none());
        assert!(env.compilers.is_empty());
    }

    #[test]
    fn test_missing_compiler_is_skipped() {
        let env = EnvironmentInfo::default().with_compilers(["definitely-not-a-compiler-xyz"]);
        assert!(env.compilers.is_empty());
    }
}
