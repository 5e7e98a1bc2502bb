//! End-to-end bisection against the real toolchain (`c++`, `nm`, `objcopy`).
//!
//! A scratch project is written to a temporary directory and loaded through a config path
//! relative to the test's working directory. The unit under test defines global data, a
//! template instance (emitted weak) and plain functions; only the template differs between
//! the flag sets. Skipped when the tools are not installed.
#![cfg(unix)]

use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};

use fp_bisect::bisect_cmd::{EngineOptions, engine_from_config};
use fp_bisect::config::{DEFAULT_CONFIG_FILE, ProjectConfig};
use fp_bisect::core::FlagSet;
use fp_bisect::engine::BisectRequest;
use fp_bisect::report::{IssueKind, ReportStatus};

const CONFIG: &str = r#"
[project]
name = "scratch"
source_dir = "src"
cflags = ["-I", "include"]

[ground_truth]
compiler = "c++"
optimization = "-O0"

[run]
args = []
timeout_secs = 60

[compare]
kind = "numeric"
tolerance = 0.0

[artifacts]
root = "work"
"#;

const SCALE_H: &str = "\
#ifdef VAR
#define SCALE 2.0
#else
#define SCALE 1.0
#endif
";

const KERN_CPP: &str = "\
#include \"scale.h\"
double counter = 0.0;
template <class T> T tw(T x) { return x * SCALE; }
double kern(double x) { counter += 1.0; return x + 1.0; }
double other(double x) { return tw(x) + 0.5; }
";

const MAIN_CPP: &str = "\
#include <cstdio>
extern double counter;
double kern(double);
double other(double);
int main() {
    double k = kern(1.0);
    double o = other(1.0);
    std::printf(\"%g %g %g\\n\", k, o, counter);
    return 0;
}
";

fn tool_available(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

/// `path` spelled relative to the current directory.
fn relative_to_cwd(path: &Path) -> PathBuf {
    let cwd = std::env::current_dir().unwrap();
    let up: PathBuf = cwd.components().skip(1).map(|_| Component::ParentDir).collect();
    up.join(path.strip_prefix("/").unwrap())
}

fn write_project(root: &Path) {
    std::fs::create_dir_all(root.join("src")).unwrap();
    std::fs::create_dir_all(root.join("include")).unwrap();
    std::fs::write(root.join(DEFAULT_CONFIG_FILE), CONFIG).unwrap();
    std::fs::write(root.join("include/scale.h"), SCALE_H).unwrap();
    std::fs::write(root.join("src/kern.cpp"), KERN_CPP).unwrap();
    std::fs::write(root.join("src/main.cpp"), MAIN_CPP).unwrap();
}

#[test]
fn test_real_toolchain_isolates_weak_template_symbol() {
    if !["c++", "nm", "objcopy"].iter().all(|t| tool_available(t)) {
        eprintln!("skipping: c++, nm or objcopy not available");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path());

    let config_path = relative_to_cwd(&dir.path().join(DEFAULT_CONFIG_FILE));
    assert!(config_path.is_relative());
    let config = ProjectConfig::load(&config_path).unwrap();
    let engine =
        engine_from_config(&config, &EngineOptions { delete: true, ..Default::default() }).unwrap();

    let request =
        BisectRequest::new("scratch", "double", FlagSet::parse("c++ -O0 -DVAR").unwrap());
    let report = engine.bisect(&request).unwrap();

    assert_eq!(report.status, ReportStatus::Completed, "issues: {:?}", report.issues);
    assert_eq!(report.file_keys(), vec!["kern.cpp"]);
    let symbols: Vec<&str> =
        report.files[0].symbols.iter().map(|s| s.site.symbol.as_str()).collect();
    assert_eq!(symbols, vec!["_Z2twIdET_S0_"]);
    assert_eq!(report.files[0].symbol_verification_score, report.whole_score);
    assert!(report.interactions.is_empty());
    assert!(
        report
            .issues
            .iter()
            .all(|i| !matches!(i.kind, IssueKind::BuildFailure | IssueKind::InteractionDetected)),
        "issues: {:?}",
        report.issues
    );
    assert!(engine.artifacts().root().starts_with(dir.path().canonicalize().unwrap()));
}
