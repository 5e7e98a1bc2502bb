//! Build pipeline that drives a C/C++ compiler, `nm` and `objcopy` directly.
//!
//! Whole-unit assignment compiles each unit once with its assigned flags. Symbol-level
//! assignment compiles the scoped unit twice (`-fPIC`) and splices the two objects with
//! `objcopy` so the linker resolves every candidate function to exactly one flag set:
//!
//! - a strong definition the object does not own is weakened, and the sibling's strong
//!   copy wins;
//! - the variant object also weakens its data and every other non-candidate global, so
//!   globals keep a single strong definition (in the trusted object);
//! - an owned candidate emitted weak (inline functions, template instances) is renamed
//!   and re-added as a strong global at the same address. The rename also renames its
//!   COMDAT group, so the sibling's copy is no longer discarded as a duplicate and loses
//!   to the strong symbol instead.
//!
//! Calls between functions go through relocations against the global symbols, so they
//! reach whichever definition won.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::core::{Candidate, CompilationUnit, FlagSet, Scope, SymbolSite};
use crate::engine::exec::{CancelToken, Invocation, ProcessRunner};
use crate::{BisectError, BisectResult, absolute_path};

use super::traits::{BuildOutput, BuildPipeline, BuildRequest};

const SOURCE_EXTENSIONS: &[&str] = &["c", "cc", "cpp", "cxx", "C"];

/// Static description of the target project.
#[derive(Debug, Clone)]
pub struct ShellSettings {
    /// Directory the unit paths are relative to
    pub source_dir: PathBuf,
    /// Explicit unit list; scanned from `source_dir` when empty
    pub sources: Vec<CompilationUnit>,
    /// Flags added to every compile (include paths, defines)
    pub cflags: Vec<String>,
    /// Flags added to the link
    pub ldflags: Vec<String>,
    /// Compiler identifier -> binary
    pub compilers: HashMap<String, String>,
    pub nm: String,
    pub objcopy: String,
    /// File name of the linked test executable
    pub executable_name: String,
    /// Working directory of compiles and links; relative `cflags` and `ldflags` use it
    pub project_dir: PathBuf,
}

impl Default for ShellSettings {
    fn default() -> Self {
        ShellSettings {
            source_dir: PathBuf::from("."),
            sources: Vec::new(),
            cflags: Vec::new(),
            ldflags: Vec::new(),
            compilers: HashMap::new(),
            nm: "nm".to_string(),
            objcopy: "objcopy".to_string(),
            executable_name: "test-bin".to_string(),
            project_dir: PathBuf::from("."),
        }
    }
}

/// One object to produce.
#[derive(Debug, Clone)]
struct CompileJob<'a> {
    unit: &'a CompilationUnit,
    flags: &'a FlagSet,
    object: PathBuf,
    pic: bool,
    /// Set when a sibling object of the same unit is linked too
    splice: Option<Splice>,
}

/// Ownership of one of two objects compiled from the same unit.
#[derive(Debug, Clone)]
struct Splice {
    /// Candidates this object supplies
    owned: HashSet<String>,
    /// Every candidate of the unit
    candidates: HashSet<String>,
    /// Whether non-candidate globals stay strongly defined here
    owns_data: bool,
}

/// Suffix given to a promoted symbol's original name.
const PROMOTED_SUFFIX: &str = ".fpbisect";

/// A defined global from `nm --format=sysv --defined-only -g`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinedGlobal {
    pub name: String,
    /// nm symbol class (`T`, `W`, `D`, ...)
    pub class: char,
    pub value: u64,
    pub section: String,
}

impl DefinedGlobal {
    fn is_strong(&self) -> bool {
        matches!(self.class, 'T' | 'D' | 'B' | 'R' | 'G' | 'S')
    }

    fn is_weak(&self) -> bool {
        matches!(self.class, 'W' | 'V')
    }
}

/// `BuildPipeline` that shells out to the configured toolchain.
pub struct ShellBuildPipeline {
    settings: ShellSettings,
    runner: Arc<dyn ProcessRunner>,
}

impl ShellBuildPipeline {
    pub fn new(mut settings: ShellSettings, runner: Arc<dyn ProcessRunner>) -> Self {
        settings.source_dir = absolute_path(&settings.source_dir);
        settings.project_dir = absolute_path(&settings.project_dir);
        ShellBuildPipeline { settings, runner }
    }

    pub fn settings(&self) -> &ShellSettings {
        &self.settings
    }

    fn source_path(&self, unit: &CompilationUnit) -> PathBuf {
        self.settings.source_dir.join(&unit.path)
    }

    fn plan<'a>(
        &self,
        units: &'a [CompilationUnit],
        request: &BuildRequest<'a>,
        obj_dir: &Path,
    ) -> Vec<CompileJob<'a>> {
        let partition = request.partition;
        let mut jobs = Vec::with_capacity(units.len() + 1);
        for unit in units {
            let stem = unit.object_stem();
            match &partition.scope {
                Scope::Units => {
                    let flags =
                        if partition.is_variant(&unit.key()) { request.variant } else { request.trusted };
                    jobs.push(CompileJob {
                        unit,
                        flags,
                        object: obj_dir.join(format!("{stem}.o")),
                        pic: false,
                        splice: None,
                    });
                }
                Scope::Symbols { unit: scoped } if CompilationUnit::new(scoped).key() == unit.key() => {
                    // Only link the halves that actually own symbols.
                    let contested = !partition.trusted.is_empty() && !partition.variant.is_empty();
                    let candidates: HashSet<String> =
                        partition.trusted.iter().chain(&partition.variant).cloned().collect();
                    let splice = |owned: &[String], owns_data: bool| {
                        contested.then(|| Splice {
                            owned: owned.iter().cloned().collect(),
                            candidates: candidates.clone(),
                            owns_data,
                        })
                    };
                    if !partition.trusted.is_empty() || partition.variant.is_empty() {
                        jobs.push(CompileJob {
                            unit,
                            flags: request.trusted,
                            object: obj_dir.join(format!("{stem}_trusted.o")),
                            pic: true,
                            splice: splice(partition.trusted.as_slice(), true),
                        });
                    }
                    if !partition.variant.is_empty() {
                        jobs.push(CompileJob {
                            unit,
                            flags: request.variant,
                            object: obj_dir.join(format!("{stem}_variant.o")),
                            pic: true,
                            splice: splice(partition.variant.as_slice(), false),
                        });
                    }
                }
                Scope::Symbols { .. } => {
                    jobs.push(CompileJob {
                        unit,
                        flags: request.trusted,
                        object: obj_dir.join(format!("{stem}.o")),
                        pic: false,
                        splice: None,
                    });
                }
            }
        }
        jobs
    }

    fn compile(
        &self,
        job: &CompileJob<'_>,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> BisectResult<()> {
        let mut inv = Invocation::new(self.compiler_binary(job.flags))
            .args(job.flags.args())
            .args(self.settings.cflags.iter().cloned());
        if job.pic {
            inv = inv.arg("-fPIC");
        }
        let inv = inv
            .arg("-c")
            .arg(self.source_path(job.unit).to_string_lossy())
            .arg("-o")
            .arg(job.object.to_string_lossy())
            .current_dir(&self.settings.project_dir);

        let out = self.runner.run(&inv, timeout, cancel)?;
        if !out.success() {
            return Err(BisectError::Build(format!(
                "{} ({}): {}",
                job.unit,
                job.flags,
                out.failure_summary()
            )));
        }

        if let Some(splice) = &job.splice {
            self.splice(&job.object, splice, timeout, cancel)?;
        }
        Ok(())
    }

    /// Rewrite `object` so it only strongly defines what it owns.
    fn splice(
        &self,
        object: &Path,
        splice: &Splice,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> BisectResult<()> {
        let listing =
            self.run_nm(object, &["--format=sysv", "--defined-only", "-g"], timeout, cancel)?;
        let args = splice_args(&parse_nm_globals(&listing), splice);
        if args.is_empty() {
            return Ok(());
        }
        debug!(object = %object.display(), edits = args.len(), "splicing object");
        let inv = Invocation::new(&self.settings.objcopy)
            .args(args)
            .arg(object.to_string_lossy())
            .current_dir(&self.settings.project_dir);
        let out = self.runner.run(&inv, timeout, cancel)?;
        if !out.success() {
            return Err(BisectError::Build(format!(
                "objcopy {}: {}",
                object.display(),
                out.failure_summary()
            )));
        }
        Ok(())
    }

    /// Run `jobs` with at most `parallel` compiles in flight; first error wins.
    fn compile_all(
        &self,
        jobs: &[CompileJob<'_>],
        request: &BuildRequest<'_>,
    ) -> BisectResult<()> {
        let workers = request.jobs.clamp(1, jobs.len().max(1));
        let next = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        let first_error: Mutex<Option<BisectError>> = Mutex::new(None);

        std::thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| {
                    loop {
                        if failed.load(Ordering::SeqCst) || request.cancel.is_cancelled() {
                            break;
                        }
                        let i = next.fetch_add(1, Ordering::SeqCst);
                        let Some(job) = jobs.get(i) else {
                            break;
                        };
                        if let Err(e) = self.compile(job, request.timeout, request.cancel) {
                            failed.store(true, Ordering::SeqCst);
                            if let Ok(mut slot) = first_error.lock() {
                                slot.get_or_insert(e);
                            }
                            break;
                        }
                    }
                });
            }
        });

        if let Some(e) = first_error.into_inner().ok().flatten() {
            return Err(e);
        }
        if request.cancel.is_cancelled() {
            return Err(BisectError::Build("cancelled".into()));
        }
        Ok(())
    }

    fn run_nm(
        &self,
        object: &Path,
        args: &[&str],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> BisectResult<String> {
        let inv = Invocation::new(&self.settings.nm)
            .args(args.iter().map(|a| a.to_string()))
            .arg(object.to_string_lossy())
            .current_dir(&self.settings.project_dir);
        let out = self.runner.run(&inv, timeout, cancel)?;
        if !out.success() {
            return Err(BisectError::Build(format!(
                "nm {}: {}",
                object.display(),
                out.failure_summary()
            )));
        }
        Ok(out.stdout)
    }
}

fn scan_sources(dir: &Path, base: &Path, out: &mut Vec<CompilationUnit>) -> BisectResult<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| BisectError::io(format!("failed to read {}", dir.display()), e))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            scan_sources(&path, base, out)?;
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| SOURCE_EXTENSIONS.contains(&e))
        {
            let rel = path.strip_prefix(base).unwrap_or(&path).to_path_buf();
            out.push(CompilationUnit::new(rel));
        }
    }
    Ok(())
}

/// Parse `nm --format=sysv` output into its defined globals.
///
/// Rows are `name|value|class|type|size|line|section`; headers and blank lines carry no
/// `|` and are skipped.
pub fn parse_nm_globals(output: &str) -> Vec<DefinedGlobal> {
    output
        .lines()
        .filter(|line| line.contains('|'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('|').map(str::trim).collect();
            let [name, value, class, _kind, _size, _line, section] = fields[..] else {
                return None;
            };
            if name.is_empty() {
                return None;
            }
            Some(DefinedGlobal {
                name: name.to_string(),
                class: class.chars().next()?,
                value: u64::from_str_radix(value, 16).ok()?,
                section: section.to_string(),
            })
        })
        .collect()
}

/// `objcopy` arguments that leave `splice.owned` as the only strong candidates.
fn splice_args(globals: &[DefinedGlobal], splice: &Splice) -> Vec<String> {
    let mut args = Vec::new();
    for global in globals {
        let candidate = splice.candidates.contains(&global.name);
        let owned = splice.owned.contains(&global.name);
        if global.is_strong() {
            if (candidate && !owned) || (!candidate && !splice.owns_data) {
                args.push(format!("--weaken-symbol={}", global.name));
            }
        } else if global.is_weak() && owned && !global.section.is_empty() {
            let kind = if global.class == 'V' { "object" } else { "function" };
            args.push("--redefine-sym".to_string());
            args.push(format!("{0}={0}{PROMOTED_SUFFIX}", global.name));
            args.push("--add-symbol".to_string());
            args.push(format!("{}={}:{},global,{kind}", global.name, global.section, global.value));
        }
    }
    args
}

/// Parse `nm -p --defined-only --line-numbers` output of one object.
///
/// `mangled` and `demangled` are the outputs without and with `-C`; lines are paired by
/// position. Only global text symbols (`T`, `W`) are kept.
pub fn parse_nm_output(unit: &CompilationUnit, mangled: &str, demangled: &str) -> Vec<SymbolSite> {
    fn parse_line(line: &str) -> Option<(char, String, Option<(PathBuf, u32)>)> {
        let (head, location) = match line.split_once('\t') {
            Some((head, loc)) => (head, Some(loc.trim())),
            None => (line, None),
        };
        let mut parts = head.trim().splitn(3, ' ');
        let _address = parts.next()?;
        let kind = parts.next()?.chars().next()?;
        let name = parts.next()?.trim().to_string();
        if name.is_empty() {
            return None;
        }
        let location = location.and_then(|loc| {
            let (file, line) = loc.rsplit_once(':')?;
            Some((PathBuf::from(file), line.parse().ok()?))
        });
        Some((kind, name, location))
    }

    let mangled: Vec<_> = mangled.lines().filter_map(parse_line).collect();
    let demangled: Vec<_> = demangled.lines().filter_map(parse_line).collect();

    mangled
        .into_iter()
        .enumerate()
        .filter(|(_, (kind, _, _))| matches!(kind, 'T' | 'W'))
        .map(|(i, (_, symbol, location))| {
            let mut site = SymbolSite::new(&unit.path, symbol);
            if let Some((_, signature, _)) = demangled.get(i) {
                site = site.with_signature(signature.clone());
            }
            if let Some((file, line)) = location {
                site = site.with_location(file, line);
            }
            site
        })
        .collect()
}

impl BuildPipeline for ShellBuildPipeline {
    fn name(&self) -> &str {
        "shell"
    }

    fn units(&self) -> BisectResult<Vec<CompilationUnit>> {
        if !self.settings.sources.is_empty() {
            return Ok(self.settings.sources.clone());
        }
        let mut units = Vec::new();
        scan_sources(&self.settings.source_dir, &self.settings.source_dir, &mut units)?;
        units.sort();
        if units.is_empty() {
            return Err(BisectError::Message(format!(
                "no sources found in {}",
                self.settings.source_dir.display()
            )));
        }
        Ok(units)
    }

    fn symbols(
        &self,
        unit: &CompilationUnit,
        flags: &FlagSet,
        workdir: &Path,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> BisectResult<Vec<SymbolSite>> {
        const LISTING: &[&str] = &["-p", "--defined-only", "--line-numbers"];
        let object = absolute_path(workdir).join(format!("{}_symbols.o", unit.object_stem()));
        let job = CompileJob { unit, flags, object: object.clone(), pic: true, splice: None };
        self.compile(&job, timeout, cancel)?;

        let mangled = self.run_nm(&object, LISTING, timeout, cancel)?;
        let demangling: Vec<&str> = std::iter::once("-C").chain(LISTING.iter().copied()).collect();
        let demangled = self.run_nm(&object, &demangling, timeout, cancel)?;
        let sites = parse_nm_output(unit, &mangled, &demangled);
        debug!(unit = %unit, count = sites.len(), "extracted symbols");
        Ok(sites)
    }

    fn build(&self, request: &BuildRequest<'_>) -> BisectResult<BuildOutput> {
        let start = Instant::now();
        let units = self.units()?;
        let workdir = absolute_path(request.workdir);
        let obj_dir = workdir.join("obj");
        std::fs::create_dir_all(&obj_dir)
            .map_err(|e| BisectError::io(format!("failed to create {}", obj_dir.display()), e))?;

        let jobs = self.plan(&units, request, &obj_dir);
        self.compile_all(&jobs, request)?;

        let executable = workdir.join(&self.settings.executable_name);
        let link = Invocation::new(self.compiler_binary(request.trusted))
            .args(jobs.iter().map(|j| j.object.to_string_lossy().to_string()))
            .arg("-o")
            .arg(executable.to_string_lossy())
            .args(self.settings.ldflags.iter().cloned())
            .current_dir(&self.settings.project_dir);
        let out = self.runner.run(&link, request.timeout, request.cancel)?;
        if !out.success() {
            return Err(BisectError::Build(format!("link: {}", out.failure_summary())));
        }

        let build_time_ms = start.elapsed().as_millis();
        info!(objects = jobs.len(), build_time_ms, "linked {}", executable.display());
        Ok(BuildOutput { executable, build_time_ms, objects: jobs.len() })
    }

    fn compiler_binary(&self, flags: &FlagSet) -> String {
        self.settings
            .compilers
            .get(&flags.compiler)
            .cloned()
            .unwrap_or_else(|| flags.compiler.clone())
    }
}
