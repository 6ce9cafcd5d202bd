//! The job planner: turn the build list into concrete, dependency-wired jobs.
//!
//! Each unit becomes up to three jobs (build-script compile, build-script
//! run, target compile). Only dirty units are scheduled; clean units are
//! recorded with their output timestamp so downstream staleness checks can
//! consult them. A scheduled dependency always dirties its dependents.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;

use crate::context::{BuildContext, BuildMode};
use crate::error::DriverError;
use crate::freshness;
use crate::graph::GraphEntry;
use crate::manifest::{BuildState, PackageId, PackageSet, PackageTarget, TargetKind};
use crate::timestamp::Timestamp;
use crate::verbose::vprintln;

/// A schedulable unit of work.
#[derive(Clone, Debug)]
pub struct Job {
    /// Globally unique key, also used for dependency references.
    pub name: String,
    /// Names of jobs that must succeed before this one starts. Names that
    /// were never scheduled refer to clean units and count as satisfied.
    pub dependencies: Vec<String>,
    pub kind: JobKind,
}

#[derive(Clone, Debug)]
pub enum JobKind {
    /// Compile a package target into an artifact.
    BuildTarget {
        package: PackageId,
        target: PackageTarget,
        is_host: bool,
    },
    /// Compile a package's build script into an executable.
    BuildScript { package: PackageId },
    /// Execute a build script and capture its stdout.
    RunScript { package: PackageId },
}

impl Job {
    pub fn package(&self) -> PackageId {
        match &self.kind {
            JobKind::BuildTarget { package, .. }
            | JobKind::BuildScript { package }
            | JobKind::RunScript { package } => *package,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match &self.kind {
            JobKind::BuildTarget { .. } => "build-target",
            JobKind::BuildScript { .. } => "build-script",
            JobKind::RunScript { .. } => "run-script",
        }
    }

    /// The file this job produces.
    pub fn outfile(&self, ctx: &BuildContext, set: &PackageSet) -> Result<PathBuf> {
        match &self.kind {
            JobKind::BuildTarget {
                package,
                target,
                is_host,
            } => Ok(ctx.crate_output_path(&set[*package], target, *is_host)?.0),
            JobKind::BuildScript { package } => Ok(ctx.build_script_exe(&set[*package])),
            JobKind::RunScript { package } => Ok(ctx.build_script_output_file(&set[*package])),
        }
    }
}

/// The planner's result: scheduled jobs in a valid topological order, plus
/// the names of units found up to date.
#[derive(Debug)]
pub struct BuildPlan {
    pub jobs: Vec<Job>,
    pub clean: Vec<String>,
}

impl BuildPlan {
    /// Serializable view of the plan for `--emit-plan`.
    pub fn export<'a>(&'a self, set: &'a PackageSet) -> PlanExport<'a> {
        PlanExport {
            jobs: self
                .jobs
                .iter()
                .map(|j| PlanJob {
                    name: &j.name,
                    kind: j.kind_str(),
                    package: &set[j.package()].name,
                    dependencies: &j.dependencies,
                })
                .collect(),
            clean: &self.clean,
        }
    }
}

#[derive(Serialize)]
pub struct PlanExport<'a> {
    jobs: Vec<PlanJob<'a>>,
    clean: &'a [String],
}

#[derive(Serialize)]
struct PlanJob<'a> {
    name: &'a str,
    kind: &'static str,
    package: &'a str,
    dependencies: &'a [String],
}

struct Planner<'a> {
    set: &'a PackageSet,
    ctx: &'a BuildContext,
    state: &'a BuildState,
    /// Names of scheduled (dirty) jobs.
    scheduled: HashSet<String>,
    /// Clean units and their output timestamps.
    unbuilt: HashMap<String, Timestamp>,
    jobs: Vec<Job>,
    clean: Vec<String>,
}

impl Planner<'_> {
    /// Wire a dependency by job key. If the dependency is scheduled, record
    /// the edge and report dirty; if it is clean, report dirty only when its
    /// output is newer than `output_ts`.
    fn handle_dep(&self, deps: &mut Vec<String>, output_ts: Timestamp, key: &str) -> Result<bool> {
        if self.scheduled.contains(key) {
            deps.push(key.to_string());
            Ok(true)
        } else {
            let ts = self
                .unbuilt
                .get(key)
                .ok_or_else(|| anyhow!("internal: dependency job '{key}' was never planned"))?;
            Ok(output_ts < *ts)
        }
    }

    fn add_job(&mut self, job: Job, ts: Timestamp, dirty: bool) -> Result<()> {
        if self.scheduled.contains(&job.name) || self.unbuilt.contains_key(&job.name) {
            bail!("duplicate job name '{}'", job.name);
        }
        if dirty {
            vprintln!("  dirty: {}", job.name);
            self.scheduled.insert(job.name.clone());
            self.jobs.push(job);
        } else {
            vprintln!("  clean: {}", job.name);
            self.unbuilt.insert(job.name.clone(), ts);
            self.clean.push(job.name);
        }
        Ok(())
    }

    /// Plan a package's build script handling.
    ///
    /// Returns the job name the dependent target must wait for, if any.
    /// In override mode the recorded output is loaded and no jobs are
    /// emitted.
    fn handle_build_script(&mut self, id: PackageId, is_host: bool) -> Result<Option<String>> {
        let p = &self.set[id];
        if p.build_script.is_none() {
            return Ok(None);
        }

        if let Some(overrides) = &self.ctx.opts.build_script_overrides {
            let override_file = overrides.join(format!("build_{}.txt", p.name));
            if !override_file.is_file() {
                return Err(DriverError::OverrideMissing(override_file).into());
            }
            self.state.load_file(self.set, id, &override_file)?;
            return Ok(None);
        }

        // Compile the script.
        let bs_name = self.ctx.job_key(p, true, false);
        let bs_exe = self.ctx.build_script_exe(p);
        let script_ts = Timestamp::for_file(&bs_exe);
        let mut dirty = freshness::needs_rebuild(self.ctx, &bs_exe);
        let mut bs_deps = Vec::new();
        for dep in &p.build_deps {
            if !dep.is_disabled() {
                let key = self.ctx.job_key(&self.set[dep.package], false, true);
                dirty |= self.handle_dep(&mut bs_deps, script_ts, &key)?;
            }
        }
        self.add_job(
            Job {
                name: bs_name.clone(),
                dependencies: bs_deps,
                kind: JobKind::BuildScript { package: id },
            },
            script_ts,
            dirty,
        )?;

        let out_file = self.ctx.build_script_output_file(p);

        // In MMIR mode a previous non-MMIR run of the same script produced
        // identical output; reuse it instead of running under the
        // interpreter. The `-mmir/` marker comes from the conventional
        // output directory naming.
        if self.ctx.opts.emit_mmir {
            let text = out_file.to_string_lossy();
            if let Some(pos) = text.rfind("-mmir/") {
                let sibling = format!("{}{}", &text[..pos], &text[pos + 5..]);
                if Path::new(&sibling).is_file() {
                    vprintln!("  reusing script output {sibling}");
                    std::fs::copy(&sibling, &out_file).with_context(|| {
                        format!("copying script output {sibling} to {}", out_file.display())
                    })?;
                    self.state.load_file(self.set, id, &out_file)?;
                    return Ok(Some(bs_name));
                }
            }
        }

        // Run the script.
        let run_name = format!("{} (script run)", self.ctx.job_key(p, false, false));
        let output_ts = Timestamp::for_file(&out_file);
        let mut run_deps = Vec::new();
        let _ = self.handle_dep(&mut run_deps, output_ts, &bs_name)?;
        for dep in &p.main_deps {
            if !dep.is_disabled() {
                let key = self.ctx.job_key(&self.set[dep.package], false, is_host);
                dirty |= self.handle_dep(&mut run_deps, output_ts, &key)?;
            }
        }
        let needs_run = dirty || output_ts < script_ts;
        self.add_job(
            Job {
                name: run_name.clone(),
                dependencies: run_deps,
                kind: JobKind::RunScript { package: id },
            },
            output_ts,
            needs_run,
        )?;

        if needs_run {
            Ok(Some(run_name))
        } else {
            // Not running, but dependents still need the recorded environment.
            self.state.load_file(self.set, id, &out_file)?;
            Ok(None)
        }
    }

    /// Plan the compile job for one target of a package.
    fn push_target(
        &mut self,
        id: PackageId,
        target: &PackageTarget,
        is_host: bool,
        script_dep: Option<&str>,
        depend_on_own_library: bool,
    ) -> Result<()> {
        let p = &self.set[id];
        let name = self.ctx.job_key_for_target(p, target, is_host);
        vprintln!("considering {name}");

        let (outfile, _) = self.ctx.crate_output_path(p, target, is_host)?;
        let output_ts = Timestamp::for_file(&outfile);
        let mut dirty = freshness::needs_rebuild(self.ctx, &outfile);
        let mut deps = Vec::new();

        if let Some(script) = script_dep {
            deps.push(script.to_string());
            dirty = true;
        }
        if depend_on_own_library {
            let key = self.ctx.job_key(p, false, is_host);
            dirty |= self.handle_dep(&mut deps, output_ts, &key)?;
        } else {
            for dep in &p.main_deps {
                if !dep.is_disabled() {
                    let key = self.ctx.job_key(&self.set[dep.package], false, is_host);
                    dirty |= self.handle_dep(&mut deps, output_ts, &key)?;
                }
            }
        }

        self.add_job(
            Job {
                name,
                dependencies: deps,
                kind: JobKind::BuildTarget {
                    package: id,
                    target: target.clone(),
                    is_host,
                },
            },
            output_ts,
            dirty,
        )
    }
}

/// Plan jobs for the whole build list plus the root's own targets.
pub fn create(
    set: &PackageSet,
    ctx: &BuildContext,
    state: &BuildState,
    list: &[GraphEntry],
    root: PackageId,
) -> Result<BuildPlan> {
    let mut planner = Planner {
        set,
        ctx,
        state,
        scheduled: HashSet::new(),
        unbuilt: HashMap::new(),
        jobs: Vec::new(),
        clean: Vec::new(),
    };

    for entry in list {
        let p = &set[entry.package];
        let lib = p
            .library()
            .ok_or_else(|| {
                anyhow!(
                    "package '{}' ({}) in the build list has no library target",
                    p.name,
                    p.manifest_path.display()
                )
            })?
            .clone();
        let script_dep = planner.handle_build_script(entry.package, entry.is_host)?;
        planner.push_target(entry.package, &lib, entry.is_host, script_dep.as_deref(), false)?;
    }

    // The root's own binaries (or test targets) build against the root
    // library when there is one, else directly against its dependencies.
    let root_is_host = !ctx.is_cross_compiling;
    let root_has_lib = set[root].has_library();
    let root_script_dep = if !root_has_lib {
        planner.handle_build_script(root, root_is_host)?
    } else {
        None
    };

    let kinds: &[TargetKind] = match ctx.opts.mode {
        BuildMode::Normal => &[TargetKind::Bin],
        BuildMode::Test => &[TargetKind::Test],
        BuildMode::Examples => &[],
    };
    for kind in kinds {
        let targets: Vec<PackageTarget> = set[root].targets_of_kind(*kind).cloned().collect();
        for target in targets {
            planner.push_target(
                root,
                &target,
                root_is_host,
                root_script_dep.as_deref(),
                root_has_lib,
            )?;
        }
    }

    Ok(BuildPlan {
        jobs: planner.jobs,
        clean: planner.clean,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testutil::test_context;
    use crate::graph;
    use crate::manifest::testutil::{dep, lib_package};
    use std::path::PathBuf;

    fn job<'a>(plan: &'a BuildPlan, name: &str) -> &'a Job {
        plan.jobs
            .iter()
            .find(|j| j.name == name)
            .unwrap_or_else(|| {
                let names: Vec<&str> = plan.jobs.iter().map(|j| j.name.as_str()).collect();
                panic!("job '{name}' not found; have: {names:?}");
            })
    }

    fn position(plan: &BuildPlan, name: &str) -> usize {
        plan.jobs.iter().position(|j| j.name == name).unwrap()
    }

    #[test]
    fn cross_compiled_package_with_script_plans_all_phases() {
        // a (root) depends on b, and has a build script with build-dep c.
        let tmp = tempfile::tempdir().unwrap();
        let mut set = PackageSet::new(None);
        let a = lib_package(&mut set, "a", "1.0.0");
        let b = lib_package(&mut set, "b", "1.0.0");
        let c = lib_package(&mut set, "c", "1.0.0");
        set.package_mut(a).main_deps.push(dep("b", b));
        set.package_mut(a).build_script = Some(PathBuf::from("build.rs"));
        set.package_mut(a).build_deps.push(dep("c", c));

        let mut ctx = test_context(tmp.path(), Some("tgt"));
        ctx.compiler_path = tmp.path().join("mrustc");

        let list = graph::build_list(&set, a, &ctx.opts).unwrap();
        let state = BuildState::default();
        let plan = create(&set, &ctx, &state, &list, a).unwrap();

        // Everything is missing, so every phase is scheduled.
        let expected = [
            "b v1.0.0",
            "c v1.0.0 (host)",
            "a v1.0.0 (build)",
            "a v1.0.0 (script run)",
            "a v1.0.0",
        ];
        for name in expected {
            job(&plan, name);
        }
        assert_eq!(plan.jobs.len(), expected.len());

        // Dependency wiring follows the script pipeline.
        assert!(job(&plan, "a v1.0.0 (build)")
            .dependencies
            .contains(&"c v1.0.0 (host)".to_string()));
        let run = job(&plan, "a v1.0.0 (script run)");
        assert!(run.dependencies.contains(&"a v1.0.0 (build)".to_string()));
        assert!(run.dependencies.contains(&"b v1.0.0".to_string()));
        let lib = job(&plan, "a v1.0.0");
        assert!(lib.dependencies.contains(&"a v1.0.0 (script run)".to_string()));
        assert!(lib.dependencies.contains(&"b v1.0.0".to_string()));

        // Planner order is itself topological.
        assert!(position(&plan, "b v1.0.0") < position(&plan, "a v1.0.0 (script run)"));
        assert!(position(&plan, "c v1.0.0 (host)") < position(&plan, "a v1.0.0 (build)"));
        assert!(position(&plan, "a v1.0.0 (build)") < position(&plan, "a v1.0.0 (script run)"));
        assert!(position(&plan, "a v1.0.0 (script run)") < position(&plan, "a v1.0.0"));
    }

    #[test]
    fn override_mode_emits_no_script_jobs() {
        let tmp = tempfile::tempdir().unwrap();
        let overrides = tmp.path().join("ov");
        std::fs::create_dir_all(&overrides).unwrap();
        std::fs::write(
            overrides.join("build_foo.txt"),
            "cargo:rustc-cfg=from_override\n",
        )
        .unwrap();

        let mut set = PackageSet::new(None);
        let foo = lib_package(&mut set, "foo", "1.0.0");
        set.package_mut(foo).build_script = Some(PathBuf::from("build.rs"));

        let mut ctx = test_context(tmp.path(), None);
        ctx.compiler_path = tmp.path().join("mrustc");
        ctx.opts.build_script_overrides = Some(overrides);

        let list = graph::build_list(&set, foo, &ctx.opts).unwrap();
        let state = BuildState::default();
        let plan = create(&set, &ctx, &state, &list, foo).unwrap();

        assert_eq!(plan.jobs.len(), 1, "only the library compile: {:?}",
            plan.jobs.iter().map(|j| &j.name).collect::<Vec<_>>());
        assert!(matches!(plan.jobs[0].kind, JobKind::BuildTarget { .. }));
        assert!(state.has_output(foo));
        assert_eq!(state.script_output(foo).rustc_cfg, vec!["from_override"]);
    }

    #[test]
    fn missing_override_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let overrides = tmp.path().join("ov");
        std::fs::create_dir_all(&overrides).unwrap();

        let mut set = PackageSet::new(None);
        let foo = lib_package(&mut set, "foo", "1.0.0");
        set.package_mut(foo).build_script = Some(PathBuf::from("build.rs"));

        let mut ctx = test_context(tmp.path(), None);
        ctx.opts.build_script_overrides = Some(overrides);

        let list = graph::build_list(&set, foo, &ctx.opts).unwrap();
        let state = BuildState::default();
        let err = create(&set, &ctx, &state, &list, foo).unwrap_err();
        assert!(
            matches!(err.downcast_ref(), Some(DriverError::OverrideMissing(_))),
            "got: {err:#}"
        );
    }

    #[test]
    fn dev_dependency_scheduled_only_in_test_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let mut set = PackageSet::new(None);
        let root = lib_package(&mut set, "root", "1.0.0");
        let devdep = lib_package(&mut set, "dev", "1.0.0");
        set.package_mut(root).dev_deps.push(dep("dev", devdep));
        set.package_mut(root).targets.push(PackageTarget {
            name: "suite".to_string(),
            path: PathBuf::from("tests/suite.rs"),
            kind: TargetKind::Test,
            crate_types: Vec::new(),
            is_proc_macro: false,
            edition: crate::manifest::Edition::E2018,
        });

        let mut ctx = test_context(tmp.path(), None);
        ctx.compiler_path = tmp.path().join("mrustc");

        let list = graph::build_list(&set, root, &ctx.opts).unwrap();
        let state = BuildState::default();
        let plan = create(&set, &ctx, &state, &list, root).unwrap();
        assert!(!plan.jobs.iter().any(|j| j.name.starts_with("dev ")));

        ctx.opts.mode = BuildMode::Test;
        let list = graph::build_list(&set, root, &ctx.opts).unwrap();
        let state = BuildState::default();
        let plan = create(&set, &ctx, &state, &list, root).unwrap();
        assert!(plan.jobs.iter().any(|j| j.name == "dev v1.0.0"));
        // The test target builds against the root library.
        let test_job = job(&plan, "root v1.0.0 (test suite)");
        assert!(test_job.dependencies.contains(&"root v1.0.0".to_string()));
    }

    #[test]
    fn up_to_date_package_produces_no_jobs() {
        use std::time::{Duration, SystemTime};

        let tmp = tempfile::tempdir().unwrap();
        let mut set = PackageSet::new(None);
        let solo = lib_package(&mut set, "solo", "1.0.0");

        let mut ctx = test_context(tmp.path(), None);
        ctx.compiler_path = tmp.path().join("mrustc");

        let now = SystemTime::now();
        let touch_at = |path: &Path, when: SystemTime| {
            std::fs::write(path, "x").unwrap();
            std::fs::File::options()
                .write(true)
                .open(path)
                .unwrap()
                .set_modified(when)
                .unwrap();
        };
        touch_at(&ctx.compiler_path, now - Duration::from_secs(600));
        let lib = set[solo].library().unwrap().clone();
        let (outfile, _) = ctx.crate_output_path(&set[solo], &lib, true).unwrap();
        let src = tmp.path().join("lib.rs");
        touch_at(&src, now - Duration::from_secs(300));
        touch_at(&outfile, now);
        std::fs::write(
            crate::context::path_append(&outfile, ".d"),
            format!("{}: {}\n", outfile.display(), src.display()),
        )
        .unwrap();

        let list = graph::build_list(&set, solo, &ctx.opts).unwrap();
        let state = BuildState::default();
        let plan = create(&set, &ctx, &state, &list, solo).unwrap();
        assert!(plan.jobs.is_empty(), "expected no jobs: {:?}",
            plan.jobs.iter().map(|j| &j.name).collect::<Vec<_>>());
        assert_eq!(plan.clean, vec!["solo v1.0.0"]);
    }

    #[test]
    fn dirty_dependency_forces_dependent_rebuild() {
        use std::time::{Duration, SystemTime};

        let tmp = tempfile::tempdir().unwrap();
        let mut set = PackageSet::new(None);
        let root = lib_package(&mut set, "root", "1.0.0");
        let leaf = lib_package(&mut set, "leaf", "1.0.0");
        set.package_mut(root).main_deps.push(dep("leaf", leaf));

        let mut ctx = test_context(tmp.path(), None);
        ctx.compiler_path = tmp.path().join("mrustc");

        // The root artifact exists and is newer than everything, but the
        // leaf artifact is missing, so both get scheduled.
        let now = SystemTime::now();
        std::fs::write(&ctx.compiler_path, "x").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&ctx.compiler_path)
            .unwrap()
            .set_modified(now - Duration::from_secs(600))
            .unwrap();
        let root_lib = set[root].library().unwrap().clone();
        let (root_out, _) = ctx.crate_output_path(&set[root], &root_lib, true).unwrap();
        std::fs::write(&root_out, "x").unwrap();

        let list = graph::build_list(&set, root, &ctx.opts).unwrap();
        let state = BuildState::default();
        let plan = create(&set, &ctx, &state, &list, root).unwrap();

        let root_job = job(&plan, "root v1.0.0");
        assert!(root_job.dependencies.contains(&"leaf v1.0.0".to_string()));
    }

    #[test]
    fn binary_only_root_waits_for_its_script_run() {
        let tmp = tempfile::tempdir().unwrap();
        let mut set = PackageSet::new(None);
        let root = lib_package(&mut set, "app", "1.0.0");
        // Binary-only package: replace the library with a binary target.
        set.package_mut(root).targets.clear();
        set.package_mut(root).targets.push(PackageTarget {
            name: "app".to_string(),
            path: PathBuf::from("src/main.rs"),
            kind: TargetKind::Bin,
            crate_types: Vec::new(),
            is_proc_macro: false,
            edition: crate::manifest::Edition::E2018,
        });
        set.package_mut(root).build_script = Some(PathBuf::from("build.rs"));

        let mut ctx = test_context(tmp.path(), None);
        ctx.compiler_path = tmp.path().join("mrustc");

        let list = graph::build_list(&set, root, &ctx.opts).unwrap();
        let state = BuildState::default();
        let plan = create(&set, &ctx, &state, &list, root).unwrap();

        let bin = job(&plan, "app v1.0.0 (bin app)");
        assert!(bin
            .dependencies
            .contains(&"app v1.0.0 (script run)".to_string()));
    }

    #[test]
    fn duplicate_job_names_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut set = PackageSet::new(None);
        let a = lib_package(&mut set, "twin", "1.0.0");
        let b = lib_package(&mut set, "twin", "1.0.0");

        let mut ctx = test_context(tmp.path(), None);
        ctx.compiler_path = tmp.path().join("mrustc");

        let list = vec![
            GraphEntry { package: a, is_host: true },
            GraphEntry { package: b, is_host: true },
        ];
        let state = BuildState::default();
        let err = create(&set, &ctx, &state, &list, a).unwrap_err();
        assert!(err.to_string().contains("duplicate job name"), "got: {err:#}");
    }
}
