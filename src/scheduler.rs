//! The job scheduler: run ready jobs concurrently up to a bound.
//!
//! One coordinator owns all state transitions; worker threads only spawn
//! processes and report back. A job is ready when every dependency that was
//! actually scheduled has succeeded. A failure marks its transitive
//! dependents unreachable while independent branches keep draining.

use std::collections::HashMap;
use std::sync::{Mutex, mpsc};

use anyhow::{Result, anyhow, bail};

use crate::compile;
use crate::context::{BuildContext, path_append};
use crate::manifest::{BuildState, PackageSet};
use crate::plan::{BuildPlan, Job, JobKind};
use crate::spawn::{self, Invocation};
use crate::verbose::dprintln;

/// Execute every job in the plan. Returns `Ok(false)` when any job failed;
/// successful branches still ran to completion.
pub fn run_all(
    plan: &BuildPlan,
    ctx: &BuildContext,
    set: &PackageSet,
    state: &BuildState,
    num_jobs: usize,
    dry_run: bool,
) -> Result<bool> {
    let total = plan.jobs.len();
    if total == 0 {
        dprintln!("Nothing to do.");
        return Ok(true);
    }

    if dry_run {
        dprintln!("Would run {total} job(s):");
        for job in &plan.jobs {
            if job.dependencies.is_empty() {
                dprintln!("  {}", job.name);
            } else {
                dprintln!("  {}  <- {}", job.name, job.dependencies.join(", "));
            }
        }
        return Ok(true);
    }

    let name_to_idx: HashMap<&str, usize> = plan
        .jobs
        .iter()
        .enumerate()
        .map(|(i, j)| (j.name.as_str(), i))
        .collect();

    // Dependency names absent from the map refer to clean units; they are
    // already satisfied.
    let mut in_degree = vec![0usize; total];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); total];
    for (idx, job) in plan.jobs.iter().enumerate() {
        for dep in &job.dependencies {
            if let Some(&d) = name_to_idx.get(dep.as_str()) {
                in_degree[idx] += 1;
                dependents[d].push(idx);
            }
        }
    }

    let mut ready: Vec<usize> = (0..total).filter(|&i| in_degree[i] == 0).collect();

    let workers = if num_jobs == 0 {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
    } else {
        num_jobs
    };

    let (job_tx, job_rx) = mpsc::channel::<(usize, Invocation)>();
    let (result_tx, result_rx) = mpsc::channel::<(usize, bool)>();
    let job_rx = Mutex::new(job_rx);
    let job_rx_ref = &job_rx;

    std::thread::scope(|s| -> Result<bool> {
        for _ in 0..workers.min(total) {
            let tx = result_tx.clone();
            s.spawn(move || {
                loop {
                    let (idx, invocation) = match job_rx_ref.lock().unwrap().recv() {
                        Ok(job) => job,
                        Err(_) => break, // channel closed
                    };
                    let ok = spawn::spawn_and_wait(&invocation);
                    if tx.send((idx, ok)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let mut unreachable = vec![false; total];
        let mut completed = 0usize;
        let mut in_flight = 0usize;
        let mut any_failed = false;

        while completed < total {
            let batch: Vec<usize> = ready.drain(..).collect();
            for idx in batch {
                let job = &plan.jobs[idx];
                dprintln!("{} {}", verb(job), job.name);
                match compile::assemble(job, ctx, set, state) {
                    Ok(invocation) => {
                        let _ = job_tx.send((idx, invocation));
                        in_flight += 1;
                    }
                    Err(e) => {
                        eprintln!("error: cannot start '{}': {e:#}", job.name);
                        any_failed = true;
                        completed += 1;
                        on_failure(job, ctx, set);
                        mark_unreachable(idx, &dependents, &mut unreachable, &mut completed, plan);
                    }
                }
            }

            if in_flight == 0 {
                if completed >= total {
                    break;
                }
                if ready.is_empty() {
                    bail!(
                        "internal: {} of {total} job(s) cannot be scheduled",
                        total - completed
                    );
                }
                continue;
            }

            let (idx, spawned_ok) = result_rx
                .recv()
                .map_err(|_| anyhow!("worker threads terminated unexpectedly"))?;
            in_flight -= 1;
            completed += 1;
            let job = &plan.jobs[idx];

            let ok = spawned_ok && on_success(job, ctx, set, state);
            if ok {
                for &d in &dependents[idx] {
                    in_degree[d] -= 1;
                    if in_degree[d] == 0 && !unreachable[d] {
                        ready.push(d);
                    }
                }
            } else {
                any_failed = true;
                on_failure(job, ctx, set);
                mark_unreachable(idx, &dependents, &mut unreachable, &mut completed, plan);
            }
        }

        drop(job_tx);
        Ok(!any_failed)
    })
}

fn verb(job: &Job) -> &'static str {
    match job.kind {
        JobKind::RunScript { .. } => "RUNNING",
        _ => "BUILDING",
    }
}

/// Mark everything downstream of `idx` as unreachable.
fn mark_unreachable(
    idx: usize,
    dependents: &[Vec<usize>],
    unreachable: &mut [bool],
    completed: &mut usize,
    plan: &BuildPlan,
) {
    let mut stack = dependents[idx].to_vec();
    while let Some(d) = stack.pop() {
        if !unreachable[d] {
            unreachable[d] = true;
            *completed += 1;
            dprintln!("  skipping {} (dependency failed)", plan.jobs[d].name);
            stack.extend(dependents[d].iter().copied());
        }
    }
}

/// Post-success hook. Run scripts publish their captured output; compiles
/// have nothing to do.
fn on_success(job: &Job, ctx: &BuildContext, set: &PackageSet, state: &BuildState) -> bool {
    match &job.kind {
        JobKind::RunScript { package } => {
            let out = ctx.build_script_output_file(&set[*package]);
            match state.load_file(set, *package, &out) {
                Ok(()) => true,
                Err(e) => {
                    eprintln!("error: {e:#}");
                    false
                }
            }
        }
        _ => true,
    }
}

/// Post-failure hook. Compiles delete their (possibly partial) artifact so
/// the next invocation rebuilds; run scripts preserve the captured stdout
/// under a `_failed.txt` sibling.
fn on_failure(job: &Job, ctx: &BuildContext, set: &PackageSet) {
    match &job.kind {
        JobKind::BuildTarget { .. } | JobKind::BuildScript { .. } => {
            if let Ok(outfile) = job.outfile(ctx, set) {
                let _ = std::fs::remove_file(outfile);
            }
        }
        JobKind::RunScript { package } => {
            let out = ctx.build_script_output_file(&set[*package]);
            let preserved = path_append(&out, "_failed.txt");
            let _ = std::fs::remove_file(&preserved);
            let _ = std::fs::rename(&out, &preserved);
            eprintln!(
                "Calling {} failed (see {} for stdout)",
                ctx.build_script_exe(&set[*package]).display(),
                preserved.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testutil::test_context;
    use crate::graph;
    use crate::manifest::testutil::{dep, lib_package};
    use crate::plan;

    fn plan_for(
        set: &PackageSet,
        ctx: &BuildContext,
        state: &BuildState,
        root: crate::manifest::PackageId,
    ) -> BuildPlan {
        let list = graph::build_list(set, root, &ctx.opts).unwrap();
        plan::create(set, ctx, state, &list, root).unwrap()
    }

    #[test]
    fn empty_plan_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_context(tmp.path(), None);
        let set = PackageSet::new(None);
        let state = BuildState::default();
        let plan = BuildPlan {
            jobs: Vec::new(),
            clean: Vec::new(),
        };
        assert!(run_all(&plan, &ctx, &set, &state, 1, false).unwrap());
    }

    #[test]
    fn dry_run_spawns_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut set = PackageSet::new(None);
        let root = lib_package(&mut set, "root", "1.0.0");
        let mut ctx = test_context(tmp.path(), None);
        ctx.compiler_path = tmp.path().join("mrustc");

        let state = BuildState::default();
        let plan = plan_for(&set, &ctx, &state, root);
        assert_eq!(plan.jobs.len(), 1);
        // The fake compiler does not exist; a real spawn would fail.
        assert!(run_all(&plan, &ctx, &set, &state, 1, true).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn chain_succeeds_with_a_true_compiler() {
        let tmp = tempfile::tempdir().unwrap();
        let mut set = PackageSet::new(None);
        let root = lib_package(&mut set, "root", "1.0.0");
        let leaf = lib_package(&mut set, "leaf", "1.0.0");
        set.package_mut(root).main_deps.push(dep("leaf", leaf));

        let mut ctx = test_context(tmp.path(), None);
        ctx.compiler_path = std::path::PathBuf::from("/bin/true");

        let state = BuildState::default();
        let plan = plan_for(&set, &ctx, &state, root);
        assert_eq!(plan.jobs.len(), 2);
        assert!(run_all(&plan, &ctx, &set, &state, 2, false).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn failure_skips_dependents_but_not_independent_branches() {
        let tmp = tempfile::tempdir().unwrap();
        let mut set = PackageSet::new(None);
        let root = lib_package(&mut set, "root", "1.0.0");
        let leaf = lib_package(&mut set, "leaf", "1.0.0");
        set.package_mut(root).main_deps.push(dep("leaf", leaf));

        let mut ctx = test_context(tmp.path(), None);
        ctx.compiler_path = std::path::PathBuf::from("/bin/false");

        let state = BuildState::default();
        let plan = plan_for(&set, &ctx, &state, root);
        assert_eq!(plan.jobs.len(), 2);
        // leaf fails, root is skipped, the build reports failure.
        assert!(!run_all(&plan, &ctx, &set, &state, 1, false).unwrap());
    }
}
