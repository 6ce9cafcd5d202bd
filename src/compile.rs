//! Per-job command assembly: argv and environment construction.
//!
//! Pure in-memory work — nothing here touches the filesystem or spawns
//! anything. The scheduler assembles an [`Invocation`] right before
//! dispatching a job, after every dependency (and thus every build script
//! output) has settled.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::cfg;
use crate::context::{BuildContext, host_triple, path_append};
use crate::manifest::{
    BuildState, Edition, PackageId, PackageManifest, PackageSet, PackageTarget, TargetKind,
};
use crate::plan::{Job, JobKind};

/// Everything the spawner needs to run one job.
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Additions on top of the inherited process environment.
    pub env: Vec<(String, OsString)>,
    pub cwd: Option<PathBuf>,
    /// The child's stdout is redirected here.
    pub logfile: PathBuf,
    /// Created before spawning (the script's `OUT_DIR`).
    pub ensure_dir: Option<PathBuf>,
}

/// Assemble the compiler or script invocation for `job`.
pub fn assemble(
    job: &Job,
    ctx: &BuildContext,
    set: &PackageSet,
    state: &BuildState,
) -> Result<Invocation> {
    match &job.kind {
        JobKind::BuildTarget {
            package,
            target,
            is_host,
        } => build_target(ctx, set, state, *package, target, *is_host),
        JobKind::BuildScript { package } => build_script(ctx, set, state, *package),
        JobKind::RunScript { package } => run_script(ctx, set, state, *package),
    }
}

fn build_target(
    ctx: &BuildContext,
    set: &PackageSet,
    state: &BuildState,
    id: PackageId,
    target: &PackageTarget,
    is_host: bool,
) -> Result<Invocation> {
    let p = &set[id];
    let (outfile, crate_type) = ctx.crate_output_path(p, target, is_host)?;

    let mut args: Vec<OsString> = Vec::new();
    args.push(p.directory.join(&target.path).into());
    push_args_common(&mut args, ctx, p, &outfile, is_host);

    args.push("--crate-name".into());
    args.push(target.name.clone().into());
    args.push("--crate-type".into());
    args.push(crate_type.into());

    let suffix = ctx.crate_suffix(p);
    if !suffix.is_empty() {
        let tag = &suffix[1..]; // without the leading dash
        if ctx.is_rustc() {
            args.push("-C".into());
            args.push(format!("metadata={tag}").into());
            if outfile.to_string_lossy().contains(&suffix) {
                args.push("-C".into());
                args.push(format!("extra-filename={suffix}").into());
            }
        } else {
            args.push("--crate-tag".into());
            args.push(tag.into());
        }
    }

    if let Some(target_name) = &ctx.opts.target_name {
        if !is_host {
            args.push("--target".into());
            args.push(target_name.clone().into());
            args.push("-C".into());
            let mut v = OsString::from("emit-build-command=");
            v.push(path_append(&outfile, ".sh"));
            args.push(v);
        }
    }

    // Whatever this package's own build script asked for.
    let script = state.script_output(id);
    for (_, dir) in &script.rustc_link_search {
        args.push("-L".into());
        args.push(dir.into());
    }
    for (kind, lib) in &script.rustc_link_lib {
        args.push("-l".into());
        match kind.as_deref() {
            Some("framework") => args.push(format!("framework={lib}").into()),
            _ => args.push(lib.into()),
        }
    }
    for c in &script.rustc_cfg {
        args.push("--cfg".into());
        args.push(c.into());
    }
    for flag in &script.rustc_flags {
        args.push(flag.into());
    }

    // A non-library target of a package that has a library links it.
    if target.kind != TargetKind::Lib {
        if let Some(lib) = p.library() {
            let (lib_path, _) = ctx.crate_output_path(p, lib, is_host)?;
            args.push("--extern".into());
            let mut v = OsString::from(format!("{}=", lib.name));
            v.push(lib_path);
            args.push(v);
        }
    }

    push_args_edition(&mut args, target.edition);
    if target.kind == TargetKind::Test {
        args.push("--test".into());
    }

    for dep in &p.main_deps {
        if !dep.is_disabled() {
            push_extern(&mut args, ctx, set, dep.key.as_str(), dep.package, is_host, true)?;
        }
    }
    if target.kind == TargetKind::Test {
        for dep in &p.dev_deps {
            if !dep.is_disabled() {
                push_extern(&mut args, ctx, set, dep.key.as_str(), dep.package, is_host, false)?;
            }
        }
    }

    let mut env = Vec::new();
    let out_dir = absolute(&ctx.output_dir(true))?.join(ctx.build_script_stem(p));
    env.push(("OUT_DIR".to_string(), out_dir.into()));
    for (k, v) in &script.rustc_env {
        env.push((k.clone(), v.into()));
    }
    push_env_common(&mut env, set, state, p)?;

    Ok(Invocation {
        program: ctx.compiler_path.clone(),
        args,
        env,
        cwd: None,
        logfile: path_append(&outfile, "_dbg.txt"),
        ensure_dir: None,
    })
}

fn build_script(
    ctx: &BuildContext,
    set: &PackageSet,
    state: &BuildState,
    id: PackageId,
) -> Result<Invocation> {
    let p = &set[id];
    let script_src = p
        .build_script
        .as_ref()
        .ok_or_else(|| anyhow!("package '{}' has no build script", p.name))?;
    let outfile = ctx.build_script_exe(p);

    let mut args: Vec<OsString> = Vec::new();
    args.push(p.directory.join(script_src).into());
    // Build scripts always run on the host.
    push_args_common(&mut args, ctx, p, &outfile, true);
    args.push("--crate-name".into());
    args.push("build".into());
    args.push("--crate-type".into());
    args.push("bin".into());
    push_args_edition(&mut args, p.edition);

    for dep in &p.build_deps {
        if !dep.is_disabled() {
            // Dependencies of build scripts are host-side, like the script.
            push_extern(&mut args, ctx, set, dep.key.as_str(), dep.package, true, false)?;
        }
    }

    let mut env = Vec::new();
    push_env_common(&mut env, set, state, p)?;

    Ok(Invocation {
        program: ctx.compiler_path.clone(),
        args,
        env,
        cwd: None,
        logfile: path_append(&outfile, "_dbg.txt"),
        ensure_dir: None,
    })
}

fn run_script(
    ctx: &BuildContext,
    set: &PackageSet,
    state: &BuildState,
    id: PackageId,
) -> Result<Invocation> {
    let p = &set[id];
    let out_dir = absolute(&ctx.output_dir(true))?.join(ctx.build_script_stem(p));
    let out_file = absolute(&ctx.build_script_output_file(p))?;
    let script_exe = absolute(&ctx.build_script_exe(p))?;

    let mut env: Vec<(String, OsString)> = Vec::new();
    for feat in &p.active_features {
        let name: String = feat
            .chars()
            .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() })
            .collect();
        env.push((format!("CARGO_FEATURE_{name}"), "1".into()));
    }
    env.push(("OUT_DIR".to_string(), out_dir.clone().into()));
    push_env_common(&mut env, set, state, p)?;

    let target = ctx
        .opts
        .target_name
        .clone()
        .unwrap_or_else(host_triple);
    env.push(("TARGET".to_string(), target.clone().into()));
    env.push(("HOST".to_string(), host_triple().into()));
    env.push(("NUM_JOBS".to_string(), "1".into()));
    env.push(("OPT_LEVEL".to_string(), "2".into()));
    env.push(("DEBUG".to_string(), "0".into()));
    env.push(("PROFILE".to_string(), "release".into()));
    env.push((
        "RUSTC".to_string(),
        ctx.compiler_path.clone().into_os_string(),
    ));
    if let Some(first) = ctx.opts.lib_search_dirs.first() {
        env.push(("MRUSTC_LIBDIR".to_string(), absolute(first)?.into()));
    }
    cfg::for_target(&target).push_env(&mut env);

    Ok(Invocation {
        program: script_exe,
        args: Vec::new(),
        env,
        cwd: Some(p.directory.clone()),
        logfile: out_file,
        ensure_dir: Some(out_dir),
    })
}

/// Arguments shared by every compile (targets and build scripts).
fn push_args_common(
    args: &mut Vec<OsString>,
    ctx: &BuildContext,
    p: &PackageManifest,
    outfile: &Path,
    is_for_host: bool,
) {
    args.push("-o".into());
    args.push(outfile.into());
    if ctx.is_rustc() {
        args.push("--emit".into());
        args.push("link,dep-info".into());
    } else {
        args.push("-C".into());
        let mut v = OsString::from("emit-depfile=");
        v.push(path_append(outfile, ".d"));
        args.push(v);
    }
    if ctx.opts.enable_debug {
        args.push("-g".into());
    }
    args.push("--cfg".into());
    args.push("debug_assertions".into());
    args.push("-O".into());
    if ctx.opts.emit_mmir {
        args.push("-C".into());
        args.push("codegen-type=monomir".into());
    }

    for dir in &ctx.opts.lib_search_dirs {
        args.push("-L".into());
        if is_for_host && ctx.opts.target_name.is_some() && !ctx.opts.emit_mmir {
            // Host units built during a cross compile want the host variant
            // of a target-tagged search directory (`prefix-<target>` ->
            // `prefix`), picking up the non-cross libraries.
            let target = ctx.opts.target_name.as_deref().unwrap_or("");
            let text = dir.to_string_lossy();
            let needle = format!("-{target}");
            match text.rfind(&needle) {
                Some(pos) => {
                    args.push(format!("{}{}", &text[..pos], &text[pos + needle.len()..]).into());
                }
                None => args.push(dir.into()),
            }
        } else {
            args.push(dir.into());
        }
    }
    args.push("-L".into());
    args.push(ctx.output_dir(is_for_host).into());
    if !is_for_host && ctx.opts.target_name.is_some() && !ctx.opts.emit_mmir {
        // Target units still link host-built proc macros.
        args.push("-L".into());
        args.push(ctx.output_dir(true).into());
    }

    for feat in &p.active_features {
        args.push("--cfg".into());
        args.push(format!("feature=\"{feat}\"").into());
    }
}

fn push_args_edition(args: &mut Vec<OsString>, edition: Edition) {
    let year = match edition {
        Edition::Unspec => return,
        Edition::E2015 => "2015",
        Edition::E2018 => "2018",
    };
    args.push("--edition".into());
    args.push(year.into());
}

/// `--extern <alias>=<path>` for a dependency's library.
fn push_extern(
    args: &mut Vec<OsString>,
    ctx: &BuildContext,
    set: &PackageSet,
    key: &str,
    dep: PackageId,
    is_host: bool,
    promote_proc_macro: bool,
) -> Result<()> {
    let m = &set[dep];
    let lib = m
        .library()
        .ok_or_else(|| anyhow!("dependency '{}' has no library target", m.name))?;
    let for_host = is_host || (promote_proc_macro && lib.is_proc_macro);
    let (path, _) = ctx.crate_output_path(m, lib, for_host)?;

    let alias = if key != m.name {
        key.replace('-', "_")
    } else {
        lib.name.clone()
    };
    args.push("--extern".into());
    let mut v = OsString::from(format!("{alias}="));
    v.push(path);
    args.push(v);
    Ok(())
}

/// Environment shared by compiles and script runs: package identity plus the
/// downstream exports of every enabled main dependency.
fn push_env_common(
    env: &mut Vec<(String, OsString)>,
    set: &PackageSet,
    state: &BuildState,
    p: &PackageManifest,
) -> Result<()> {
    env.push((
        "CARGO_MANIFEST_DIR".to_string(),
        absolute(&p.directory)?.into(),
    ));
    env.push(("CARGO_PKG_NAME".to_string(), p.name.clone().into()));
    env.push((
        "CARGO_PKG_VERSION".to_string(),
        p.version.to_string().into(),
    ));
    env.push((
        "CARGO_PKG_VERSION_MAJOR".to_string(),
        p.version.major.to_string().into(),
    ));
    env.push((
        "CARGO_PKG_VERSION_MINOR".to_string(),
        p.version.minor.to_string().into(),
    ));
    env.push((
        "CARGO_PKG_VERSION_PATCH".to_string(),
        p.version.patch.to_string().into(),
    ));
    for dep in &p.main_deps {
        if !dep.is_disabled() {
            for (k, v) in &state.script_output(dep.package).downstream_env {
                env.push((k.clone(), v.into()));
            }
        }
    }
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("absolutizing {}", path.display()))
}
