//! minicargo — a minimal cargo-like build driver for the mrustc compiler.
//!
//! Pipeline: load manifests → activate features → expand the build list →
//! plan jobs against the staleness oracle → run them in parallel.

mod cfg;
mod cli;
mod compile;
mod context;
mod depfile;
mod error;
mod freshness;
mod graph;
mod manifest;
mod plan;
mod scheduler;
mod spawn;
mod timestamp;
mod verbose;

use anyhow::{Context, Result, bail};
use clap::Parser;

use verbose::{dprintln, vprintln};

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    verbose::init(cli.quiet, cli.verbose);

    let opts = context::BuildOptions {
        output_dir: cli.output_dir,
        target_name: cli.target,
        emit_mmir: cli.emit_mmir,
        enable_debug: cli.enable_debug,
        lib_search_dirs: cli.lib_search_dirs,
        build_script_overrides: cli.build_script_overrides,
        mode: cli.mode.into(),
    };
    let ctx = context::BuildContext::new(opts)?;
    vprintln!("  compiler: {}", ctx.compiler_path.display());

    dprintln!("Loading {}...", cli.manifest_path.display());
    let mut set = manifest::PackageSet::new(cli.vendor_dir);
    let root = {
        let _t = verbose::Timer::start("manifest loading");
        set.load_root(&cli.manifest_path)?
    };
    set.activate(root, &cli.features, ctx.opts.mode)?;
    vprintln!("  {} package(s) loaded", set.len());

    std::fs::create_dir_all(ctx.output_dir(false))?;
    std::fs::create_dir_all(ctx.output_dir(true))?;

    let list = graph::build_list(&set, root, &ctx.opts)?;
    let state = manifest::BuildState::default();
    let plan = {
        let _t = verbose::Timer::start("job planning");
        plan::create(&set, &ctx, &state, &list, root)?
    };
    dprintln!(
        "Planned {} job(s), {} unit(s) up to date.",
        plan.jobs.len(),
        plan.clean.len()
    );

    if let Some(path) = &cli.emit_plan {
        let json = serde_json::to_string_pretty(&plan.export(&set))?;
        std::fs::write(path, json)
            .with_context(|| format!("writing plan to {}", path.display()))?;
    }

    let ok = scheduler::run_all(
        &plan,
        &ctx,
        &set,
        &state,
        cli.jobs.unwrap_or(0),
        cli.dry_run,
    )?;
    if !ok {
        bail!("build failed");
    }
    dprintln!("Build complete.");
    Ok(())
}
