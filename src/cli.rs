//! Command-line interface definitions for minicargo.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::context::BuildMode;

/// Minimal cargo-like build driver for the mrustc compiler.
#[derive(Parser)]
#[command(name = "minicargo", version, about)]
pub struct Cli {
    /// Root package directory (or its Cargo.toml).
    pub manifest_path: PathBuf,

    /// Directory where build artifacts are placed.
    #[arg(long, default_value = "output")]
    pub output_dir: PathBuf,

    /// Target triple to cross-compile for.
    #[arg(long)]
    pub target: Option<String>,

    /// Features to enable on the root package.
    #[arg(long, value_delimiter = ',')]
    pub features: Vec<String>,

    /// Directory of pre-recorded build script outputs; scripts are neither
    /// compiled nor run when this is set.
    #[arg(long, value_name = "DIR")]
    pub build_script_overrides: Option<PathBuf>,

    /// Directory searched for dependencies that have no explicit `path`.
    #[arg(long, value_name = "DIR")]
    pub vendor_dir: Option<PathBuf>,

    /// What to build.
    #[arg(long, value_enum, default_value = "normal")]
    pub mode: ModeArg,

    /// Maximum number of concurrent jobs (0 = auto-detect from CPU count).
    #[arg(short = 'j', long = "jobs")]
    pub jobs: Option<usize>,

    /// Print the plan without spawning anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Use the alternative MMIR codegen mode.
    #[arg(long)]
    pub emit_mmir: bool,

    /// Pass -g to the compiler.
    #[arg(short = 'g')]
    pub enable_debug: bool,

    /// Extra library search directories.
    #[arg(short = 'L', value_name = "DIR")]
    pub lib_search_dirs: Vec<PathBuf>,

    /// Write the planned job graph as JSON.
    #[arg(long, value_name = "PATH")]
    pub emit_plan: Option<PathBuf>,

    /// Suppress per-job output; show only commands and errors.
    #[arg(long, short = 'q', conflicts_with = "verbose")]
    pub quiet: bool,

    /// Enable verbose output with staleness and planning diagnostics.
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

/// CLI surface of [`BuildMode`].
#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Normal,
    Test,
    Examples,
}

impl From<ModeArg> for BuildMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Normal => BuildMode::Normal,
            ModeArg::Test => BuildMode::Test,
            ModeArg::Examples => BuildMode::Examples,
        }
    }
}
