//! Typed failure kinds for the build driver.
//!
//! Most fallible paths propagate `anyhow::Error` with context; these kinds
//! exist where a caller (or a test) needs to distinguish the failure.

use std::path::PathBuf;

/// Driver failures with a meaning beyond their message.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// A depfile line had no `:` after the target name.
    #[error("{}:{line}: malformed depfile, expected ':' after target", .path.display())]
    MalformedDepfile { path: PathBuf, line: u32 },

    /// A package target of a kind the driver cannot produce output for.
    #[error("unknown target type for '{0}'")]
    UnknownTarget(String),

    /// Override mode was requested but the recorded output file is absent.
    #[error("build script override not found: {}", .0.display())]
    OverrideMissing(PathBuf),
}
