//! The staleness oracle: decide whether an output needs rebuilding.
//!
//! An output is dirty when it is missing, older than the compiler binary
//! (unless `MINICARGO_IGNTOOLS` is set), or older than any input recorded in
//! its depfile. Depfile read errors count as dirty; a missing depfile means
//! no recorded inputs.

use std::path::Path;

use crate::context::{BuildContext, path_append};
use crate::depfile;
use crate::timestamp::Timestamp;
use crate::verbose::vprintln;

/// Returns `true` when `outfile` must be rebuilt.
pub fn needs_rebuild(ctx: &BuildContext, outfile: &Path) -> bool {
    let output_ts = Timestamp::for_file(outfile);
    if output_ts.is_infinite_past() {
        vprintln!("  stale: {} — missing", outfile.display());
        return true;
    }

    if std::env::var_os("MINICARGO_IGNTOOLS").is_none()
        && output_ts < Timestamp::for_file(&ctx.compiler_path)
    {
        vprintln!("  stale: {} — older than the compiler", outfile.display());
        return true;
    }

    let entries = match depfile::load(&path_append(outfile, ".d")) {
        Ok(entries) => entries,
        Err(_) => {
            vprintln!("  stale: {} — unreadable depfile", outfile.display());
            return true;
        }
    };
    let key = outfile.to_string_lossy();
    if let Some(inputs) = entries.get(key.as_ref()) {
        for input in inputs {
            if output_ts < Timestamp::for_file(input) {
                vprintln!(
                    "  stale: {} — older than {}",
                    outfile.display(),
                    input.display()
                );
                return true;
            }
        }
    }

    false
}
