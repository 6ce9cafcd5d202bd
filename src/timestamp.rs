//! File modification timestamps with an *infinite past* sentinel.
//!
//! Absence is a value: a path that does not exist (or cannot be stat-ed)
//! yields a timestamp that sorts below every real one, so staleness checks
//! never have to handle stat errors.

use std::path::Path;
use std::time::SystemTime;

/// A totally ordered file timestamp.
///
/// The `None` payload is the infinite past and compares less than every
/// real modification time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(Option<SystemTime>);

impl Timestamp {
    /// The sentinel returned for paths that do not exist.
    pub fn infinite_past() -> Self {
        Timestamp(None)
    }

    /// Read the modification time of `path`, or the infinite past if the
    /// path is missing or cannot be stat-ed.
    pub fn for_file(path: &Path) -> Self {
        Timestamp(std::fs::metadata(path).and_then(|m| m.modified()).ok())
    }

    pub fn is_infinite_past(&self) -> bool {
        self.0.is_none()
    }
}
