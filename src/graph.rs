//! Expansion of the root manifest into an ordered build list.
//!
//! Walks the dependency graph, records each `(package, host-flag)` unit at
//! the deepest level it was requested from, and materializes the list sorted
//! deepest-first. The result is a valid topological order for every
//! build-target job.

use std::cmp::Reverse;

use anyhow::{Result, bail};

use crate::context::{BuildMode, BuildOptions};
use crate::manifest::{PackageId, PackageSet};

/// A recursion bound standing in for cycle detection; a legitimate
/// dependency tree never gets close.
const MAX_DEPTH: u32 = 256;

/// One unit in the build list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GraphEntry {
    pub package: PackageId,
    /// True for host-side builds: proc-macros, build-script dependencies,
    /// and everything in a non-cross build.
    pub is_host: bool,
}

struct Ent {
    package: PackageId,
    is_host: bool,
    level: u32,
}

struct ListBuilder<'a> {
    set: &'a PackageSet,
    entries: Vec<Ent>,
}

impl ListBuilder<'_> {
    fn add_package(
        &mut self,
        id: PackageId,
        level: u32,
        include_build: bool,
        mut is_host: bool,
    ) -> Result<()> {
        if level > MAX_DEPTH {
            bail!(
                "dependency graph deeper than {MAX_DEPTH} levels at '{}' (cycle?)",
                self.set[id].name
            );
        }
        // Proc-macro libraries are consumed by the compiler itself.
        if self.set[id].library().is_some_and(|l| l.is_proc_macro) {
            is_host = true;
        }
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.package == id && e.is_host == is_host)
        {
            // Already present deep enough to be built before it is needed.
            if self.entries[pos].level >= level {
                return Ok(());
            }
            // Needed deeper: reposition and re-walk so the subtree deepens too.
            self.entries.remove(pos);
        }
        self.entries.push(Ent {
            package: id,
            is_host,
            level,
        });
        self.add_dependencies(id, level, include_build, is_host)
    }

    fn add_dependencies(
        &mut self,
        id: PackageId,
        level: u32,
        include_build: bool,
        is_host: bool,
    ) -> Result<()> {
        let set = self.set;
        for dep in &set[id].main_deps {
            if !dep.is_disabled() {
                self.add_package(dep.package, level + 1, include_build, is_host)?;
            }
        }
        if set[id].build_script.is_some() && include_build {
            for dep in &set[id].build_deps {
                if !dep.is_disabled() {
                    // Build scripts run on the host, so their dependencies do too.
                    self.add_package(dep.package, level + 1, true, true)?;
                }
            }
        }
        Ok(())
    }
}

/// Expand `root` plus `opts` into the ordered, deduplicated build list.
pub fn build_list(
    set: &PackageSet,
    root: PackageId,
    opts: &BuildOptions,
) -> Result<Vec<GraphEntry>> {
    let cross_compiling = opts.target_name.is_some();
    let include_build = opts.build_script_overrides.is_none();

    let mut builder = ListBuilder {
        set,
        entries: Vec::new(),
    };
    builder.add_dependencies(root, 0, include_build, !cross_compiling)?;
    if set[root].has_library() {
        builder.entries.push(Ent {
            package: root,
            is_host: !cross_compiling,
            level: 0,
        });
    }
    if opts.mode != BuildMode::Normal {
        for dep in &set[root].dev_deps {
            if !dep.is_disabled() {
                builder.add_package(dep.package, 1, include_build, !cross_compiling)?;
            }
        }
    }

    // Deepest dependencies first; the sort is stable so units at the same
    // level keep their discovery order.
    builder.entries.sort_by_key(|e| Reverse(e.level));

    Ok(builder
        .entries
        .into_iter()
        .map(|e| GraphEntry {
            package: e.package,
            is_host: e.is_host,
        })
        .collect())
}
