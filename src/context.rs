//! Build options and the per-run context: compiler location, host/target
//! split, job keys, and the output naming policy.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::DriverError;
use crate::manifest::{CrateType, PackageManifest, PackageTarget, TargetKind};

/// What the driver is being asked to build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildMode {
    /// The root library and its binaries.
    Normal,
    /// The root library and its test targets (dev-dependencies included).
    Test,
    /// The dependency closure including dev-dependencies.
    Examples,
}

/// Options for a single driver run.
#[derive(Debug)]
pub struct BuildOptions {
    pub output_dir: PathBuf,
    /// Target triple when cross-compiling; `None` builds for the host only.
    pub target_name: Option<String>,
    /// Use the alternative MMIR codegen mode.
    pub emit_mmir: bool,
    pub enable_debug: bool,
    pub lib_search_dirs: Vec<PathBuf>,
    /// Directory of pre-recorded build script outputs. When set, scripts are
    /// neither compiled nor run.
    pub build_script_overrides: Option<PathBuf>,
    pub mode: BuildMode,
}

/// Immutable per-run state shared by planning, command assembly, and the
/// scheduler.
pub struct BuildContext {
    pub opts: BuildOptions,
    /// Resolved once at process start.
    pub compiler_path: PathBuf,
    /// True when host and target artifacts are kept apart.
    pub is_cross_compiling: bool,
}

impl BuildContext {
    pub fn new(opts: BuildOptions) -> Result<Self> {
        let compiler_path = locate_compiler()?;
        let is_cross_compiling = opts.target_name.is_some() && !opts.emit_mmir;
        Ok(BuildContext {
            opts,
            compiler_path,
            is_cross_compiling,
        })
    }

    /// Whether the configured compiler is the upstream rustc (detected by
    /// basename); some flags differ between rustc and mrustc.
    pub fn is_rustc(&self) -> bool {
        self.compiler_path
            .file_name()
            .is_some_and(|n| n == "rustc" || n == "rustc.exe")
    }

    /// The canonical job key for a package's compile phase.
    ///
    /// Proc-macro libraries always key as host-targeted.
    pub fn job_key(&self, p: &PackageManifest, build_script: bool, is_host: bool) -> String {
        let is_host = is_host || p.library().is_some_and(|l| l.is_proc_macro);
        let mut key = format!("{} v{}", p.name, p.version);
        if build_script {
            key.push_str(" (build)");
        } else if is_host && self.is_cross_compiling {
            key.push_str(" (host)");
        }
        key
    }

    /// Job key for a specific target of a package. Library compiles use the
    /// plain package key; binary and test targets are qualified with the
    /// target name so the names stay unique.
    pub fn job_key_for_target(
        &self,
        p: &PackageManifest,
        target: &PackageTarget,
        is_host: bool,
    ) -> String {
        let key = self.job_key(p, false, is_host);
        match target.kind {
            TargetKind::Lib => key,
            TargetKind::Bin => format!("{key} (bin {})", target.name),
            TargetKind::Test => format!("{key} (test {})", target.name),
            TargetKind::Example => format!("{key} (example {})", target.name),
        }
    }

    /// The version/feature tag appended to output filenames.
    ///
    /// `-MAJOR_MINOR_PATCH`, plus `_H<hex>` encoding the active-feature
    /// bitmask over the first 64 declared features. Empty for the zero
    /// version.
    pub fn crate_suffix(&self, p: &PackageManifest) -> String {
        if p.version == semver::Version::new(0, 0, 0) {
            return String::new();
        }
        let mut suffix = format!("-{}_{}_{}", p.version.major, p.version.minor, p.version.patch);
        if !p.active_features.is_empty() {
            let mut mask = 0u64;
            for (i, (name, _)) in p.all_features.iter().take(64).enumerate() {
                if p.active_features.iter().any(|f| f == name) {
                    mask |= 1 << i;
                }
            }
            suffix.push_str(&format!("_H{mask:x}"));
        }
        suffix
    }

    /// Base name of everything a package's build script produces.
    pub fn build_script_stem(&self, p: &PackageManifest) -> String {
        format!("build_{}{}", p.name, self.crate_suffix(p))
    }

    /// Where artifacts for the given side land. Host artifacts get their own
    /// subdirectory only when cross-compiling without MMIR.
    pub fn output_dir(&self, for_host: bool) -> PathBuf {
        if for_host && self.opts.target_name.is_some() && !self.opts.emit_mmir {
            self.opts.output_dir.join("host")
        } else {
            self.opts.output_dir.clone()
        }
    }

    /// The compiled build script executable.
    pub fn build_script_exe(&self, p: &PackageManifest) -> PathBuf {
        self.output_dir(true).join(format!(
            "{}_run{}",
            self.build_script_stem(p),
            std::env::consts::EXE_SUFFIX
        ))
    }

    /// The captured stdout of a build script run.
    pub fn build_script_output_file(&self, p: &PackageManifest) -> PathBuf {
        self.output_dir(true)
            .join(format!("{}.txt", self.build_script_stem(p)))
    }

    /// Output path and crate-type string for compiling `target` of `p`.
    pub fn crate_output_path(
        &self,
        p: &PackageManifest,
        target: &PackageTarget,
        for_host: bool,
    ) -> Result<(PathBuf, &'static str), DriverError> {
        let dir = self.output_dir(for_host);
        let suffix = self.crate_suffix(p);

        match target.kind {
            TargetKind::Lib => {
                let declared = target.crate_types.first().copied().unwrap_or({
                    if target.is_proc_macro {
                        CrateType::ProcMacro
                    } else {
                        CrateType::Rlib
                    }
                });
                let (path, ty) = match declared {
                    CrateType::ProcMacro => (
                        format!(
                            "lib{}{}-plugin{}",
                            target.name,
                            suffix,
                            std::env::consts::EXE_SUFFIX
                        ),
                        "proc-macro",
                    ),
                    CrateType::Dylib if std::env::var_os("MINICARGO_DYLIB").is_some() => (
                        format!(
                            "lib{}{}{}",
                            target.name,
                            suffix,
                            std::env::consts::DLL_SUFFIX
                        ),
                        "dylib",
                    ),
                    // Without MINICARGO_DYLIB, dylib requests fall back to rlib.
                    CrateType::Dylib | CrateType::Rlib => {
                        (format!("lib{}{}.rlib", target.name, suffix), "rlib")
                    }
                };
                Ok((dir.join(path), ty))
            }
            TargetKind::Bin | TargetKind::Test => Ok((
                dir.join(format!("{}{}", target.name, std::env::consts::EXE_SUFFIX)),
                "bin",
            )),
            TargetKind::Example => Err(DriverError::UnknownTarget(target.name.clone())),
        }
    }
}

/// Append a literal suffix to a path's final component (`foo.rlib` +
/// `".d"` → `foo.rlib.d`).
pub fn path_append(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.to_path_buf().into_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Locate the compiler binary: `MRUSTC_PATH` override, else `mrustc` next to
/// the driver's own executable.
fn locate_compiler() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os("MRUSTC_PATH") {
        return Ok(PathBuf::from(path));
    }
    let exe = std::env::current_exe().context("cannot locate the driver's own executable")?;
    let dir = exe.parent().unwrap_or(Path::new("."));
    Ok(dir.join(format!("mrustc{}", std::env::consts::EXE_SUFFIX)))
}

/// The triple this driver was built for, used for `HOST` (and `TARGET` when
/// not cross-compiling) in build script environments.
pub fn host_triple() -> String {
    let arch = std::env::consts::ARCH;
    match std::env::consts::OS {
        "linux" => format!("{arch}-unknown-linux-gnu"),
        "macos" => format!("{arch}-apple-darwin"),
        "windows" => format!("{arch}-pc-windows-msvc"),
        os => format!("{arch}-unknown-{os}"),
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::test_context;
    use super::*;
    use crate::manifest::{PackageSet, testutil};

    #[test]
    fn crate_suffix_encodes_version_and_feature_mask() {
        let mut set = PackageSet::new(None);
        let id = testutil::lib_package(&mut set, "p", "1.2.3");
        {
            let p = set.package_mut(id);
            p.all_features = vec![
                ("alpha".to_string(), vec![]),
                ("beta".to_string(), vec![]),
                ("gamma".to_string(), vec![]),
            ];
            p.active_features = vec!["alpha".to_string(), "gamma".to_string()];
        }
        let ctx = test_context(Path::new("/out"), None);
        // Bits 0 and 2 set.
        assert_eq!(ctx.crate_suffix(&set[id]), "-1_2_3_H5");
    }

    #[test]
    fn crate_suffix_empty_for_zero_version() {
        let mut set = PackageSet::new(None);
        let id = testutil::lib_package(&mut set, "p", "0.0.0");
        set.package_mut(id).active_features = vec!["x".to_string()];
        let ctx = test_context(Path::new("/out"), None);
        assert_eq!(ctx.crate_suffix(&set[id]), "");
    }

    #[test]
    fn crate_suffix_without_features_is_version_only() {
        let mut set = PackageSet::new(None);
        let id = testutil::lib_package(&mut set, "p", "0.14.1");
        let ctx = test_context(Path::new("/out"), None);
        assert_eq!(ctx.crate_suffix(&set[id]), "-0_14_1");
    }

    #[test]
    fn job_keys_follow_phase_and_host() {
        let mut set = PackageSet::new(None);
        let id = testutil::lib_package(&mut set, "foo", "1.2.3");

        let ctx = test_context(Path::new("/out"), Some("armv7-unknown-linux-gnueabihf"));
        assert_eq!(ctx.job_key(&set[id], false, false), "foo v1.2.3");
        assert_eq!(ctx.job_key(&set[id], false, true), "foo v1.2.3 (host)");
        assert_eq!(ctx.job_key(&set[id], true, false), "foo v1.2.3 (build)");

        // Not cross-compiling: no host tag.
        let ctx = test_context(Path::new("/out"), None);
        assert_eq!(ctx.job_key(&set[id], false, true), "foo v1.2.3");
    }

    #[test]
    fn proc_macro_keys_as_host() {
        let mut set = PackageSet::new(None);
        let id = testutil::lib_package(&mut set, "derive-it", "1.0.0");
        set.package_mut(id).targets[0].is_proc_macro = true;

        let ctx = test_context(Path::new("/out"), Some("some-target"));
        assert_eq!(ctx.job_key(&set[id], false, false), "derive-it v1.0.0 (host)");
    }

    #[test]
    fn output_dir_splits_host_only_when_cross() {
        let ctx = test_context(Path::new("/out"), Some("t"));
        assert_eq!(ctx.output_dir(false), PathBuf::from("/out"));
        assert_eq!(ctx.output_dir(true), PathBuf::from("/out/host"));

        let ctx = test_context(Path::new("/out"), None);
        assert_eq!(ctx.output_dir(true), PathBuf::from("/out"));
    }

    #[test]
    fn library_output_paths() {
        let mut set = PackageSet::new(None);
        let id = testutil::lib_package(&mut set, "foo", "1.2.3");
        let ctx = test_context(Path::new("/out"), None);
        let lib = set[id].library().unwrap().clone();

        let (path, ty) = ctx.crate_output_path(&set[id], &lib, false).unwrap();
        assert_eq!(path, PathBuf::from("/out/libfoo-1_2_3.rlib"));
        assert_eq!(ty, "rlib");
    }

    #[test]
    fn proc_macro_output_is_a_plugin_executable() {
        let mut set = PackageSet::new(None);
        let id = testutil::lib_package(&mut set, "m", "1.0.0");
        set.package_mut(id).targets[0].is_proc_macro = true;
        let ctx = test_context(Path::new("/out"), None);
        let lib = set[id].library().unwrap().clone();

        let (path, ty) = ctx.crate_output_path(&set[id], &lib, true).unwrap();
        assert_eq!(ty, "proc-macro");
        let expected = format!("libm-1_0_0-plugin{}", std::env::consts::EXE_SUFFIX);
        assert_eq!(path, Path::new("/out").join(expected));
    }

    #[test]
    fn binary_output_is_bare_name() {
        let mut set = PackageSet::new(None);
        let id = testutil::lib_package(&mut set, "tool", "1.0.0");
        let bin = PackageTarget {
            name: "tool".to_string(),
            path: PathBuf::from("src/main.rs"),
            kind: TargetKind::Bin,
            crate_types: Vec::new(),
            is_proc_macro: false,
            edition: crate::manifest::Edition::E2018,
        };
        let ctx = test_context(Path::new("/out"), None);
        let (path, ty) = ctx.crate_output_path(&set[id], &bin, false).unwrap();
        assert_eq!(ty, "bin");
        let expected = format!("tool{}", std::env::consts::EXE_SUFFIX);
        assert_eq!(path, Path::new("/out").join(expected));
    }

    #[test]
    fn example_target_is_unknown() {
        let mut set = PackageSet::new(None);
        let id = testutil::lib_package(&mut set, "p", "1.0.0");
        let example = PackageTarget {
            name: "demo".to_string(),
            path: PathBuf::from("examples/demo.rs"),
            kind: TargetKind::Example,
            crate_types: Vec::new(),
            is_proc_macro: false,
            edition: crate::manifest::Edition::E2018,
        };
        let ctx = test_context(Path::new("/out"), None);
        let err = ctx.crate_output_path(&set[id], &example, false).unwrap_err();
        assert!(matches!(err, DriverError::UnknownTarget(_)));
    }

    #[test]
    fn build_script_names_carry_the_suffix() {
        let mut set = PackageSet::new(None);
        let id = testutil::lib_package(&mut set, "zlib-sys", "0.3.0");
        let ctx = test_context(Path::new("/out"), None);
        assert_eq!(ctx.build_script_stem(&set[id]), "build_zlib-sys-0_3_0");
        assert_eq!(
            ctx.build_script_output_file(&set[id]),
            PathBuf::from("/out/build_zlib-sys-0_3_0.txt"),
        );
        let exe = format!("build_zlib-sys-0_3_0_run{}", std::env::consts::EXE_SUFFIX);
        assert_eq!(ctx.build_script_exe(&set[id]), Path::new("/out").join(exe));
    }

    #[test]
    fn path_append_extends_the_final_component() {
        assert_eq!(
            path_append(Path::new("/out/libfoo.rlib"), ".d"),
            PathBuf::from("/out/libfoo.rlib.d"),
        );
    }
}
