//! Package manifests and the set of loaded packages.
//!
//! Parses `Cargo.toml` files into queryable [`PackageManifest`] values,
//! resolves dependency edges to other loaded packages, activates features,
//! and owns the build-script output slots that the planner and scheduler
//! populate. The driver core consumes these values read-only.

use std::collections::{HashMap, VecDeque};
use std::ops::Index;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result, anyhow, bail};

use crate::context::BuildMode;

/// Index of a package within a [`PackageSet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageId(usize);

/// Rust edition of a package or target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edition {
    Unspec,
    E2015,
    E2018,
}

impl Edition {
    fn parse(value: Option<&str>, manifest: &Path) -> Result<Self> {
        match value {
            None => Ok(Edition::Unspec),
            Some("2015") => Ok(Edition::E2015),
            Some("2018") => Ok(Edition::E2018),
            Some(other) => bail!("unsupported edition '{other}' in {}", manifest.display()),
        }
    }
}

/// Kind of a compilable package target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    Lib,
    Bin,
    Test,
    Example,
}

/// Declared crate type of a library target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrateType {
    Rlib,
    Dylib,
    ProcMacro,
}

impl CrateType {
    fn parse(value: &str, manifest: &Path) -> Result<Self> {
        match value {
            "lib" | "rlib" => Ok(CrateType::Rlib),
            "dylib" | "cdylib" => Ok(CrateType::Dylib),
            "proc-macro" => Ok(CrateType::ProcMacro),
            other => bail!("unsupported crate-type '{other}' in {}", manifest.display()),
        }
    }
}

/// A single compilable target within a package.
#[derive(Clone, Debug)]
pub struct PackageTarget {
    pub name: String,
    /// Source path relative to the package directory.
    pub path: PathBuf,
    pub kind: TargetKind,
    /// Declared crate types, in declaration order. Empty means default.
    pub crate_types: Vec<CrateType>,
    pub is_proc_macro: bool,
    pub edition: Edition,
}

/// A dependency edge from one package to another.
#[derive(Clone, Debug)]
pub struct Dependency {
    /// The alias the dependent uses (`--extern <key>=...`).
    pub key: String,
    pub package: PackageId,
    pub optional: bool,
    /// Set by feature activation. Non-optional dependencies start enabled.
    pub enabled: bool,
    /// Features the edge requests on the dependency.
    pub features: Vec<String>,
    pub default_features: bool,
}

impl Dependency {
    pub fn is_disabled(&self) -> bool {
        self.optional && !self.enabled
    }
}

/// A loaded, queryable package manifest.
#[derive(Debug)]
pub struct PackageManifest {
    pub name: String,
    pub version: semver::Version,
    /// Directory containing the manifest.
    pub directory: PathBuf,
    pub manifest_path: PathBuf,
    pub edition: Edition,
    /// Build script source path relative to the package directory.
    pub build_script: Option<PathBuf>,
    /// Targets, library first when present.
    pub targets: Vec<PackageTarget>,
    pub main_deps: Vec<Dependency>,
    pub build_deps: Vec<Dependency>,
    pub dev_deps: Vec<Dependency>,
    /// `[features]` table in declaration order.
    pub all_features: Vec<(String, Vec<String>)>,
    /// Activated features, in activation order, unique.
    pub active_features: Vec<String>,
}

impl PackageManifest {
    pub fn library(&self) -> Option<&PackageTarget> {
        self.targets.iter().find(|t| t.kind == TargetKind::Lib)
    }

    pub fn has_library(&self) -> bool {
        self.library().is_some()
    }

    pub fn targets_of_kind(&self, kind: TargetKind) -> impl Iterator<Item = &PackageTarget> {
        self.targets.iter().filter(move |t| t.kind == kind)
    }

    fn is_feature_active(&self, name: &str) -> bool {
        self.active_features.iter().any(|f| f == name)
    }

    /// Activate `requested` features (plus `default` when asked for), expanding
    /// through this package's feature table. Returns the dependency-side
    /// effects: optional dependencies to enable and features to forward.
    fn enable_features(
        &mut self,
        requested: &[String],
        include_default: bool,
    ) -> Vec<FeatureEffect> {
        let mut effects = Vec::new();
        let mut work: VecDeque<String> = requested.iter().cloned().collect();
        if include_default && self.all_features.iter().any(|(n, _)| n == "default") {
            work.push_back("default".to_string());
        }

        while let Some(feat) = work.pop_front() {
            if let Some((dep, dep_feat)) = feat.split_once('/') {
                // `dep/feat` (and `dep?/feat`) forward a feature to a dependency.
                effects.push(FeatureEffect {
                    dep: dep.trim_end_matches('?').to_string(),
                    feature: Some(dep_feat.to_string()),
                });
                continue;
            }
            if let Some(dep) = feat.strip_prefix("dep:") {
                effects.push(FeatureEffect {
                    dep: dep.to_string(),
                    feature: None,
                });
                continue;
            }
            if self.is_feature_active(&feat) {
                continue;
            }
            match self.all_features.iter().find(|(n, _)| *n == feat) {
                Some((_, values)) => {
                    let values = values.clone();
                    self.active_features.push(feat);
                    work.extend(values);
                }
                // Not in the table: an implicit feature of an optional dep.
                None => effects.push(FeatureEffect {
                    dep: feat,
                    feature: None,
                }),
            }
        }

        effects
    }
}

/// A dependency-side effect of activating a feature.
struct FeatureEffect {
    /// Dependency name or alias to enable.
    dep: String,
    /// A feature to forward to that dependency.
    feature: Option<String>,
}

// ---------------------------------------------------------------------------
// Package loading
// ---------------------------------------------------------------------------

/// All packages loaded for a build, addressed by [`PackageId`].
pub struct PackageSet {
    packages: Vec<PackageManifest>,
    by_path: HashMap<PathBuf, PackageId>,
    vendor_dir: Option<PathBuf>,
}

impl Index<PackageId> for PackageSet {
    type Output = PackageManifest;
    fn index(&self, id: PackageId) -> &PackageManifest {
        &self.packages[id.0]
    }
}

impl PackageSet {
    pub fn new(vendor_dir: Option<PathBuf>) -> Self {
        PackageSet {
            packages: Vec::new(),
            by_path: HashMap::new(),
            vendor_dir,
        }
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Load the root package (and, transitively, everything it depends on).
    ///
    /// `path` may be the package directory or the manifest file itself.
    /// Dev-dependencies are resolved for the root only; other packages'
    /// dev-dependencies are never walked.
    pub fn load_root(&mut self, path: &Path) -> Result<PackageId> {
        let manifest_path = if path.is_dir() {
            path.join("Cargo.toml")
        } else {
            path.to_path_buf()
        };
        let mut loading = Vec::new();
        self.load_manifest(&manifest_path, &mut loading, true)
    }

    fn load_manifest(
        &mut self,
        manifest_path: &Path,
        loading: &mut Vec<PathBuf>,
        with_dev: bool,
    ) -> Result<PackageId> {
        let canon = manifest_path
            .canonicalize()
            .with_context(|| format!("locating manifest {}", manifest_path.display()))?;
        if let Some(&id) = self.by_path.get(&canon) {
            return Ok(id);
        }
        if loading.contains(&canon) {
            bail!("circular dependency involving {}", canon.display());
        }
        loading.push(canon.clone());

        let content = std::fs::read_to_string(&canon)
            .with_context(|| format!("reading {}", canon.display()))?;
        let doc: toml::Table = content
            .parse()
            .with_context(|| format!("parsing {}", canon.display()))?;
        let directory = canon
            .parent()
            .ok_or_else(|| anyhow!("manifest {} has no parent directory", canon.display()))?
            .to_path_buf();

        let manifest = self.build_manifest(&doc, &canon, &directory, loading, with_dev)?;

        loading.pop();
        let id = PackageId(self.packages.len());
        self.by_path.insert(canon, id);
        self.packages.push(manifest);
        Ok(id)
    }

    fn build_manifest(
        &mut self,
        doc: &toml::Table,
        manifest_path: &Path,
        directory: &Path,
        loading: &mut Vec<PathBuf>,
        with_dev: bool,
    ) -> Result<PackageManifest> {
        let pkg = doc
            .get("package")
            .and_then(|v| v.as_table())
            .ok_or_else(|| anyhow!("[package] section missing in {}", manifest_path.display()))?;

        let name = pkg
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("package.name missing in {}", manifest_path.display()))?
            .to_string();
        let version = pkg
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or("0.0.0");
        let version = semver::Version::parse(version)
            .with_context(|| format!("package.version in {}", manifest_path.display()))?;
        let edition = Edition::parse(pkg.get("edition").and_then(|v| v.as_str()), manifest_path)?;

        // Build script: explicit `build` key wins; `build = false` disables
        // auto-detection of a `build.rs` next to the manifest.
        let build_script = match pkg.get("build") {
            Some(toml::Value::String(s)) => Some(PathBuf::from(s)),
            Some(toml::Value::Boolean(false)) => None,
            _ if directory.join("build.rs").is_file() => Some(PathBuf::from("build.rs")),
            _ => None,
        };

        let all_features = parse_features(doc);
        let targets = parse_targets(doc, &name, directory, edition, manifest_path)?;

        let main_deps = self.resolve_deps(doc, "dependencies", directory, loading)?;
        let build_deps = self.resolve_deps(doc, "build-dependencies", directory, loading)?;
        let dev_deps = if with_dev {
            self.resolve_deps(doc, "dev-dependencies", directory, loading)?
        } else {
            Vec::new()
        };

        Ok(PackageManifest {
            name,
            version,
            directory: directory.to_path_buf(),
            manifest_path: manifest_path.to_path_buf(),
            edition,
            build_script,
            targets,
            main_deps,
            build_deps,
            dev_deps,
            all_features,
            active_features: Vec::new(),
        })
    }

    fn resolve_deps(
        &mut self,
        doc: &toml::Table,
        section: &str,
        directory: &Path,
        loading: &mut Vec<PathBuf>,
    ) -> Result<Vec<Dependency>> {
        let mut deps = Vec::new();
        let Some(table) = doc.get(section).and_then(|v| v.as_table()) else {
            return Ok(deps);
        };

        for (key, value) in table {
            let mut package_name = key.clone();
            let mut path = None;
            let mut features = Vec::new();
            let mut default_features = true;
            let mut optional = false;

            if let Some(t) = value.as_table() {
                if let Some(p) = t.get("package").and_then(|v| v.as_str()) {
                    package_name = p.to_string();
                }
                path = t.get("path").and_then(|v| v.as_str()).map(str::to_string);
                if let Some(arr) = t.get("features").and_then(|v| v.as_array()) {
                    features.extend(arr.iter().filter_map(|v| v.as_str()).map(str::to_string));
                }
                if let Some(b) = t.get("default-features").and_then(|v| v.as_bool()) {
                    default_features = b;
                }
                if let Some(b) = t.get("optional").and_then(|v| v.as_bool()) {
                    optional = b;
                }
            }

            let dep_dir = self.resolve_dep_dir(directory, &package_name, path.as_deref())?;
            let dep_manifest = dep_dir.join("Cargo.toml");
            let package = self
                .load_manifest(&dep_manifest, loading, false)
                .with_context(|| format!("loading dependency '{package_name}'"))?;

            deps.push(Dependency {
                key: key.clone(),
                package,
                optional,
                enabled: !optional,
                features,
                default_features,
            });
        }

        Ok(deps)
    }

    /// Locate the directory of a dependency: explicit `path`, or the vendor
    /// directory by name (plain `<name>` or versioned `<name>-<version>`,
    /// highest version winning).
    fn resolve_dep_dir(&self, base: &Path, name: &str, path: Option<&str>) -> Result<PathBuf> {
        if let Some(p) = path {
            return Ok(base.join(p));
        }
        let Some(vendor) = &self.vendor_dir else {
            bail!("dependency '{name}' has no `path` and no --vendor-dir was given");
        };

        let direct = vendor.join(name);
        if direct.join("Cargo.toml").is_file() {
            return Ok(direct);
        }

        let prefix = format!("{name}-");
        let mut best: Option<(semver::Version, PathBuf)> = None;
        if let Ok(entries) = std::fs::read_dir(vendor) {
            for entry in entries.flatten() {
                let file_name = entry.file_name();
                let Some(rest) = file_name.to_string_lossy().strip_prefix(&prefix).map(str::to_string)
                else {
                    continue;
                };
                let Ok(v) = semver::Version::parse(&rest) else {
                    continue;
                };
                if best.as_ref().is_none_or(|(b, _)| v > *b) {
                    best = Some((v, entry.path()));
                }
            }
        }
        best.map(|(_, p)| p).ok_or_else(|| {
            anyhow!(
                "dependency '{name}' not found in vendor dir {}",
                vendor.display()
            )
        })
    }

    // -----------------------------------------------------------------------
    // Feature activation
    // -----------------------------------------------------------------------

    /// Freeze the active-feature set of every loaded package.
    ///
    /// Starts from the root's default features plus `cli_features`, expands
    /// each package's own feature table, enables optional dependencies that
    /// features name, and forwards edge-requested features to dependencies.
    /// Dev-dependency edges participate only for the root and only in Test
    /// or Examples mode.
    pub fn activate(
        &mut self,
        root: PackageId,
        cli_features: &[String],
        mode: BuildMode,
    ) -> Result<()> {
        let mut queue: VecDeque<(PackageId, Vec<String>, bool)> = VecDeque::new();
        queue.push_back((root, cli_features.to_vec(), true));
        let mut baseline_done: Vec<bool> = vec![false; self.packages.len()];

        while let Some((id, feats, default)) = queue.pop_front() {
            let effects = self.packages[id.0].enable_features(&feats, default);

            if !baseline_done[id.0] {
                baseline_done[id.0] = true;
                let p = &self.packages[id.0];
                let walk_dev = id == root && mode != BuildMode::Normal;
                let edges = p
                    .main_deps
                    .iter()
                    .chain(p.build_deps.iter())
                    .chain(walk_dev.then_some(&p.dev_deps).into_iter().flatten());
                for dep in edges {
                    if !dep.is_disabled() {
                        queue.push_back((dep.package, dep.features.clone(), dep.default_features));
                    }
                }
            }

            for effect in effects {
                let (pkg, mut edge_feats, default) = self
                    .enable_dep(id, root, mode, &effect.dep)
                    .with_context(|| {
                        format!(
                            "package '{}' has no feature or dependency named '{}'",
                            self.packages[id.0].name, effect.dep
                        )
                    })?;
                if let Some(f) = effect.feature {
                    edge_feats.push(f);
                }
                queue.push_back((pkg, edge_feats, default));
            }
        }

        Ok(())
    }

    /// Enable the dependency of `id` named `name` (by alias or by package
    /// name) and return its edge information.
    fn enable_dep(
        &mut self,
        id: PackageId,
        root: PackageId,
        mode: BuildMode,
        name: &str,
    ) -> Result<(PackageId, Vec<String>, bool)> {
        let walk_dev = id == root && mode != BuildMode::Normal;
        let matches = |set: &PackageSet, dep: &Dependency| {
            dep.key == name || set.packages[dep.package.0].name == name
        };

        // Locate the edge first; the lists are borrowed mutably one at a time.
        let p = &self.packages[id.0];
        let lists: [&[Dependency]; 3] = [&p.main_deps, &p.build_deps, &p.dev_deps];
        let mut found = None;
        'outer: for (li, list) in lists.iter().enumerate() {
            if li == 2 && !walk_dev {
                continue;
            }
            for (di, dep) in list.iter().enumerate() {
                if matches(self, dep) {
                    found = Some((li, di));
                    break 'outer;
                }
            }
        }
        let Some((li, di)) = found else {
            bail!("no such dependency");
        };

        let p = &mut self.packages[id.0];
        let dep = match li {
            0 => &mut p.main_deps[di],
            1 => &mut p.build_deps[di],
            _ => &mut p.dev_deps[di],
        };
        dep.enabled = true;
        Ok((dep.package, dep.features.clone(), dep.default_features))
    }

    #[cfg(test)]
    pub(crate) fn push_test_package(&mut self, manifest: PackageManifest) -> PackageId {
        let id = PackageId(self.packages.len());
        self.packages.push(manifest);
        id
    }

    #[cfg(test)]
    pub(crate) fn package_mut(&mut self, id: PackageId) -> &mut PackageManifest {
        &mut self.packages[id.0]
    }
}

fn parse_features(doc: &toml::Table) -> Vec<(String, Vec<String>)> {
    let Some(table) = doc.get("features").and_then(|v| v.as_table()) else {
        return Vec::new();
    };
    table
        .iter()
        .map(|(name, value)| {
            let values = value
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            (name.clone(), values)
        })
        .collect()
}

fn parse_targets(
    doc: &toml::Table,
    package_name: &str,
    directory: &Path,
    edition: Edition,
    manifest_path: &Path,
) -> Result<Vec<PackageTarget>> {
    let mut targets = Vec::new();

    // Library: explicit [lib] section, or an autodetected src/lib.rs.
    let lib_table = doc.get("lib").and_then(|v| v.as_table());
    if lib_table.is_some() || directory.join("src/lib.rs").is_file() {
        let mut crate_types = Vec::new();
        if let Some(arr) = lib_table
            .and_then(|t| t.get("crate-type"))
            .and_then(|v| v.as_array())
        {
            for v in arr.iter().filter_map(|v| v.as_str()) {
                crate_types.push(CrateType::parse(v, manifest_path)?);
            }
        }
        let is_proc_macro = lib_table
            .and_then(|t| t.get("proc-macro"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
            || crate_types.contains(&CrateType::ProcMacro);
        targets.push(PackageTarget {
            name: lib_table
                .and_then(|t| t.get("name"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| package_name.replace('-', "_")),
            path: lib_table
                .and_then(|t| t.get("path"))
                .and_then(|v| v.as_str())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("src/lib.rs")),
            kind: TargetKind::Lib,
            crate_types,
            is_proc_macro,
            edition: parse_target_edition(lib_table, edition, manifest_path)?,
        });
    }

    let mut push_section = |section: &str, kind: TargetKind, default_dir: &str| -> Result<()> {
        let Some(arr) = doc.get(section).and_then(|v| v.as_array()) else {
            return Ok(());
        };
        for value in arr {
            let table = value.as_table();
            let Some(name) = table
                .and_then(|t| t.get("name"))
                .and_then(|v| v.as_str())
            else {
                bail!("[[{section}]] entry without a name in {}", manifest_path.display());
            };
            let path = table
                .and_then(|t| t.get("path"))
                .and_then(|v| v.as_str())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(format!("{default_dir}/{name}.rs")));
            targets.push(PackageTarget {
                name: name.to_string(),
                path,
                kind,
                crate_types: Vec::new(),
                is_proc_macro: false,
                edition: parse_target_edition(table, edition, manifest_path)?,
            });
        }
        Ok(())
    };
    push_section("bin", TargetKind::Bin, "src/bin")?;
    push_section("test", TargetKind::Test, "tests")?;
    push_section("example", TargetKind::Example, "examples")?;

    // Autodetected main binary.
    let has_bin = targets.iter().any(|t| t.kind == TargetKind::Bin);
    if !has_bin && directory.join("src/main.rs").is_file() {
        targets.push(PackageTarget {
            name: package_name.to_string(),
            path: PathBuf::from("src/main.rs"),
            kind: TargetKind::Bin,
            crate_types: Vec::new(),
            is_proc_macro: false,
            edition,
        });
    }

    Ok(targets)
}

fn parse_target_edition(
    table: Option<&toml::Table>,
    package_edition: Edition,
    manifest_path: &Path,
) -> Result<Edition> {
    match table.and_then(|t| t.get("edition")).and_then(|v| v.as_str()) {
        Some(e) => Edition::parse(Some(e), manifest_path),
        None => Ok(package_edition),
    }
}

// ---------------------------------------------------------------------------
// Build script outputs
// ---------------------------------------------------------------------------

/// The directives a build script emitted on stdout, as recorded by a prior
/// (or overridden) run.
#[derive(Clone, Debug, Default)]
pub struct BuildScriptOutput {
    /// `-L` search paths, with an optional kind prefix.
    pub rustc_link_search: Vec<(Option<String>, String)>,
    /// `-l` libraries, with an optional kind prefix.
    pub rustc_link_lib: Vec<(Option<String>, String)>,
    pub rustc_cfg: Vec<String>,
    pub rustc_flags: Vec<String>,
    pub rustc_env: Vec<(String, String)>,
    /// Arbitrary `cargo:key=value` pairs, exported to dependents' environments.
    pub downstream_env: Vec<(String, String)>,
}

impl BuildScriptOutput {
    /// Parse the text a build script wrote to stdout.
    pub fn parse(text: &str, package_name: &str) -> Self {
        let mut out = BuildScriptOutput::default();
        for line in text.lines() {
            let Some(rest) = line.trim_end().strip_prefix("cargo:") else {
                continue;
            };
            let Some((key, value)) = rest.split_once('=') else {
                continue;
            };
            match key {
                "rustc-link-search" => out.rustc_link_search.push(split_kind(value)),
                "rustc-link-lib" => out.rustc_link_lib.push(split_kind(value)),
                "rustc-cfg" => out.rustc_cfg.push(value.to_string()),
                "rustc-flags" => out
                    .rustc_flags
                    .extend(value.split_whitespace().map(str::to_string)),
                "rustc-env" => {
                    if let Some((k, v)) = value.split_once('=') {
                        out.rustc_env.push((k.to_string(), v.to_string()));
                    }
                }
                other => out.downstream_env.push((
                    format!("DEP_{}_{}", env_key(package_name), env_key(other)),
                    value.to_string(),
                )),
            }
        }
        out
    }

    /// Load a recorded (or overridden) output file.
    pub fn load(path: &Path, package_name: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading build script output {}", path.display()))?;
        Ok(Self::parse(&text, package_name))
    }
}

fn split_kind(value: &str) -> (Option<String>, String) {
    match value.split_once('=') {
        Some((kind, rest)) => (Some(kind.to_string()), rest.to_string()),
        None => (None, value.to_string()),
    }
}

fn env_key(s: &str) -> String {
    s.chars()
        .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() })
        .collect()
}

/// Per-package build script outputs, shared between the planner, the
/// scheduler, and command assembly.
///
/// The planner records outputs for clean and overridden scripts before any
/// dependent job exists; the scheduler records them when a run-script job
/// completes, which the job graph orders before every dependent compile.
#[derive(Default)]
pub struct BuildState {
    outputs: RwLock<HashMap<PackageId, BuildScriptOutput>>,
}

impl BuildState {
    /// Parse `path` and record it as `id`'s build script output.
    pub fn load_file(&self, set: &PackageSet, id: PackageId, path: &Path) -> Result<()> {
        let output = BuildScriptOutput::load(path, &set[id].name)?;
        self.outputs.write().unwrap().insert(id, output);
        Ok(())
    }

    /// The recorded output for `id`, or an empty default when the package has
    /// no build script (or it has not run).
    pub fn script_output(&self, id: PackageId) -> BuildScriptOutput {
        self.outputs
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_output(&self, id: PackageId) -> bool {
        self.outputs.read().unwrap().contains_key(&id)
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------
