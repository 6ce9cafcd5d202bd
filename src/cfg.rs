//! Target configuration keys derived from the target triple.
//!
//! Build scripts expect the same `CARGO_CFG_*` variables the canonical tool
//! exports. The table here is derived from the triple alone, which covers
//! the keys scripts actually branch on.

use std::ffi::OsString;

/// The cfg key/value pairs and bare flags for a target triple.
pub struct TargetCfg {
    pairs: Vec<(&'static str, String)>,
    flags: Vec<&'static str>,
}

pub fn for_target(triple: &str) -> TargetCfg {
    let arch = triple.split('-').next().unwrap_or(triple).to_string();

    let os = if triple.contains("windows") {
        "windows"
    } else if triple.contains("darwin") || triple.contains("macos") {
        "macos"
    } else if triple.contains("linux") {
        "linux"
    } else if triple.contains("freebsd") {
        "freebsd"
    } else if triple.contains("netbsd") {
        "netbsd"
    } else if triple.contains("openbsd") {
        "openbsd"
    } else {
        "unknown"
    };
    let family = if os == "windows" { "windows" } else { "unix" };

    let env = if triple.ends_with("msvc") {
        "msvc"
    } else if triple.contains("musl") {
        "musl"
    } else if triple.contains("gnu") {
        "gnu"
    } else {
        ""
    };

    let pointer_width = match arch.as_str() {
        "x86_64" | "aarch64" | "powerpc64" | "powerpc64le" | "riscv64gc" | "mips64" | "s390x"
        | "sparc64" => "64",
        _ => "32",
    };
    let endian = match arch.as_str() {
        "powerpc" | "powerpc64" | "mips" | "mips64" | "s390x" | "sparc64" => "big",
        _ => "little",
    };

    let vendor = {
        let parts: Vec<&str> = triple.split('-').collect();
        if parts.len() >= 3 { parts[1] } else { "unknown" }
    };

    TargetCfg {
        pairs: vec![
            ("target_arch", arch),
            ("target_os", os.to_string()),
            ("target_family", family.to_string()),
            ("target_env", env.to_string()),
            ("target_vendor", vendor.to_string()),
            ("target_endian", endian.to_string()),
            ("target_pointer_width", pointer_width.to_string()),
        ],
        flags: vec![family],
    }
}

impl TargetCfg {
    /// Export every cfg key as `CARGO_CFG_<UPPER_KEY>`.
    pub fn push_env(&self, env: &mut Vec<(String, OsString)>) {
        for (key, value) in &self.pairs {
            env.push((
                format!("CARGO_CFG_{}", key.to_ascii_uppercase()),
                value.clone().into(),
            ));
        }
        for flag in &self.flags {
            env.push((format!("CARGO_CFG_{}", flag.to_ascii_uppercase()), "".into()));
        }
    }
}
