//! Integration tests for the minicargo driver.
//!
//! These tests invoke the minicargo binary as a subprocess against a minimal
//! fixture project, using the real rustc as the compiler via `MRUSTC_PATH`.
//! They are marked `#[ignore]` because they require the binary to be
//! pre-built and a working rustc toolchain.
//!
//! Run with: `cargo test --test integration -- --ignored`

use std::path::PathBuf;
use std::process::Command;

/// Locate the compiled minicargo binary.
///
/// `cargo test` places the test binary under `target/debug/deps/`. The main
/// binary lives one level up at `target/debug/minicargo`.
fn minicargo_binary() -> PathBuf {
    let mut path = std::env::current_exe().expect("could not determine test binary path");
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("minicargo");
    path
}

/// Path to the minimal fixture project.
fn fixture_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/minimal")
}

fn rustc_path() -> String {
    let output = Command::new("rustc")
        .args(["--print", "sysroot"])
        .output()
        .expect("rustc not found");
    assert!(output.status.success());
    "rustc".to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn dry_run_plans_both_units() {
    let out = tempfile::tempdir().unwrap();
    let plan_path = out.path().join("plan.json");
    let output = Command::new(minicargo_binary())
        .arg(fixture_dir().join("root"))
        .arg("--output-dir")
        .arg(out.path())
        .arg("--dry-run")
        .arg("--emit-plan")
        .arg(&plan_path)
        .env("MRUSTC_PATH", rustc_path())
        .output()
        .expect("failed to execute minicargo");

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "dry run failed (exit={:?}):\nstdout:\n{stdout}\nstderr:\n{stderr}",
        output.status.code(),
    );

    let plan: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&plan_path).unwrap()).unwrap();
    let names: Vec<&str> = plan["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"leaf v1.0.0"), "plan: {names:?}");
    assert!(names.contains(&"root v1.0.0"), "plan: {names:?}");
}

#[test]
#[ignore]
fn builds_and_is_idempotent_with_rustc() {
    let out = tempfile::tempdir().unwrap();
    let run = |plan_path: &std::path::Path| {
        let output = Command::new(minicargo_binary())
            .arg(fixture_dir().join("root"))
            .arg("--output-dir")
            .arg(out.path())
            .arg("--emit-plan")
            .arg(plan_path)
            .env("MRUSTC_PATH", rustc_path())
            .output()
            .expect("failed to execute minicargo");
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(
            output.status.success(),
            "build failed (exit={:?}):\nstdout:\n{stdout}\nstderr:\n{stderr}",
            output.status.code(),
        );
    };

    let first = out.path().join("plan1.json");
    run(&first);
    let plan: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&first).unwrap()).unwrap();
    assert!(!plan["jobs"].as_array().unwrap().is_empty());

    // Second invocation with unchanged inputs schedules zero jobs.
    let second = out.path().join("plan2.json");
    run(&second);
    let plan: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&second).unwrap()).unwrap();
    assert!(
        plan["jobs"].as_array().unwrap().is_empty(),
        "expected an empty second plan: {plan}"
    );
}
