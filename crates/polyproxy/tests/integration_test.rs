//! CLI integration tests for `polyproxy`.
//!
//! These tests invoke the compiled `polyproxy` binary as a subprocess
//! and verify its behavior end-to-end. Each test operates in an isolated
//! temp directory.
//!
//! # Running
//!
//! ```bash
//! cargo test --test integration_test
//! ```

#![allow(clippy::unwrap_used)]

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

// ============================================================================
// Infrastructure
// ============================================================================

/// Path to the compiled `polyproxy` binary, injected by Cargo.
const POLYPROXY: &str = env!("CARGO_BIN_EXE_polyproxy");

/// Invoke `polyproxy` with the given arguments in `cwd`.
fn run_polyproxy(cwd: &Path, args: &[&str]) -> Output {
    Command::new(POLYPROXY)
        .args(args)
        .current_dir(cwd)
        .env_remove("POLYPROXY_LOG") // keep test output clean
        .output()
        .unwrap_or_else(|e| panic!("Failed to spawn polyproxy binary: {e}"))
}

/// Assert exit-success and return stdout as a String.
#[track_caller]
fn expect_success(out: &Output) -> String {
    assert!(
        out.status.success(),
        "polyproxy exited {:?}\nstdout: {}\nstderr: {}",
        out.status.code(),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr),
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}

/// Assert that the command exited with a non-zero status.
#[track_caller]
fn expect_failure(out: &Output) {
    assert!(
        !out.status.success(),
        "Expected polyproxy to fail but it succeeded\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr),
    );
}

const VALID_CONFIG: &str = "\
[server]
127.0.0.1:0
[upstream]
proxy-a.test:3128
proxy-b.test:3128
[direct]
*.internal.test
[cluster]
www.example.com=www.example.com
[block]
ads.test
";

fn write_config(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("proxy.conf");
    fs::write(&path, contents).unwrap();
    path
}

// ============================================================================
// A. check command
// ============================================================================

#[test]
fn test_check_valid_config() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, VALID_CONFIG);

    let out = run_polyproxy(dir.path(), &["check", config.to_str().unwrap()]);
    let stdout = expect_success(&out);
    assert!(stdout.contains("Config: OK"));
    assert!(stdout.contains("Structure: OK"));
    assert!(stdout.contains("Upstream proxies: 2"));
    assert!(stdout.contains("Clusters: 1"));
    assert!(stdout.contains("Middle proxy: none"));
    assert!(stdout.contains("Bind: OK"));
}

#[test]
fn test_check_missing_file_fails() {
    let dir = TempDir::new().unwrap();
    let out = run_polyproxy(dir.path(), &["check", "no-such-file.conf"]);
    expect_failure(&out);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Config: FAIL"));
}

#[test]
fn test_check_config_without_upstreams_fails() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "[server]\n127.0.0.1:0\n");

    let out = run_polyproxy(dir.path(), &["check", config.to_str().unwrap()]);
    expect_failure(&out);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Structure: FAIL"));
}

#[test]
fn test_check_reports_middle_proxy() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        &dir,
        "[server]\n127.0.0.1:0\n[upstream]\na.test:1\n[proxy]\nhop.test:8080\n",
    );

    let out = run_polyproxy(dir.path(), &["check", config.to_str().unwrap()]);
    let stdout = expect_success(&out);
    assert!(stdout.contains("Middle proxy: hop.test:8080"));
}

// ============================================================================
// B. config command
// ============================================================================

#[test]
fn test_config_dump_roundtrip() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, VALID_CONFIG);

    let out = run_polyproxy(dir.path(), &["config", config.to_str().unwrap()]);
    let dumped = expect_success(&out);

    // Feeding the dump back through the command reproduces it exactly.
    let second = write_config(&dir, &dumped);
    let out = run_polyproxy(dir.path(), &["config", second.to_str().unwrap()]);
    assert_eq!(expect_success(&out), dumped);
}

#[test]
fn test_config_dump_preserves_upstream_order() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "[server]\na:1\n[upstream]\nz.test:1\nm.test:2\na.test:3\n");

    let out = run_polyproxy(dir.path(), &["config", config.to_str().unwrap()]);
    let dumped = expect_success(&out);
    let z = dumped.find("z.test:1").unwrap();
    let m = dumped.find("m.test:2").unwrap();
    let a = dumped.find("a.test:3").unwrap();
    assert!(z < m && m < a);
}

#[test]
fn test_config_malformed_cluster_fails() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "[cluster]\nmissing-equals\n");

    let out = run_polyproxy(dir.path(), &["config", config.to_str().unwrap()]);
    expect_failure(&out);
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("cluster entry without '='"));
}

// ============================================================================
// C. run command
// ============================================================================

#[test]
fn test_run_missing_config_fails_fast() {
    let dir = TempDir::new().unwrap();
    let out = run_polyproxy(dir.path(), &["run", "no-such-file.conf"]);
    expect_failure(&out);
}

#[test]
fn test_run_invalid_config_fails_fast() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "[upstream]\na.test:1\n");

    let out = run_polyproxy(dir.path(), &["run", config.to_str().unwrap()]);
    expect_failure(&out);
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("missing [server]"));
}
