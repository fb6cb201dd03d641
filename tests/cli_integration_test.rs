//! CLI integration tests for the tryjob-reconciler binary.
//! Exit codes and JSON output of each command.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;

const PASSING_SCENARIO: &str = r"
identity:
  builder: linux-rel
builders:
  - builder_id: try/linux-rel
suites:
  - name: browser_tests
    shards: 2
    phases:
      with_patch:
        failed_shards: [0]
        tests:
          - name: Flaky.a
            statuses: [FAIL]
      retry_shards_with_patch:
        tests:
          - name: Flaky.a
            statuses: [PASS]
";

const FAILING_SCENARIO: &str = r"
identity:
  builder: linux-rel
builders:
  - builder_id: try/linux-rel
suites:
  - name: browser_tests
    phases:
      with_patch:
        failed_shards: [0]
        tests:
          - name: Broken.a
            statuses: [FAIL]
      retry_shards_with_patch:
        failed_shards: [0]
        tests:
          - name: Broken.a
            statuses: [FAIL]
";

/// Build a command for the binary with its working directory set to `dir`,
/// so no project configuration leaks in.
fn reconciler_cmd(dir: &Path) -> Command {
    let mut cmd = assert_cmd::cargo_bin_cmd!("tryjob-reconciler");
    cmd.current_dir(dir)
        .env_remove("TRYJOB_CONFIG")
        .env("TRYJOB_LOGGING__LEVEL", "warn");
    cmd
}

fn write(dir: &TempDir, name: &str, content: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, content).expect("write fixture");
    path.to_string_lossy().into_owned()
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout)
        .unwrap_or_else(|e| panic!("stdout is not JSON ({e}): {}", String::from_utf8_lossy(&output.stdout)))
}

#[test]
fn test_run_passing_scenario() {
    let dir = TempDir::new().unwrap();
    let scenario = write(&dir, "pass.yaml", PASSING_SCENARIO);

    let output = reconciler_cmd(dir.path())
        .args(["--json", "run", &scenario])
        .assert()
        .code(0)
        .get_output()
        .clone();

    let json = stdout_json(&output);
    assert_eq!(json["builder"], "linux-rel");
    assert_eq!(json["raw_result"]["status"], "SUCCESS");
    assert_eq!(json["suites"][0]["name"], "browser_tests");
}

#[test]
fn test_run_failing_scenario_exits_one() {
    let dir = TempDir::new().unwrap();
    let scenario = write(&dir, "fail.yaml", FAILING_SCENARIO);

    reconciler_cmd(dir.path())
        .args(["run", &scenario])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("linux-rel: FAILURE"))
        .stdout(predicate::str::contains("**browser_tests** failed because of:"))
        .stdout(predicate::str::contains("- Broken.a"));
}

#[test]
fn test_run_missing_scenario_is_infra_failure() {
    let dir = TempDir::new().unwrap();

    let output = reconciler_cmd(dir.path())
        .args(["--json", "run", "absent.yaml"])
        .assert()
        .code(2)
        .get_output()
        .clone();

    let json = stdout_json(&output);
    assert_eq!(json["status"], "INFRA_FAILURE");
    assert!(json["error"].as_str().unwrap().contains("absent.yaml"));
}

#[test]
fn test_shards_json() {
    let dir = TempDir::new().unwrap();

    let output = reconciler_cmd(dir.path())
        .args(["shards", "--original", "10", "--retried", "20", "--total", "1000", "--json"])
        .assert()
        .success()
        .get_output()
        .clone();

    let json = stdout_json(&output);
    assert_eq!(json["retry_shards"], 2);
    assert_eq!(json["repeat_count"], 10);
}

#[test]
fn test_config_reads_explicit_file() {
    let dir = TempDir::new().unwrap();
    let config = write(&dir, "tryjob.yaml", "retry:\n  min_failed_suites_to_skip_retry: 2\n");

    let output = reconciler_cmd(dir.path())
        .args(["--json", "--config", &config, "config"])
        .assert()
        .success()
        .get_output()
        .clone();

    let json = stdout_json(&output);
    assert_eq!(json["retry"]["min_failed_suites_to_skip_retry"], 2);
    assert_eq!(json["logging"]["level"], "warn");
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = write(&dir, "tryjob.yaml", "summary:\n  size_limit: 0\n");

    reconciler_cmd(dir.path())
        .args(["--config", &config, "config"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Invalid summary limits"));
}
