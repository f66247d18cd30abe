use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

#[test]
fn help_lists_every_tool_subcommand() {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("npmlens"));
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("summary"))
        .stdout(predicate::str::contains("versions"))
        .stdout(predicate::str::contains("downloads"))
        .stdout(predicate::str::contains("details"))
        .stdout(predicate::str::contains("audit"))
        .stdout(predicate::str::contains("simulate-fix"))
        .stdout(predicate::str::contains("mcp-stdio"));
}

#[test]
fn audit_without_lockfile_fails_naming_the_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("npmlens"));
    cmd.args(["audit", dir.path().to_str().unwrap()]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("package-lock.json"))
        .stderr(predicate::str::contains("npm install"));
}

#[test]
fn simulate_fix_has_the_same_lockfile_precondition() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("npmlens"));
    cmd.args(["simulate-fix", dir.path().to_str().unwrap()]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("package-lock.json"));
}

#[test]
fn empty_package_name_is_rejected_before_any_request() {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("npmlens"));
    // Point at an unroutable registry: validation must fire first, so the
    // bad endpoint is never contacted and the error names the argument.
    cmd.env("NPMLENS_REGISTRY_URL", "http://127.0.0.1:9");
    cmd.args(["summary", "  "]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("packageName"));
}

#[test]
fn invalid_downloads_period_is_rejected_by_the_cli() {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("npmlens"));
    cmd.args(["downloads", "left-pad", "--period", "last-year"]);
    cmd.assert().failure();
}

#[test]
fn downloads_against_dead_endpoints_still_succeed_with_empty_stats() {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("npmlens"));
    cmd.env("NPMLENS_DOWNLOADS_URL", "http://127.0.0.1:9");
    cmd.args(["downloads", "left-pad"]);
    let out = cmd.assert().success().get_output().clone();
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json stdout");
    assert_eq!(v["schema_version"], 1);
    assert_eq!(v["ok"], true);
    assert_eq!(v["command"], "downloads");
    assert_eq!(v["result"]["package"], "left-pad");
    assert!(v["result"]["downloads"]
        .as_object()
        .expect("downloads map")
        .is_empty());
}
