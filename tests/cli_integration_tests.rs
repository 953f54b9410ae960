use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

fn cmd() -> Command {
    Command::cargo_bin("gpu-lease").expect("binary")
}

#[test]
fn help_lists_the_documented_flags() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--cheapest"))
        .stdout(predicate::str::contains("--stop"))
        .stdout(predicate::str::contains("--on-demand"))
        .stdout(predicate::str::contains("--output"));
}

#[test]
fn version_flag_succeeds() {
    cmd().arg("--version").assert().success();
}

#[test]
fn unknown_flag_is_a_clap_usage_error() {
    cmd().arg("--not-a-real-flag").assert().failure().code(2);
}

#[test]
fn unknown_tier_is_rejected_before_any_network_call() {
    cmd().args(["--tier", "huge", "--yes"]).assert().failure().code(2);
}

#[test]
fn stop_with_no_recorded_state_reports_no_active_instance() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state_path = dir.path().join("state.json");

    cmd()
        .env("GPU_LEASE_STATE", &state_path)
        .env_remove("VAST_API_KEY")
        .env_remove("LAMBDA_API_KEY")
        .env_remove("RUNPOD_API_KEY")
        .env_remove("COREWEAVE_API_KEY")
        .env_remove("PAPERSPACE_API_KEY")
        .env_remove("GPU_LEASE_CONFIG")
        .args(["--stop", "--yes", "--output", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\":\"no_active_instance\""));
}

#[test]
fn deploy_with_no_configured_provider_fails_cleanly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state_path = dir.path().join("state.json");

    cmd()
        .env("GPU_LEASE_STATE", &state_path)
        .env("HOME", dir.path())
        .env_remove("VAST_API_KEY")
        .env_remove("LAMBDA_API_KEY")
        .env_remove("RUNPOD_API_KEY")
        .env_remove("COREWEAVE_API_KEY")
        .env_remove("PAPERSPACE_API_KEY")
        .env_remove("GPU_LEASE_CONFIG")
        .args(["--yes", "--output", "json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no provider configured"));
}
