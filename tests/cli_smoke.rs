//! Smoke tests for the `abx` CLI surface.

mod common;

#[test]
fn help_command_prints_usage() {
    let result = common::run_cli_case("help_command_prints_usage", &["--help"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("Usage: abx [OPTIONS] <COMMAND>"),
        "missing help banner; log: {}",
        result.log_path.display()
    );
}

#[test]
fn version_command_prints_version() {
    let result = common::run_cli_case("version_command_prints_version", &["--version"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("abx"),
        "missing version output; log: {}",
        result.log_path.display()
    );
}

#[test]
fn policy_command_prints_resolved_profile() {
    let result = common::run_cli_case(
        "policy_command_prints_resolved_profile",
        &["policy", "--profile", "forecasting"],
    );
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    let policy: serde_json::Value =
        serde_json::from_str(&result.stdout).expect("policy is JSON");
    assert_eq!(policy["profile"], "forecasting");
    assert_eq!(policy["confidence_cap"], 0.8);
}

#[test]
fn unknown_profile_exits_with_error() {
    let result = common::run_cli_case(
        "unknown_profile_exits_with_error",
        &["policy", "--profile", "astrology"],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(
        result.stderr.contains("ABX-1101"),
        "expected policy error code; log: {}",
        result.log_path.display()
    );
}

#[test]
fn validate_accepts_a_well_formed_spec() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = common::write_fixture(dir.path(), "spec.toml", &common::two_root_spec_toml(10));
    let spec = spec.to_str().expect("utf-8 path");
    let result = common::run_cli_case("validate_accepts_a_well_formed_spec", &["validate", spec]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("2 roots") && result.stdout.contains("10 credits"),
        "expected summary; log: {}",
        result.log_path.display()
    );
}

#[test]
fn validate_rejects_missing_spec() {
    let result = common::run_cli_case(
        "validate_rejects_missing_spec",
        &["validate", "/nonexistent/abx/spec.toml"],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(
        result.stderr.contains("ABX-1002"),
        "expected missing config code; log: {}",
        result.log_path.display()
    );
}

#[test]
fn run_then_replay_round_trips_through_jsonl() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = common::write_fixture(dir.path(), "spec.toml", &common::two_root_spec_toml(6));
    let script = common::write_fixture(dir.path(), "script.json", &common::strong_script_json());
    let trail = dir.path().join("trail.jsonl");
    let (spec, script, trail) = (
        spec.to_str().expect("utf-8 path"),
        script.to_str().expect("utf-8 path"),
        trail.to_str().expect("utf-8 path"),
    );

    let run = common::run_cli_case(
        "run_then_replay_run",
        &[
            "run", spec, "--script", script, "--audit-jsonl", trail, "--session", "smoke", "--json",
        ],
    );
    assert!(run.status.success(), "run failed; log: {}", run.log_path.display());
    let result: serde_json::Value = serde_json::from_str(&run.stdout).expect("result is JSON");
    let stop = result["stop_reason"].as_str().expect("stop reason").to_string();

    let replayed = common::run_cli_case(
        "run_then_replay_replay",
        &["replay", trail, "--session", "smoke", "--json"],
    );
    assert!(
        replayed.status.success(),
        "replay failed; log: {}",
        replayed.log_path.display()
    );
    let replayed: serde_json::Value =
        serde_json::from_str(&replayed.stdout).expect("replay is JSON");
    assert_eq!(replayed["stop_reason"], stop.as_str());
    assert_eq!(replayed["operation_log"], result["operation_log"]);
}

#[test]
fn completions_command_generates_shell_script() {
    let result = common::run_cli_case(
        "completions_command_generates_shell_script",
        &["completions", "bash"],
    );
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("abx"),
        "expected completion script contents; log: {}",
        result.log_path.display()
    );
}
