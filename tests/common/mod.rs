//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use serde_json::{Value, json};

/// Captured output of one CLI invocation.
pub struct CliCaseResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    /// Full transcript of the invocation, kept for failure messages.
    pub log_path: PathBuf,
}

fn case_dir(case: &str) -> PathBuf {
    let dir = Path::new(env!("CARGO_TARGET_TMPDIR")).join("cli-cases").join(case);
    fs::create_dir_all(&dir).expect("create case directory");
    dir
}

/// Run the `abx` binary with `args` and log the transcript under the case name.
pub fn run_cli_case(case: &str, args: &[&str]) -> CliCaseResult {
    let output = Command::new(env!("CARGO_BIN_EXE_abx"))
        .args(args)
        .env_remove("ABX_LOG")
        .output()
        .expect("spawn abx");
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let log_path = case_dir(case).join("transcript.log");
    let transcript = format!(
        "args: {args:?}\nstatus: {}\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}\n",
        output.status
    );
    fs::write(&log_path, transcript).expect("write transcript");
    CliCaseResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// Write `contents` to `dir/name` and return the path.
pub fn write_fixture(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("write fixture");
    path
}

/// Two-root spec in TOML form.
pub fn two_root_spec_toml(credits: u32) -> String {
    format!(
        r#"claim = "Pump station outage"

[config]
credits = {credits}
gamma_noa = 0.10
gamma_und = 0.10

[[roots]]
root_id = "H1"
statement = "Mechanism A"

[[roots]]
root_id = "H2"
statement = "Mechanism B"
"#
    )
}

/// Evaluator payload with a full rubric and direct evidence.
pub fn strong_support() -> Value {
    json!({
        "p": 0.9,
        "rubric": {"A": 2, "B": 2, "C": 2, "D": 2},
        "evidence_ids": ["E1"],
        "entailment": "SUPPORTS",
        "evidence_quality": "direct",
        "reasoning_summary": "flow telemetry matches the mechanism"
    })
}

/// Script whose every evaluation is [`strong_support`].
pub fn strong_script_json() -> String {
    json!({ "fallback_evaluation": strong_support() }).to_string()
}
