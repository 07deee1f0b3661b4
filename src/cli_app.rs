//! Top-level CLI definition and dispatch.

use std::io;
use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use crate::audit::replay::replay;
use crate::core::config::SessionSpec;
use crate::core::errors::{AbxError, Result};
use crate::core::policy::{Policy, PolicyOverrides, PolicyProfile};
use crate::gates::mece::check_certificate;
use crate::logger::jsonl::{JsonlAuditSink, read_trace};
use crate::ports::scripted::Script;
use crate::result::{SessionResult, StopReason};
use crate::scheduler::Session;

/// abx: budget-constrained abductive reasoning with a replayable audit trail.
#[derive(Parser)]
#[command(name = "abx", version, about)]
pub struct Cli {
    /// Raise diagnostic verbosity (-v info, -vv debug). `ABX_LOG` overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Run a session with scripted adapters.
    Run {
        /// Session spec (TOML or JSON).
        spec: PathBuf,
        /// Adapter script (JSON).
        #[arg(long)]
        script: PathBuf,
        /// Append the audit trail to a JSONL file.
        #[arg(long)]
        audit_jsonl: Option<PathBuf>,
        /// Append the audit trail to a SQLite database.
        #[cfg(feature = "sqlite")]
        #[arg(long, conflicts_with = "audit_jsonl")]
        audit_sqlite: Option<PathBuf>,
        /// Session label stored with persisted events.
        #[arg(long, default_value = "abx")]
        session: String,
        /// Print the full result as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Replay a JSONL audit trail and check it reproduces.
    Replay {
        trace: PathBuf,
        /// Session label to replay; defaults to the first in the file.
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Print a resolved policy.
    Policy {
        #[arg(long, default_value = "default")]
        profile: String,
        /// Overrides file (TOML or JSON).
        #[arg(long)]
        overrides: Option<PathBuf>,
    },
    /// Check a spec's configuration and MECE certificate without running.
    Validate { spec: PathBuf },
    /// Print shell completions.
    Completions { shell: Shell },
}

/// Install the stderr diagnostic subscriber.
pub fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env("ABX_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn load_overrides(path: &Path) -> Result<PolicyOverrides> {
    let text = std::fs::read_to_string(path).map_err(|err| AbxError::io(path, err))?;
    if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&text).map_err(|err| AbxError::ConfigParse {
            context: "policy overrides",
            details: err.to_string(),
        })
    } else {
        Ok(toml::from_str(&text)?)
    }
}

fn stop_label(stop: StopReason) -> colored::ColoredString {
    match stop {
        StopReason::FrontierConfident => stop.as_str().green().bold(),
        StopReason::MeceCertificateFailed
        | StopReason::PolicyConfigIncompatible
        | StopReason::ClosureGatesUnmet => stop.as_str().red().bold(),
        _ => stop.as_str().yellow().bold(),
    }
}

fn print_summary(result: &SessionResult) {
    println!("{} {}", "stop:".bold(), stop_label(result.stop_reason));
    println!(
        "{} {} spent, {} remaining",
        "credits:".bold(),
        result.total_credits_spent,
        result.credits_remaining
    );
    let mut ledger: Vec<(&String, &f64)> = result.ledger.iter().collect();
    ledger.sort_by(|a, b| b.1.total_cmp(a.1).then_with(|| a.0.cmp(b.0)));
    println!("{}", "ledger:".bold());
    for (id, mass) in ledger {
        let line = format!("  {id:<24} {mass:.4}");
        if result.leader().is_some_and(|(leader, _)| leader == id.as_str()) {
            println!("{}", line.cyan());
        } else {
            println!("{line}");
        }
    }
    if !result.metadata.recommendations.is_empty() {
        println!("{}", "next steps:".bold());
        for rec in result.metadata.recommendations.iter().take(5) {
            println!("  {}. {} {} ({})", rec.rank, rec.action, rec.target, rec.reason);
        }
    }
    println!("{} {}", "trace:".bold(), result.metadata.trace_digest.dimmed());
}

fn emit(result: &SessionResult, json: bool) -> Result<()> {
    if json {
        println!("{}", result.to_json_pretty()?);
    } else {
        print_summary(result);
    }
    Ok(())
}

/// Dispatch CLI commands.
///
/// # Errors
/// Returns an error if the subcommand fails.
pub fn run(cli: &Cli) -> std::result::Result<(), Box<dyn std::error::Error>> {
    match &cli.command {
        Command::Run {
            spec,
            script,
            audit_jsonl,
            #[cfg(feature = "sqlite")]
            audit_sqlite,
            session,
            json,
        } => {
            let spec = SessionSpec::load(spec)?;
            let mut scripted = Script::load(script)?.into_ports();
            let mut ports = scripted.ports();

            let mut jsonl_sink = audit_jsonl
                .as_deref()
                .map(|path| JsonlAuditSink::open(path, session))
                .transpose()?;
            #[cfg(feature = "sqlite")]
            let mut sqlite_sink = audit_sqlite
                .as_deref()
                .map(|path| crate::logger::sqlite::SqliteAuditSink::open(path, session))
                .transpose()?;
            if let Some(sink) = jsonl_sink.as_mut() {
                ports = ports.with_audit_sink(sink);
            }
            #[cfg(feature = "sqlite")]
            {
                if let Some(sink) = sqlite_sink.as_mut() {
                    ports = ports.with_audit_sink(sink);
                }
            }

            let result = Session::new(spec)?.run(&mut ports)?;
            emit(&result, *json)?;
        }
        Command::Replay {
            trace,
            session,
            json,
        } => {
            let events = read_trace(trace, session.as_deref())?;
            let result = replay(&events)?;
            if !*json {
                println!(
                    "{} {} events, {} operations reproduced",
                    "replay ok:".green().bold(),
                    events.len(),
                    result.operation_log.len()
                );
            }
            emit(&result, *json)?;
        }
        Command::Policy { profile, overrides } => {
            let profile: PolicyProfile = profile.parse()?;
            let overrides = overrides
                .as_deref()
                .map(load_overrides)
                .transpose()?
                .unwrap_or_default();
            let policy = Policy::resolve(profile, &overrides)?;
            println!("{}", serde_json::to_string_pretty(&policy)?);
        }
        Command::Validate { spec } => {
            let spec = SessionSpec::load(spec)?;
            let certificate = spec.mece_certificate.clone();
            let session = Session::new(spec)?;
            let policy = session.policy();
            println!(
                "{} profile {}, {} roots, {} credits",
                "valid:".green().bold(),
                policy.profile,
                session.hypotheses().named_ids().len(),
                session.credits_remaining()
            );
            if policy.mece.strict {
                let check = check_certificate(
                    &certificate,
                    &session.hypotheses().named_ids(),
                    policy.mece.max_pair_overlap,
                );
                if check.status.passed() {
                    println!("{} {} pairs certified", "mece:".bold(), check.pairs_checked);
                } else {
                    println!(
                        "{} {} of {} pairs fail the certificate",
                        "mece:".red().bold(),
                        check.failures.len(),
                        check.pairs_checked
                    );
                }
            }
        }
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "abx", &mut io::stdout());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_requires_a_script() {
        assert!(Cli::try_parse_from(["abx", "run", "spec.toml"]).is_err());
        let cli = Cli::try_parse_from(["abx", "-vv", "run", "spec.toml", "--script", "s.json"])
            .expect("parses");
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Command::Run { json: false, .. }));
    }
}
