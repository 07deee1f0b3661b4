//! Run many independent sessions on a fixed worker pool.
//!
//! Sessions share nothing. Jobs go out over a `crossbeam-channel` queue to
//! scoped worker threads; outcomes come back tagged with their job index so
//! the returned list is in submission order regardless of finish order.

use std::thread;

use crossbeam_channel::unbounded;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::config::SessionSpec;
use crate::core::errors::Result;
use crate::logger::shared::{LabeledSink, SharedAuditSink};
use crate::ports::AuditSink;
use crate::ports::scripted::Script;
use crate::result::SessionResult;
use crate::scheduler::run_session;

/// One session to run with scripted adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    /// Session label; also the audit label when a shared sink is used.
    pub label: String,
    pub spec: SessionSpec,
    #[serde(default)]
    pub script: Script,
}

/// Result of one job.
#[derive(Debug)]
pub struct BatchOutcome {
    pub label: String,
    pub result: Result<SessionResult>,
}

fn run_job(job: BatchJob, sink: Option<&mut dyn AuditSink>) -> BatchOutcome {
    let BatchJob {
        label,
        spec,
        script,
    } = job;
    let mut scripted = script.into_ports();
    let mut ports = scripted.ports();
    if let Some(sink) = sink {
        ports = ports.with_audit_sink(sink);
    }
    let result = run_session(spec, &mut ports);
    BatchOutcome { label, result }
}

fn run_pool<F>(jobs: Vec<BatchJob>, workers: usize, run: F) -> Vec<BatchOutcome>
where
    F: Fn(BatchJob) -> BatchOutcome + Sync,
{
    let total = jobs.len();
    let workers = workers.clamp(1, total.max(1));
    let (job_tx, job_rx) = unbounded::<(usize, BatchJob)>();
    let (out_tx, out_rx) = unbounded::<(usize, BatchOutcome)>();
    for item in jobs.into_iter().enumerate() {
        if job_tx.send(item).is_err() {
            break;
        }
    }
    drop(job_tx);

    info!(jobs = total, workers, "batch started");
    thread::scope(|scope| {
        for worker in 0..workers {
            let job_rx = job_rx.clone();
            let out_tx = out_tx.clone();
            let run = &run;
            scope.spawn(move || {
                for (idx, job) in &job_rx {
                    debug!(worker, label = %job.label, "batch job started");
                    if out_tx.send((idx, run(job))).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(out_tx);

    let mut slots: Vec<Option<BatchOutcome>> = (0..total).map(|_| None).collect();
    for (idx, outcome) in out_rx.try_iter() {
        slots[idx] = Some(outcome);
    }
    slots.into_iter().flatten().collect()
}

/// Run every job on `workers` threads. Outcomes keep submission order.
pub fn run_parallel(jobs: Vec<BatchJob>, workers: usize) -> Vec<BatchOutcome> {
    run_pool(jobs, workers, |job| run_job(job, None))
}

/// Like [`run_parallel`], with every session's trail appended to one shared
/// sink under the job's label.
pub fn run_parallel_with_sink<S: LabeledSink>(
    jobs: Vec<BatchJob>,
    workers: usize,
    sink: &SharedAuditSink<S>,
) -> Vec<BatchOutcome> {
    run_pool(jobs, workers, |job| {
        let mut handle = sink.for_session(&job.label);
        run_job(job, Some(&mut handle))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{RootSpec, SessionConfig};
    use crate::logger::Envelope;
    use crate::result::StopReason;
    use serde_json::json;

    fn job(label: &str, credits: u32) -> BatchJob {
        let mut spec = SessionSpec::new(
            "Pump station outage",
            vec![RootSpec::new("H1", "Mechanism A"), RootSpec::new("H2", "Mechanism B")],
        );
        spec.config = SessionConfig {
            credits,
            ..SessionConfig::default()
        };
        let script = Script {
            fallback_evaluation: Some(json!({
                "p": 0.8,
                "rubric": {"A": 2, "B": 2, "C": 2, "D": 2},
                "evidence_ids": ["E1"],
                "entailment": "SUPPORTS",
                "evidence_quality": "direct",
                "reasoning_summary": "telemetry matches"
            })),
            ..Script::default()
        };
        BatchJob {
            label: label.to_string(),
            spec,
            script,
        }
    }

    #[test]
    fn outcomes_keep_submission_order() {
        let jobs: Vec<BatchJob> = (0..6).map(|i| job(&format!("job{i}"), 3 + i)).collect();
        let outcomes = run_parallel(jobs, 3);
        assert_eq!(outcomes.len(), 6);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.label, format!("job{i}"));
            let result = outcome.result.as_ref().expect("session ran");
            assert_eq!(result.stop_reason, StopReason::CreditsExhausted);
            assert_eq!(result.total_credits_spent, 3 + i as u32);
        }
    }

    #[test]
    fn parallel_runs_match_sequential_runs() {
        let sequential = run_parallel(vec![job("a", 4), job("b", 7)], 1);
        let parallel = run_parallel(vec![job("a", 4), job("b", 7)], 4);
        for (s, p) in sequential.iter().zip(&parallel) {
            let (s, p) = (s.result.as_ref().expect("ran"), p.result.as_ref().expect("ran"));
            assert_eq!(s.ledger, p.ledger);
            assert_eq!(s.metadata.trace_digest, p.metadata.trace_digest);
        }
    }

    #[test]
    fn shared_sink_keeps_per_session_order() {
        let sink = SharedAuditSink::new(Vec::<Envelope>::new(), "batch");
        let outcomes = run_parallel_with_sink(vec![job("a", 2), job("b", 5)], 2, &sink);
        let expected: Vec<usize> = outcomes
            .iter()
            .map(|o| o.result.as_ref().expect("ran").audit_log.len())
            .collect();
        sink.with_inner(|records| {
            for (label, len) in ["a", "b"].into_iter().zip(expected) {
                let seqs: Vec<u64> = records
                    .iter()
                    .filter(|e| e.session == label)
                    .map(|e| e.seq)
                    .collect();
                assert_eq!(seqs.len(), len);
                assert!(seqs.windows(2).all(|w| w[0] + 1 == w[1]));
            }
        });
    }

    #[test]
    fn empty_batch_is_empty() {
        assert!(run_parallel(Vec::new(), 4).is_empty());
    }
}
