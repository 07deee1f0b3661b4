//! Deterministic replay of a recorded audit trail.
//!
//! Replay rebuilds the session from `SESSION_INITIALIZED` and serves every
//! port call from the responses recorded in `OP_EXECUTED` and
//! `SEARCH_EXECUTED`. No live port is ever consulted. A request the trail
//! cannot answer, a recomputed operation that differs from the recorded one,
//! a recorded response left unconsumed, or a final ledger that differs from
//! the recorded one is a divergence.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::audit::{AuditEvent, AuditEventType};
use crate::core::config::SessionSpec;
use crate::core::errors::{AbxError, Result};
use crate::ports::{
    DecomposeTarget, Decomposer, Decomposition, EvaluationOutcome, EvaluationRequest, Evaluator,
    EvidenceItem, Searcher, SessionPorts,
};
use crate::result::{SessionResult, StopReason};
use crate::scheduler::frontier::{OpKind, Operation};
use crate::scheduler::session::{PortResponse, Session};

#[derive(Debug, Deserialize)]
struct InitialPayload {
    spec: SessionSpec,
    #[serde(default)]
    decomposer_attached: bool,
    #[serde(default)]
    searcher_attached: bool,
}

#[derive(Debug, Deserialize)]
struct OpPayload {
    op: Operation,
    #[serde(default)]
    response: Option<PortResponse>,
}

#[derive(Debug, Deserialize)]
struct SearchPayload {
    root_id: String,
    #[serde(default)]
    results: Vec<EvidenceItem>,
}

#[derive(Debug, Deserialize)]
struct StopPayload {
    stop_reason: StopReason,
    ledger: BTreeMap<String, f64>,
}

/// Terminal state recorded by `STOP_REASON_SET`.
#[derive(Debug)]
struct RecordedStop {
    seq: u64,
    reason: StopReason,
    ledger: BTreeMap<String, f64>,
}

/// Largest absolute ledger difference tolerated between trail and replay.
const LEDGER_TOLERANCE: f64 = 1e-9;

fn decode<T: DeserializeOwned>(event: &AuditEvent) -> Result<T> {
    serde_json::from_value(event.payload.clone()).map_err(|err| AbxError::ReplayIncomplete {
        details: format!("{} payload at seq {}: {err}", event.event_type, event.seq),
    })
}

/// Recorded responses, queued per target key in trail order.
#[derive(Debug)]
struct Recorded<T> {
    queues: BTreeMap<String, VecDeque<(u64, T)>>,
}

impl<T> Default for Recorded<T> {
    fn default() -> Self {
        Self {
            queues: BTreeMap::new(),
        }
    }
}

impl<T> Recorded<T> {
    fn push(&mut self, key: String, seq: u64, value: T) {
        self.queues.entry(key).or_default().push_back((seq, value));
    }

    fn take(&mut self, port: &str, key: &str) -> Result<T> {
        self.queues
            .get_mut(key)
            .and_then(VecDeque::pop_front)
            .map(|(_, value)| value)
            .ok_or_else(|| AbxError::ReplayDivergence {
                seq: 0,
                details: format!("{port} asked for {key} but the trail has no recorded response"),
            })
    }

    /// Sequence number of the first response nobody asked for.
    fn first_unconsumed(&self) -> Option<(u64, &str)> {
        self.queues
            .iter()
            .filter_map(|(key, queue)| queue.front().map(|(seq, _)| (*seq, key.as_str())))
            .min_by_key(|(seq, _)| *seq)
    }
}

/// Evaluator that answers from the recorded trail.
#[derive(Debug, Default)]
pub struct ReplayEvaluator {
    recorded: Recorded<EvaluationOutcome>,
}

impl Evaluator for ReplayEvaluator {
    fn evaluate(&mut self, request: &EvaluationRequest) -> Result<EvaluationOutcome> {
        self.recorded.take("evaluator", &request.node_key)
    }
}

/// Decomposer that answers from the recorded trail.
#[derive(Debug, Default)]
pub struct ReplayDecomposer {
    recorded: Recorded<Decomposition>,
}

impl Decomposer for ReplayDecomposer {
    fn decompose(&mut self, target: &DecomposeTarget) -> Result<Decomposition> {
        self.recorded.take("decomposer", target.key())
    }
}

/// Searcher that answers from the recorded trail.
#[derive(Debug, Default)]
pub struct ReplaySearcher {
    recorded: Recorded<Vec<EvidenceItem>>,
}

impl Searcher for ReplaySearcher {
    fn search(
        &mut self,
        _query: &str,
        _limit: usize,
        metadata: &BTreeMap<String, String>,
    ) -> Result<Vec<EvidenceItem>> {
        let root_id = metadata.get("root_id").map_or("", String::as_str);
        self.recorded.take("searcher", root_id)
    }
}

/// Everything replay extracts from a trail before running.
#[derive(Debug)]
struct Trail {
    spec: SessionSpec,
    decomposer_attached: bool,
    searcher_attached: bool,
    ops: Vec<(u64, Operation)>,
    stop: Option<RecordedStop>,
    evaluator: ReplayEvaluator,
    decomposer: ReplayDecomposer,
    searcher: ReplaySearcher,
}

fn parse_trail(trace: &[AuditEvent]) -> Result<Trail> {
    let first = trace.first().ok_or_else(|| AbxError::ReplayIncomplete {
        details: "trace is empty".to_string(),
    })?;
    if first.event_type != AuditEventType::SessionInitialized {
        return Err(AbxError::ReplayIncomplete {
            details: format!("trace starts with {}, not SESSION_INITIALIZED", first.event_type),
        });
    }
    let initial: InitialPayload = decode(first)?;
    let mut trail = Trail {
        spec: initial.spec,
        decomposer_attached: initial.decomposer_attached,
        searcher_attached: initial.searcher_attached,
        ops: Vec::new(),
        stop: None,
        evaluator: ReplayEvaluator::default(),
        decomposer: ReplayDecomposer::default(),
        searcher: ReplaySearcher::default(),
    };

    for event in &trace[1..] {
        match event.event_type {
            AuditEventType::OpExecuted => {
                let payload: OpPayload = decode(event)?;
                let key = match payload.op.kind {
                    OpKind::DecomposeRoot | OpKind::DecomposeSlot => payload.op.root_id.clone(),
                    OpKind::DecomposeNode | OpKind::Evaluate => payload.op.target.clone(),
                };
                match payload.response {
                    Some(PortResponse::Evaluator(outcome)) => {
                        trail.evaluator.recorded.push(key, event.seq, outcome);
                    }
                    Some(PortResponse::Decomposer(decomposition)) => {
                        trail.decomposer.recorded.push(key, event.seq, decomposition);
                    }
                    None => {}
                }
                trail.ops.push((event.seq, payload.op));
            }
            AuditEventType::SearchExecuted => {
                let payload: SearchPayload = decode(event)?;
                trail
                    .searcher
                    .recorded
                    .push(payload.root_id, event.seq, payload.results);
            }
            AuditEventType::StopReasonSet => {
                let payload: StopPayload = decode(event)?;
                trail.stop = Some(RecordedStop {
                    seq: event.seq,
                    reason: payload.stop_reason,
                    ledger: payload.ledger,
                });
            }
            _ => {}
        }
    }
    Ok(trail)
}

fn check_ledger(recorded: &RecordedStop, replayed: &BTreeMap<String, f64>) -> Result<()> {
    let ids: BTreeSet<&String> =
        recorded.ledger.keys().chain(replayed.keys()).collect();
    for id in ids {
        let (Some(expected), Some(actual)) = (recorded.ledger.get(id), replayed.get(id)) else {
            return Err(AbxError::ReplayDivergence {
                seq: recorded.seq,
                details: format!("ledger entry {id} present on only one side"),
            });
        };
        if (expected - actual).abs() > LEDGER_TOLERANCE {
            return Err(AbxError::ReplayDivergence {
                seq: recorded.seq,
                details: format!("ledger {id}: recorded {expected}, replayed {actual}"),
            });
        }
    }
    Ok(())
}

/// Re-run a recorded session from its audit trail.
pub fn replay(trace: &[AuditEvent]) -> Result<SessionResult> {
    let Trail {
        spec,
        decomposer_attached,
        searcher_attached,
        ops,
        stop,
        mut evaluator,
        mut decomposer,
        mut searcher,
    } = parse_trail(trace)?;
    let recorded = stop.ok_or_else(|| AbxError::ReplayIncomplete {
        details: "trace has no STOP_REASON_SET event".to_string(),
    })?;
    debug!(events = trace.len(), operations = ops.len(), "replaying trace");

    let result = {
        let mut ports = SessionPorts::new(&mut evaluator);
        if decomposer_attached {
            ports = ports.with_decomposer(&mut decomposer);
        }
        if searcher_attached {
            ports = ports.with_searcher(&mut searcher);
        }
        Session::new(spec)?.run(&mut ports)?
    };

    for (idx, (seq, recorded)) in ops.iter().enumerate() {
        let Some(record) = result.operation_log.get(idx) else {
            return Err(AbxError::ReplayDivergence {
                seq: *seq,
                details: format!("replay stopped before recorded operation {idx}"),
            });
        };
        if record.op != *recorded {
            return Err(AbxError::ReplayDivergence {
                seq: *seq,
                details: format!(
                    "operation {idx}: recorded {:?} on {}, recomputed {:?} on {}",
                    recorded.kind, recorded.target, record.op.kind, record.op.target
                ),
            });
        }
    }
    if result.operation_log.len() != ops.len() {
        return Err(AbxError::ReplayDivergence {
            seq: trace.last().map_or(0, |event| event.seq),
            details: format!(
                "replay executed {} operations, trace recorded {}",
                result.operation_log.len(),
                ops.len()
            ),
        });
    }

    let unconsumed = [
        evaluator.recorded.first_unconsumed(),
        decomposer.recorded.first_unconsumed(),
        searcher.recorded.first_unconsumed(),
    ]
    .into_iter()
    .flatten()
    .min_by_key(|(seq, _)| *seq);
    if let Some((seq, key)) = unconsumed {
        return Err(AbxError::ReplayDivergence {
            seq,
            details: format!("recorded response for {key} was never requested"),
        });
    }

    if result.stop_reason != recorded.reason {
        return Err(AbxError::ReplayDivergence {
            seq: recorded.seq,
            details: format!(
                "stop reason {} differs from recorded {}",
                result.stop_reason, recorded.reason
            ),
        });
    }
    check_ledger(&recorded, &result.ledger)?;
    info!(
        operations = result.operation_log.len(),
        stop_reason = %result.stop_reason,
        "replay matched trace"
    );
    Ok(result)
}
