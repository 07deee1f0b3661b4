//! Session result: final state, operation log, explanations and metadata.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::audit::AuditEvent;
use crate::core::config::WorldMode;
use crate::core::errors::{AbxError, Result};
use crate::core::policy::Policy;
use crate::gates::GateSnapshot;
use crate::gates::pairs::PairResolution;
use crate::ledger::model::{RootHypothesis, RootStatus};
use crate::scheduler::frontier::Operation;
use crate::scheduler::recommend::Recommendation;
use crate::tree::node::Node;

/// Closed set of terminal engine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    CreditsExhausted,
    OpLimitReached,
    NoHypotheses,
    NoLegalOp,
    FrontierConfident,
    ClosureGatesUnmet,
    MeceCertificateFailed,
    PolicyConfigIncompatible,
    EpistemicallyExhausted,
}

impl StopReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreditsExhausted => "CREDITS_EXHAUSTED",
            Self::OpLimitReached => "OP_LIMIT_REACHED",
            Self::NoHypotheses => "NO_HYPOTHESES",
            Self::NoLegalOp => "NO_LEGAL_OP",
            Self::FrontierConfident => "FRONTIER_CONFIDENT",
            Self::ClosureGatesUnmet => "CLOSURE_GATES_UNMET",
            Self::MeceCertificateFailed => "MECE_CERTIFICATE_FAILED",
            Self::PolicyConfigIncompatible => "POLICY_CONFIG_INCOMPATIBLE",
            Self::EpistemicallyExhausted => "EPISTEMICALLY_EXHAUSTED",
        }
    }

    /// Budget-driven stops that may be reclassified as epistemic
    /// exhaustion.
    #[must_use]
    pub const fn is_exhaustion(self) -> bool {
        matches!(self, Self::CreditsExhausted | Self::OpLimitReached)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One executed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub index: u32,
    #[serde(flatten)]
    pub op: Operation,
    pub credits_remaining_after: u32,
}

/// Per-slot line of a root explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotExplanation {
    pub slot: String,
    pub node_key: String,
    pub p: f64,
    pub k: f64,
    pub assessed: bool,
    pub evidence_ids: Vec<String>,
    pub reasoning_summary: String,
}

/// Why a root ended where it did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootExplanation {
    pub root_id: String,
    pub statement: String,
    pub probability: f64,
    pub k_root: f64,
    pub status: RootStatus,
    pub retired: bool,
    pub credits_spent: u32,
    pub slots: Vec<SlotExplanation>,
    /// Required NEC slots below the effective confidence threshold.
    pub gaps: Vec<String>,
}

/// Final state of one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairSummary {
    pub pair: String,
    pub support_left: f64,
    pub support_right: f64,
    pub resolution: PairResolution,
}

/// Metadata block of a session result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub policy: Policy,
    pub world_mode: WorldMode,
    pub tau_effective: f64,
    pub gate_snapshots: Vec<GateSnapshot>,
    pub recommendations: Vec<Recommendation>,
    /// Story roots added by contender-space expansion.
    pub expanded_contenders: Vec<String>,
    pub pairs: Vec<PairSummary>,
    pub und_floor: f64,
    /// SHA-256 over the audit trail.
    pub trace_digest: String,
}

/// Everything a session produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    pub claim: String,
    pub roots: BTreeMap<String, RootHypothesis>,
    pub ledger: BTreeMap<String, f64>,
    pub nodes: BTreeMap<String, Node>,
    pub audit_log: Vec<AuditEvent>,
    pub stop_reason: StopReason,
    pub credits_remaining: u32,
    pub total_credits_spent: u32,
    pub operation_log: Vec<OperationRecord>,
    pub explanations: BTreeMap<String, RootExplanation>,
    pub metadata: SessionMetadata,
}

impl SessionResult {
    #[must_use]
    pub fn ledger_sum(&self) -> f64 {
        self.ledger.values().sum()
    }

    /// Named root with the most mass, ties by root id.
    #[must_use]
    pub fn leader(&self) -> Option<(&str, f64)> {
        self.ledger
            .iter()
            .filter(|(id, _)| self.roots.contains_key(*id))
            .max_by(|a, b| a.1.total_cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(id, p)| (id.as_str(), *p))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(AbxError::from)
    }
}
