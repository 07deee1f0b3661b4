//! Append-only audit trail: the canonical record of a session and the sole
//! input to replay.

pub mod replay;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::canonical::digest_hex;
use crate::core::errors::Result;
use crate::ports::AuditSink;

/// Every kind of event a session emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    SessionInitialized,
    PolicyResolved,
    ContenderSpaceChecked,
    PolicyCompatibilityChecked,
    MeceCertificateChecked,
    MeceViolation,
    LedgerCorrected,
    SearchExecuted,
    OpExecuted,
    RootScoped,
    RootScopingFailed,
    SlotMaterialized,
    NodeDecomposed,
    NodeEvaluated,
    NodePropagated,
    PairEvidenceRecorded,
    LedgerUpdated,
    ResidualsRecomputed,
    ActiveSetChanged,
    ContenderRetired,
    PairAdjudicationChecked,
    DecisionContractChecked,
    UnderdeterminationElevated,
    EpistemicExhaustion,
    StopReasonSet,
}

impl AuditEventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SessionInitialized => "SESSION_INITIALIZED",
            Self::PolicyResolved => "POLICY_RESOLVED",
            Self::ContenderSpaceChecked => "CONTENDER_SPACE_CHECKED",
            Self::PolicyCompatibilityChecked => "POLICY_COMPATIBILITY_CHECKED",
            Self::MeceCertificateChecked => "MECE_CERTIFICATE_CHECKED",
            Self::MeceViolation => "MECE_VIOLATION",
            Self::LedgerCorrected => "LEDGER_CORRECTED",
            Self::SearchExecuted => "SEARCH_EXECUTED",
            Self::OpExecuted => "OP_EXECUTED",
            Self::RootScoped => "ROOT_SCOPED",
            Self::RootScopingFailed => "ROOT_SCOPING_FAILED",
            Self::SlotMaterialized => "SLOT_MATERIALIZED",
            Self::NodeDecomposed => "NODE_DECOMPOSED",
            Self::NodeEvaluated => "NODE_EVALUATED",
            Self::NodePropagated => "NODE_PROPAGATED",
            Self::PairEvidenceRecorded => "PAIR_EVIDENCE_RECORDED",
            Self::LedgerUpdated => "LEDGER_UPDATED",
            Self::ResidualsRecomputed => "RESIDUALS_RECOMPUTED",
            Self::ActiveSetChanged => "ACTIVE_SET_CHANGED",
            Self::ContenderRetired => "CONTENDER_RETIRED",
            Self::PairAdjudicationChecked => "PAIR_ADJUDICATION_CHECKED",
            Self::DecisionContractChecked => "DECISION_CONTRACT_CHECKED",
            Self::UnderdeterminationElevated => "UNDERDETERMINATION_ELEVATED",
            Self::EpistemicExhaustion => "EPISTEMIC_EXHAUSTION",
            Self::StopReasonSet => "STOP_REASON_SET",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ordered audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Zero-based position in the session's trail.
    pub seq: u64,
    pub event_type: AuditEventType,
    pub payload: serde_json::Value,
}

/// In-memory trail owned by a session. Doubles as an [`AuditSink`] that
/// collects events forwarded from elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    events: Vec<AuditEvent>,
}

impl AuditLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new event with the next sequence number.
    pub fn record(&mut self, event_type: AuditEventType, payload: serde_json::Value) -> &AuditEvent {
        let seq = self.events.len() as u64;
        self.events.push(AuditEvent {
            seq,
            event_type,
            payload,
        });
        &self.events[self.events.len() - 1]
    }

    #[must_use]
    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    #[must_use]
    pub fn into_events(self) -> Vec<AuditEvent> {
        self.events
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn of_type(&self, event_type: AuditEventType) -> impl Iterator<Item = &AuditEvent> {
        self.events
            .iter()
            .filter(move |event| event.event_type == event_type)
    }

    /// SHA-256 over the serialized trail.
    #[must_use]
    pub fn digest(&self) -> String {
        trace_digest(&self.events)
    }
}

impl AuditSink for AuditLog {
    fn append(&mut self, event: &AuditEvent) -> Result<()> {
        self.events.push(event.clone());
        Ok(())
    }
}

/// SHA-256 over a serialized trail.
#[must_use]
pub fn trace_digest(events: &[AuditEvent]) -> String {
    let bytes = serde_json::to_vec(events).unwrap_or_default();
    digest_hex(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sequence_numbers_are_dense() {
        let mut log = AuditLog::new();
        log.record(AuditEventType::SessionInitialized, json!({}));
        let seq = log.record(AuditEventType::OpExecuted, json!({"index": 0})).seq;
        assert_eq!(seq, 1);
        assert_eq!(log.of_type(AuditEventType::OpExecuted).count(), 1);
    }

    #[test]
    fn event_types_serialize_screaming_snake() {
        let text = serde_json::to_string(&AuditEventType::MeceCertificateChecked).expect("serializes");
        assert_eq!(text, "\"MECE_CERTIFICATE_CHECKED\"");
        assert_eq!(AuditEventType::StopReasonSet.to_string(), "STOP_REASON_SET");
    }

    #[test]
    fn digest_changes_with_content() {
        let mut a = AuditLog::new();
        a.record(AuditEventType::OpExecuted, json!({"p": 0.5}));
        let mut b = AuditLog::new();
        b.record(AuditEventType::OpExecuted, json!({"p": 0.6}));
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest(), a.clone().digest());
    }
}
