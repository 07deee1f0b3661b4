//! Persistent audit sinks: append-only JSONL, SQLite (WAL), and a shared
//! wrapper that lets concurrent sessions write to one sink.

pub mod jsonl;
pub mod shared;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditEvent, AuditEventType};

pub use jsonl::{JsonlAuditSink, read_trace};
pub use shared::{LabeledSink, SharedAuditSink};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteAuditSink;

/// One persisted audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// RFC 3339 write time; informational only, never replayed.
    pub ts: String,
    pub session: String,
    pub seq: u64,
    pub event_type: AuditEventType,
    pub payload: serde_json::Value,
}

impl Envelope {
    #[must_use]
    pub fn wrap(session: &str, event: &AuditEvent) -> Self {
        Self::wrap_at(Utc::now(), session, event)
    }

    #[must_use]
    pub fn wrap_at(at: DateTime<Utc>, session: &str, event: &AuditEvent) -> Self {
        Self {
            ts: at.to_rfc3339_opts(SecondsFormat::Millis, true),
            session: session.to_string(),
            seq: event.seq,
            event_type: event.event_type,
            payload: event.payload.clone(),
        }
    }

    #[must_use]
    pub fn into_event(self) -> AuditEvent {
        AuditEvent {
            seq: self.seq,
            event_type: self.event_type,
            payload: self.payload,
        }
    }
}
