//! SQLite audit sink (WAL mode).

use std::path::Path;

use rusqlite::{Connection, params};

use super::Envelope;
use super::shared::LabeledSink;
use crate::audit::{AuditEvent, AuditEventType};
use crate::core::errors::{AbxError, Result};
use crate::ports::AuditSink;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS audit_events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    ts         TEXT    NOT NULL,
    session    TEXT    NOT NULL,
    seq        INTEGER NOT NULL,
    event_type TEXT    NOT NULL,
    payload    TEXT    NOT NULL,
    UNIQUE (session, seq)
);
CREATE INDEX IF NOT EXISTS idx_audit_session ON audit_events (session, seq);
";

/// Writes every event as one row of `audit_events`.
#[derive(Debug)]
pub struct SqliteAuditSink {
    conn: Connection,
    session: String,
}

impl SqliteAuditSink {
    /// Open (or create) a database file and apply the schema.
    pub fn open(path: &Path, session: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::with_connection(conn, session)
    }

    /// In-memory database, for tests and dry runs.
    pub fn in_memory(session: &str) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, session)
    }

    fn with_connection(conn: Connection, session: &str) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            session: session.to_string(),
        })
    }

    fn insert(&self, envelope: &Envelope) -> Result<()> {
        let payload = serde_json::to_string(&envelope.payload)?;
        let seq = i64::try_from(envelope.seq).map_err(|_| AbxError::Sql {
            context: "audit insert",
            details: format!("seq {} out of range", envelope.seq),
        })?;
        self.conn.execute(
            "INSERT INTO audit_events (ts, session, seq, event_type, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                envelope.ts,
                envelope.session,
                seq,
                envelope.event_type.as_str(),
                payload
            ],
        )?;
        Ok(())
    }

    /// One session's events in sequence order.
    pub fn read_session(&self, session: &str) -> Result<Vec<AuditEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, event_type, payload FROM audit_events
             WHERE session = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![session], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (seq, event_type, payload) = row?;
            let event_type: AuditEventType =
                serde_json::from_value(serde_json::Value::String(event_type))?;
            events.push(AuditEvent {
                seq: u64::try_from(seq).unwrap_or_default(),
                event_type,
                payload: serde_json::from_str(&payload)?,
            });
        }
        Ok(events)
    }

    /// Number of stored events across all sessions.
    pub fn count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM audit_events", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

impl AuditSink for SqliteAuditSink {
    fn append(&mut self, event: &AuditEvent) -> Result<()> {
        self.insert(&Envelope::wrap(&self.session, event))
    }
}

impl LabeledSink for SqliteAuditSink {
    fn append_labeled(&mut self, session: &str, event: &AuditEvent) -> Result<()> {
        self.insert(&Envelope::wrap(session, event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rows_read_back_in_order() {
        let mut sink = SqliteAuditSink::in_memory("s1").expect("db");
        for (seq, kind) in [
            (0, AuditEventType::SessionInitialized),
            (1, AuditEventType::OpExecuted),
            (2, AuditEventType::StopReasonSet),
        ] {
            let event = AuditEvent {
                seq,
                event_type: kind,
                payload: json!({ "n": seq }),
            };
            sink.append(&event).expect("append");
        }
        let events = sink.read_session("s1").expect("read");
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].event_type, AuditEventType::StopReasonSet);
        assert_eq!(events[1].payload["n"], 1);
        assert_eq!(sink.count().expect("count"), 3);
        assert!(sink.read_session("other").expect("read").is_empty());
    }

    #[test]
    fn duplicate_sequence_is_rejected() {
        let mut sink = SqliteAuditSink::in_memory("s1").expect("db");
        let event = AuditEvent {
            seq: 0,
            event_type: AuditEventType::OpExecuted,
            payload: json!({}),
        };
        sink.append(&event).expect("append");
        assert_eq!(sink.append(&event).unwrap_err().code(), "ABX-2102");
    }

    #[test]
    fn file_database_uses_wal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = SqliteAuditSink::open(&dir.path().join("audit.db"), "s1").expect("db");
        let mode: String = sink
            .conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .expect("pragma");
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
