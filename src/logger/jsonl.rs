//! Append-only JSONL audit sink and the matching trace reader.
//!
//! One envelope per line. Lines are flushed as they are written so a crashed
//! process leaves a readable prefix; a torn final line is skipped on read.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memchr::memchr_iter;

use super::Envelope;
use super::shared::LabeledSink;
use crate::audit::AuditEvent;
use crate::core::errors::{AbxError, Result};
use crate::ports::AuditSink;

/// Appends every event to a JSONL file.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    session: String,
    writer: BufWriter<File>,
    written: u64,
}

impl JsonlAuditSink {
    /// Open `path` for appending, creating it and its parent directory.
    pub fn open(path: &Path, session: &str) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| AbxError::io(parent, err))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| AbxError::io(path, err))?;
        Ok(Self {
            path: path.to_path_buf(),
            session: session.to_string(),
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Events written through this handle.
    #[must_use]
    pub const fn written(&self) -> u64 {
        self.written
    }

    fn write_envelope(&mut self, envelope: &Envelope) -> Result<()> {
        let mut line = serde_json::to_vec(envelope).map_err(|err| AbxError::Serialization {
            context: "jsonl envelope",
            details: err.to_string(),
        })?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .and_then(|()| self.writer.flush())
            .map_err(|err| AbxError::io(&self.path, err))?;
        self.written += 1;
        Ok(())
    }
}

impl AuditSink for JsonlAuditSink {
    fn append(&mut self, event: &AuditEvent) -> Result<()> {
        let envelope = Envelope::wrap(&self.session, event);
        self.write_envelope(&envelope)
    }
}

impl LabeledSink for JsonlAuditSink {
    fn append_labeled(&mut self, session: &str, event: &AuditEvent) -> Result<()> {
        let envelope = Envelope::wrap(session, event);
        self.write_envelope(&envelope)
    }
}

/// Parse every complete envelope line of a JSONL buffer.
pub fn parse_envelopes(bytes: &[u8]) -> Result<Vec<Envelope>> {
    let mut envelopes = Vec::new();
    let mut start = 0;
    for (line_no, end) in memchr_iter(b'\n', bytes).enumerate() {
        let line = bytes[start..end].trim_ascii();
        start = end + 1;
        if line.is_empty() {
            continue;
        }
        let envelope = serde_json::from_slice(line).map_err(|err| AbxError::Serialization {
            context: "jsonl trace",
            details: format!("line {}: {err}", line_no + 1),
        })?;
        envelopes.push(envelope);
    }
    Ok(envelopes)
}

/// Read one session's trail from a JSONL file, in sequence order.
///
/// With `session = None` the session of the first envelope is used, so a
/// single-session file reads back without knowing its label.
pub fn read_trace(path: &Path, session: Option<&str>) -> Result<Vec<AuditEvent>> {
    let bytes = std::fs::read(path).map_err(|err| AbxError::io(path, err))?;
    let envelopes = parse_envelopes(&bytes)?;
    let Some(label) = session
        .map(str::to_string)
        .or_else(|| envelopes.first().map(|e| e.session.clone()))
    else {
        return Ok(Vec::new());
    };
    let mut events: Vec<AuditEvent> = envelopes
        .into_iter()
        .filter(|envelope| envelope.session == label)
        .map(Envelope::into_event)
        .collect();
    events.sort_by_key(|event| event.seq);
    Ok(events)
}
