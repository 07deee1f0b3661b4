//! Thread-safe audit sink shared by concurrent sessions.
//!
//! Each clone carries its own session label; the inner sink sees whole
//! events under one lock, so per-session order is preserved even when
//! sessions interleave.

use std::sync::Arc;

use parking_lot::Mutex;

use super::Envelope;
use crate::audit::AuditEvent;
use crate::core::errors::Result;
use crate::ports::AuditSink;

/// A sink that records which session each event belongs to.
pub trait LabeledSink: Send {
    fn append_labeled(&mut self, session: &str, event: &AuditEvent) -> Result<()>;
}

/// In-memory collection of envelopes.
impl LabeledSink for Vec<Envelope> {
    fn append_labeled(&mut self, session: &str, event: &AuditEvent) -> Result<()> {
        self.push(Envelope::wrap(session, event));
        Ok(())
    }
}

/// Cloneable handle onto one labeled sink.
#[derive(Debug)]
pub struct SharedAuditSink<S> {
    inner: Arc<Mutex<S>>,
    session: String,
}

impl<S> Clone for SharedAuditSink<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            session: self.session.clone(),
        }
    }
}

impl<S: LabeledSink> SharedAuditSink<S> {
    pub fn new(sink: S, session: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sink)),
            session: session.to_string(),
        }
    }

    /// Handle onto the same sink under another session label.
    #[must_use]
    pub fn for_session(&self, session: &str) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            session: session.to_string(),
        }
    }

    #[must_use]
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Run `f` with the inner sink locked.
    pub fn with_inner<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl<S: LabeledSink> AuditSink for SharedAuditSink<S> {
    fn append(&mut self, event: &AuditEvent) -> Result<()> {
        self.inner.lock().append_labeled(&self.session, event)
    }
}
