//! abductio: an auditable, budget-constrained abductive-reasoning engine.
//!
//! A session takes named candidate explanations ("roots"), spends a fixed
//! credit budget deciding whether to refine or test obligations under each
//! root, keeps a probability ledger over the roots plus two open-world
//! residuals, and stops under a closed set of conditions. Every step is
//! recorded in an append-only audit trail that replays deterministically.

pub mod audit;
pub mod batch;
#[cfg(feature = "cli")]
pub mod cli_app;
pub mod confidence;
pub mod core;
pub mod gates;
pub mod ledger;
pub mod logger;
pub mod ports;
pub mod result;
pub mod scheduler;
pub mod tree;

#[cfg(test)]
mod session_invariant_tests;

pub use audit::replay::replay;
pub use audit::{AuditEvent, AuditEventType, AuditLog};
pub use crate::core::config::{RootSpec, SessionConfig, SessionSpec};
pub use crate::core::errors::{AbxError, Result};
pub use crate::core::policy::{Policy, PolicyProfile};
pub use ports::{AuditSink, Decomposer, Evaluator, Searcher, SessionPorts};
pub use result::{SessionResult, StopReason};
pub use scheduler::{Session, run_session};
