//! Operation scheduling: frontier, legal operations, the session loop and
//! next-step guidance.

pub mod frontier;
pub mod recommend;
pub mod session;

pub use frontier::{OpKind, Operation};
pub use recommend::{Recommendation, RecommendedAction};
pub use session::{PortResponse, Session};

use crate::core::config::SessionSpec;
use crate::core::errors::Result;
use crate::ports::SessionPorts;
use crate::result::SessionResult;

/// Build a session from `spec` and run it to a stop reason.
pub fn run_session(spec: SessionSpec, ports: &mut SessionPorts<'_>) -> Result<SessionResult> {
    Session::new(spec)?.run(ports)
}
