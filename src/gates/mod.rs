//! Policy gates that must agree before a confident frontier may close.
//!
//! Gate failures are outcomes, not errors: each check returns a status that
//! steers the stop reason, and each is audited and snapshotted.

pub mod contender;
pub mod contract;
pub mod mece;
pub mod pairs;
pub mod retirement;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of one gate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateStatus {
    Passed,
    Failed,
}

impl GateStatus {
    #[must_use]
    pub const fn from_pass(passed: bool) -> Self {
        if passed { Self::Passed } else { Self::Failed }
    }

    #[must_use]
    pub const fn passed(self) -> bool {
        matches!(self, Self::Passed)
    }
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
        })
    }
}

/// Which gate produced a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    MeceCertificate,
    ContenderSpace,
    PolicyCompatibility,
    PairAdjudication,
    DecisionContract,
}

/// Point-in-time record of one gate outcome, kept in result metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSnapshot {
    pub gate: GateKind,
    pub status: GateStatus,
    /// Operations executed when the gate was checked.
    pub at_operation: u32,
    pub details: serde_json::Value,
}
