//! Probability ledger over named roots and the open-world residuals.

pub mod abstention;
pub mod model;
pub mod updater;

pub use abstention::{AbstentionSignals, abstention_floor};
pub use model::{HypothesisSet, InvariantReport, RootHypothesis, RootStatus};
pub use updater::{LedgerUpdate, LedgerUpdater, ResidualUpdate, UpdateSignal};
