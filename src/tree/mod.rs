//! Per-root reasoning trees: slot obligations and their AND/OR children.

pub mod node;
pub mod obligations;

pub use node::{Coupling, DecompType, Node, NodeArena, NodeRole};
pub use obligations::{ScopingOutcome, aggregate, decompose_node, decompose_root, propagate_from};
