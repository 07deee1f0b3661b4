//! Frontier, legal operations and value-of-information selection.
//!
//! All orderings are total: ties fall back to canonical id, then target key,
//! so the same state always yields the same operation.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::core::config::{SessionConfig, SlotSpec};
use crate::ledger::model::{HypothesisSet, RootHypothesis, RootStatus};
use crate::ports::OpPurpose;
use crate::tree::node::{DEFAULT_P, Node, NodeArena, NodeRole, slot_of};

/// What an operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpKind {
    /// Scope an UNSCOPED root into its required slots.
    DecomposeRoot,
    /// Materialize one missing slot obligation.
    DecomposeSlot,
    /// Split an assessed, low-confidence node.
    DecomposeNode,
    Evaluate,
}

impl OpKind {
    /// Root scoping and slot materialization.
    #[must_use]
    pub const fn is_scoping(self) -> bool {
        matches!(self, Self::DecomposeRoot | Self::DecomposeSlot)
    }
}

/// One schedulable operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    pub root_id: String,
    /// Root id, `root:slot`, or node key.
    pub target: String,
    #[serde(default)]
    pub purpose: OpPurpose,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair: Option<String>,
}

impl Operation {
    fn new(kind: OpKind, root_id: &str, target: &str) -> Self {
        Self {
            kind,
            root_id: root_id.to_string(),
            target: target.to_string(),
            purpose: OpPurpose::Standard,
            pair: None,
        }
    }

    /// Same operation, pre-empted for a purpose.
    #[must_use]
    pub fn with_purpose(mut self, purpose: OpPurpose, pair: Option<String>) -> Self {
        self.purpose = purpose;
        self.pair = pair;
        self
    }
}

/// Session facts the legal-op rules depend on.
#[derive(Debug, Clone, Copy)]
pub struct FrontierContext<'a> {
    pub config: &'a SessionConfig,
    pub tau_effective: f64,
    pub decomposer_attached: bool,
}

// ──────────────────── scores ────────────────────

/// `(p(1−p) + λ/(credits_spent+1))·(1−k_root)`.
#[must_use]
pub fn priority(p: f64, k_root: f64, credits_spent: u32, lambda: f64) -> f64 {
    let exploration = lambda / f64::from(credits_spent.saturating_add(1));
    p.mul_add(1.0 - p, exploration) * (1.0 - k_root)
}

/// Binary entropy in bits.
#[must_use]
pub fn binary_entropy(p: f64) -> f64 {
    if p <= 0.0 || p >= 1.0 {
        return 0.0;
    }
    -(p * p.log2() + (1.0 - p) * (1.0 - p).log2())
}

/// `ledger[root]·(1−k) + λ·H(p)`.
#[must_use]
pub fn voi(mass: f64, k: f64, p: f64, lambda: f64) -> f64 {
    mass.mul_add(1.0 - k, lambda * binary_entropy(p))
}

/// Active roots whose priority is within `epsilon` of the maximum, in
/// canonical-id order.
#[must_use]
pub fn compute_frontier(set: &HypothesisSet, lambda: f64, epsilon: f64) -> Vec<String> {
    let scored: Vec<(&RootHypothesis, f64)> = set
        .active_by_canonical()
        .into_iter()
        .map(|root| {
            let score = priority(set.mass(&root.root_id), root.k_root, root.credits_spent, lambda);
            (root, score)
        })
        .collect();
    let Some(max) = scored.iter().map(|(_, s)| *s).reduce(f64::max) else {
        return Vec::new();
    };
    scored
        .into_iter()
        .filter(|(_, score)| *score >= max - epsilon)
        .map(|(root, _)| root.root_id.clone())
        .collect()
}

// ──────────────────── obligations ────────────────────

/// Existing slot nodes of a root, lowest k first, then configured order.
fn slots_by_k<'a>(
    root: &RootHypothesis,
    arena: &'a NodeArena,
    config: &'a SessionConfig,
) -> Vec<(&'a SlotSpec, &'a Node)> {
    let mut slots: Vec<(usize, &SlotSpec, &Node)> = config
        .required_slots
        .iter()
        .enumerate()
        .filter_map(|(idx, slot)| {
            let key = root.obligations.get(&slot.key)?;
            arena.get(key).map(|node| (idx, slot, node))
        })
        .collect();
    slots.sort_by(|a, b| a.2.k.total_cmp(&b.2.k).then(a.0.cmp(&b.0)));
    slots.into_iter().map(|(_, slot, node)| (slot, node)).collect()
}

fn depth_satisfied(arena: &NodeArena, slot_key: &str, ctx: &FrontierContext<'_>) -> bool {
    let min = usize::try_from(ctx.config.min_decomposition_depth).unwrap_or(usize::MAX);
    !ctx.decomposer_attached
        || arena.subtree_depth(slot_key) >= min
        || arena.lowest_k_open_leaf(slot_key).is_none()
}

/// Required NEC slots that keep the root from closing. Every NEC slot is a
/// gap while the root is unscoped or the obligation is missing.
#[must_use]
pub fn nec_gaps(root: &RootHypothesis, arena: &NodeArena, ctx: &FrontierContext<'_>) -> Vec<String> {
    ctx.config
        .required_slots
        .iter()
        .filter(|slot| slot.role == NodeRole::Nec)
        .filter(|slot| {
            if root.status != RootStatus::Scoped {
                return true;
            }
            let Some(node) = root.obligations.get(&slot.key).and_then(|key| arena.get(key)) else {
                return true;
            };
            !node.assessed
                || node.k < ctx.tau_effective
                || !depth_satisfied(arena, &node.node_key, ctx)
        })
        .map(|slot| slot.key.clone())
        .collect()
}

/// SCOPED with every required NEC slot at `k ≥ τ_effective` and deep enough.
#[must_use]
pub fn root_is_confident(root: &RootHypothesis, arena: &NodeArena, ctx: &FrontierContext<'_>) -> bool {
    root.status == RootStatus::Scoped && nec_gaps(root, arena, ctx).is_empty()
}

/// Next EVALUATE for a root: first unassessed leaf of the lowest-k slot.
#[must_use]
pub fn evaluate_op(
    root: &RootHypothesis,
    arena: &NodeArena,
    ctx: &FrontierContext<'_>,
    nec_only: bool,
) -> Option<Operation> {
    if root.status != RootStatus::Scoped {
        return None;
    }
    slots_by_k(root, arena, ctx.config)
        .into_iter()
        .filter(|(slot, _)| !nec_only || slot.role == NodeRole::Nec)
        .find_map(|(_, node)| arena.first_unassessed_leaf(&node.node_key))
        .map(|leaf| Operation::new(OpKind::Evaluate, &root.root_id, &leaf.node_key))
}

fn legal_op_scoped(
    root: &RootHypothesis,
    arena: &NodeArena,
    ctx: &FrontierContext<'_>,
    nec_only: bool,
) -> Option<Operation> {
    match root.status {
        RootStatus::Unscoped if root.scoping_failed => return None,
        RootStatus::Unscoped => {
            return Some(Operation::new(OpKind::DecomposeRoot, &root.root_id, &root.root_id));
        }
        RootStatus::Scoped => {}
    }
    if let Some(slot) = ctx
        .config
        .required_slots
        .iter()
        .find(|slot| !root.obligations.contains_key(&slot.key))
    {
        let target = format!("{}:{}", root.root_id, slot.key);
        return Some(Operation::new(OpKind::DecomposeSlot, &root.root_id, &target));
    }
    if let Some(op) = evaluate_op(root, arena, ctx, nec_only) {
        return Some(op);
    }
    if !ctx.decomposer_attached {
        return None;
    }
    slots_by_k(root, arena, ctx.config)
        .into_iter()
        .filter(|(slot, _)| slot.role == NodeRole::Nec)
        .filter(|(_, node)| {
            node.k < ctx.tau_effective || !depth_satisfied(arena, &node.node_key, ctx)
        })
        .find_map(|(_, node)| arena.lowest_k_open_leaf(&node.node_key))
        .filter(|leaf| leaf.assessed)
        .map(|leaf| Operation::new(OpKind::DecomposeNode, &root.root_id, &leaf.node_key))
}

/// The single legal next operation for a root.
#[must_use]
pub fn legal_op(root: &RootHypothesis, arena: &NodeArena, ctx: &FrontierContext<'_>) -> Option<Operation> {
    legal_op_scoped(root, arena, ctx, false)
}

/// A legal operation that works on a NEC gap, if any exists.
#[must_use]
pub fn gap_advancing_op(
    root: &RootHypothesis,
    arena: &NodeArena,
    ctx: &FrontierContext<'_>,
) -> Option<Operation> {
    legal_op_scoped(root, arena, ctx, true).filter(|op| {
        op.kind.is_scoping()
            || slot_of(&op.target)
                .and_then(|slot_key| slot_key.split_once(':'))
                .and_then(|(_, slot)| ctx.config.slot(slot))
                .is_some_and(|slot| slot.role == NodeRole::Nec)
    })
}

// ──────────────────── selection ────────────────────

/// A scored operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub op: Operation,
    pub voi: f64,
    pub canonical_id: String,
}

/// Score an operation by VOI using its target's `p` and `k`.
#[must_use]
pub fn score(op: Operation, set: &HypothesisSet, arena: &NodeArena, lambda: f64) -> Candidate {
    let root = set.root(&op.root_id);
    let (p, k) = match op.kind {
        OpKind::Evaluate | OpKind::DecomposeNode => arena
            .get(&op.target)
            .map_or((DEFAULT_P, 0.0), |node| (node.p, node.k)),
        OpKind::DecomposeRoot | OpKind::DecomposeSlot => {
            (DEFAULT_P, root.map_or(0.0, |r| r.k_root))
        }
    };
    Candidate {
        voi: voi(set.mass(&op.root_id), k, p, lambda),
        canonical_id: root.map(|r| r.canonical_id.clone()).unwrap_or_default(),
        op,
    }
}

fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.voi
        .total_cmp(&a.voi)
        .then_with(|| a.canonical_id.cmp(&b.canonical_id))
        .then_with(|| a.op.target.cmp(&b.op.target))
}

/// Pick the best candidate. When it belongs to the root executed last and
/// another root's candidate is within `epsilon`, rotate to that root.
#[must_use]
pub fn select(candidates: &[Candidate], last_root: Option<&str>, epsilon: f64) -> Option<usize> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| rank(&candidates[a], &candidates[b]));
    let best = *order.first()?;
    let Some(last) = last_root else {
        return Some(best);
    };
    if candidates[best].op.root_id != last {
        return Some(best);
    }
    let floor = candidates[best].voi - epsilon;
    order
        .iter()
        .copied()
        .find(|&idx| candidates[idx].op.root_id != last && candidates[idx].voi >= floor)
        .or(Some(best))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RootSpec;
    use crate::ports::ScopingDecomposition;
    use crate::tree::obligations::decompose_root;
    use std::collections::BTreeMap;

    fn scoped_set(config: &SessionConfig) -> (HypothesisSet, NodeArena) {
        let mut set = HypothesisSet::init(
            &[RootSpec::new("H1", "Mechanism A"), RootSpec::new("H2", "Mechanism B")],
            config,
        )
        .expect("init");
        let mut arena = NodeArena::new();
        let root = set.root_mut("H1").expect("root");
        decompose_root(
            root,
            &mut arena,
            &config.required_slots,
            &ScopingDecomposition {
                ok: true,
                slot_statements: BTreeMap::new(),
            },
        );
        (set, arena)
    }

    fn ctx(config: &SessionConfig, decomposer: bool) -> FrontierContext<'_> {
        FrontierContext {
            config,
            tau_effective: config.tau,
            decomposer_attached: decomposer,
        }
    }

    #[test]
    fn priority_and_entropy() {
        assert!((binary_entropy(0.5) - 1.0).abs() < 1e-12);
        assert!(binary_entropy(1.0).abs() < f64::EPSILON);
        let fresh = priority(0.4, 0.15, 0, 0.1);
        assert!((fresh - (0.24 + 0.1) * 0.85).abs() < 1e-12);
        assert!(priority(0.4, 0.15, 5, 0.1) < fresh);
    }

    #[test]
    fn frontier_keeps_near_ties_in_canonical_order() {
        let config = SessionConfig::default();
        let (set, _) = scoped_set(&config);
        let frontier = compute_frontier(&set, config.lambda_voi, config.epsilon);
        assert_eq!(frontier.len(), 2);
        let first = set.root(&frontier[0]).expect("root");
        let second = set.root(&frontier[1]).expect("root");
        assert!(first.canonical_id < second.canonical_id);
    }

    #[test]
    fn legal_ops_follow_scoping_then_evaluation() {
        let config = SessionConfig::default();
        let (set, mut arena) = scoped_set(&config);
        let context = ctx(&config, false);
        let unscoped = legal_op(set.root("H2").expect("root"), &arena, &context).expect("op");
        assert_eq!(unscoped.kind, OpKind::DecomposeRoot);

        let h1 = set.root("H1").expect("root");
        let first = legal_op(h1, &arena, &context).expect("op");
        assert_eq!(first.kind, OpKind::Evaluate);
        assert_eq!(first.target, "H1:feasibility");

        if let Some(node) = arena.get_mut("H1:feasibility") {
            node.assessed = true;
            node.k = 0.9;
        }
        let next = legal_op(h1, &arena, &context).expect("op");
        assert_eq!(next.target, "H1:availability");
    }

    #[test]
    fn low_confidence_nodes_are_decomposed_only_with_a_decomposer() {
        let config = SessionConfig::default();
        let (set, mut arena) = scoped_set(&config);
        for slot in &config.required_slots {
            let node = arena.get_mut(&format!("H1:{}", slot.key)).expect("slot");
            node.assessed = true;
            node.k = 0.9;
        }
        if let Some(node) = arena.get_mut("H1:fit_to_key_features") {
            node.k = 0.35;
        }
        let h1 = set.root("H1").expect("root");
        assert!(legal_op(h1, &arena, &ctx(&config, false)).is_none());
        assert_eq!(nec_gaps(h1, &arena, &ctx(&config, false)), vec!["fit_to_key_features"]);
        let op = legal_op(h1, &arena, &ctx(&config, true)).expect("decompose");
        assert_eq!(op.kind, OpKind::DecomposeNode);
        assert_eq!(op.target, "H1:fit_to_key_features");
        assert!(gap_advancing_op(h1, &arena, &ctx(&config, true)).is_some());
    }

    #[test]
    fn failed_scoping_has_no_legal_op() {
        let config = SessionConfig::default();
        let (mut set, arena) = scoped_set(&config);
        if let Some(root) = set.root_mut("H2") {
            root.scoping_failed = true;
        }
        assert!(legal_op(set.root("H2").expect("root"), &arena, &ctx(&config, true)).is_none());
    }

    #[test]
    fn selection_rotates_among_near_ties() {
        let candidate = |root: &str, voi: f64| Candidate {
            op: Operation::new(OpKind::Evaluate, root, &format!("{root}:s")),
            voi,
            canonical_id: format!("cid-{root}"),
        };
        let candidates = vec![candidate("H1", 0.50), candidate("H2", 0.48), candidate("H3", 0.10)];
        assert_eq!(select(&candidates, None, 0.05), Some(0));
        assert_eq!(select(&candidates, Some("H1"), 0.05), Some(1));
        assert_eq!(select(&candidates, Some("H1"), 0.01), Some(0));
        assert_eq!(select(&[], None, 0.05), None);
    }
}
