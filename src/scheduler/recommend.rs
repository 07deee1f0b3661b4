//! Epistemic-exhaustion classification and ranked next-step guidance.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::canonical::split_pair_key;
use crate::core::policy::Policy;
use crate::gates::pairs::PairLedger;
use crate::ledger::model::{HypothesisSet, RootStatus};
use crate::scheduler::frontier::{FrontierContext, gap_advancing_op, nec_gaps};
use crate::tree::node::NodeArena;

/// What a caller could do next to move the session forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    /// Spend a credit evaluating the target.
    Evaluate,
    /// Refine the target (root scoping or node split).
    Decompose,
    /// Supply evidence that bears on the target directly.
    GatherEvidence,
    /// Supply evidence that tells the pair's members apart.
    GatherDiscriminator,
    RaiseBudget,
}

impl fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Evaluate => "evaluate",
            Self::Decompose => "decompose",
            Self::GatherEvidence => "gather_evidence",
            Self::GatherDiscriminator => "gather_discriminator",
            Self::RaiseBudget => "raise_budget",
        })
    }
}

/// One ranked next step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// 1-based position after sorting by score.
    pub rank: u32,
    pub root_id: Option<String>,
    /// Node key, `root:slot`, or pair key.
    pub target: String,
    pub action: RecommendedAction,
    pub reason: String,
    pub score: f64,
}

/// NEC gaps remain on some active root and no active root has a legal
/// operation that works on one.
#[must_use]
pub fn is_epistemically_exhausted(
    set: &HypothesisSet,
    arena: &NodeArena,
    ctx: &FrontierContext<'_>,
) -> bool {
    let active = set.active_by_canonical();
    let gaps_remain = active
        .iter()
        .any(|root| !nec_gaps(root, arena, ctx).is_empty());
    gaps_remain
        && active
            .iter()
            .all(|root| gap_advancing_op(root, arena, ctx).is_none())
}

/// Ranked guidance for closing the remaining gaps.
#[must_use]
pub fn recommend(
    set: &HypothesisSet,
    arena: &NodeArena,
    pairs: &PairLedger,
    policy: &Policy,
    ctx: &FrontierContext<'_>,
    credits_remaining: u32,
) -> Vec<Recommendation> {
    let mut out = Vec::new();

    for root in set.active_by_canonical() {
        let mass = set.mass(&root.root_id);
        for slot in nec_gaps(root, arena, ctx) {
            let slot_target = format!("{}:{slot}", root.root_id);
            let node = root.obligations.get(&slot).and_then(|key| arena.get(key));
            let (action, target, k, reason) = match node {
                None if root.scoping_failed => (
                    RecommendedAction::GatherEvidence,
                    root.root_id.clone(),
                    root.k_root,
                    "scoping failed; supply slot statements for this root".to_string(),
                ),
                None => (
                    RecommendedAction::Decompose,
                    if root.status == RootStatus::Scoped {
                        slot_target
                    } else {
                        root.root_id.clone()
                    },
                    root.k_root,
                    format!("slot {slot} has no obligation yet"),
                ),
                Some(node) => match arena.first_unassessed_leaf(&node.node_key) {
                    Some(leaf) => (
                        RecommendedAction::Evaluate,
                        leaf.node_key.clone(),
                        node.k,
                        format!("slot {slot} has unassessed obligations"),
                    ),
                    None if ctx.decomposer_attached
                        && arena.lowest_k_open_leaf(&node.node_key).is_some() =>
                    {
                        (
                            RecommendedAction::Decompose,
                            node.node_key.clone(),
                            node.k,
                            format!("slot {slot} at k={:.2} needs finer obligations", node.k),
                        )
                    }
                    None => (
                        RecommendedAction::GatherEvidence,
                        node.node_key.clone(),
                        node.k,
                        format!(
                            "slot {slot} at k={:.2} below {:.2} with nothing left to test",
                            node.k, ctx.tau_effective
                        ),
                    ),
                },
            };
            out.push(Recommendation {
                rank: 0,
                root_id: Some(root.root_id.clone()),
                target,
                action,
                reason,
                score: mass * (1.0 - k),
            });
        }
    }

    if policy.pair_adjudication.enabled {
        for pair in pairs.unresolved_active(&policy.pair_adjudication) {
            let combined = split_pair_key(&pair)
                .map_or(0.0, |(left, right)| set.mass(left) + set.mass(right));
            let margin = pairs.record(&pair).map_or(0.0, |record| record.margin());
            let reason = match pairs.resolution(&pair, &policy.pair_adjudication) {
                Some(crate::gates::pairs::PairResolution::Unresolved { reason }) => reason,
                _ => "unresolved".to_string(),
            };
            out.push(Recommendation {
                rank: 0,
                root_id: None,
                target: pair,
                action: RecommendedAction::GatherDiscriminator,
                reason,
                score: combined * (1.0 - margin),
            });
        }
    }

    out.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.target.cmp(&b.target))
    });
    if credits_remaining == 0 && !out.is_empty() {
        out.push(Recommendation {
            rank: 0,
            root_id: None,
            target: "credits".to_string(),
            action: RecommendedAction::RaiseBudget,
            reason: "credit budget is spent".to_string(),
            score: 0.0,
        });
    }
    for (idx, rec) in out.iter_mut().enumerate() {
        rec.rank = u32::try_from(idx + 1).unwrap_or(u32::MAX);
    }
    out
}
