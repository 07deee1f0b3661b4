//! Slot obligations: root scoping, node decomposition, AND/OR aggregation and
//! upward propagation.
//!
//! Children keys always extend their parent's key, so walking `parent_of`
//! terminates at the slot node and propagation cannot cycle.

use std::collections::BTreeSet;

use crate::core::canonical::child_id;
use crate::core::config::SlotSpec;
use crate::core::errors::{AbxError, Result};
use crate::ledger::model::{RootHypothesis, RootStatus};
use crate::ports::{NodeDecomposition, ScopingDecomposition};
use crate::tree::node::{Coupling, DecompType, Node, NodeArena, NodeRole, parent_of};

/// `k_root` cap after a failed scoping, and the cap when a child is UNSCOPED.
pub const UNSCOPED_CAP: f64 = 0.40;
/// Cap when a contributing child carries the rubric guardrail.
pub const GUARDRAIL_PROPAGATION_CAP: f64 = 0.55;

const CHANGE_TOLERANCE: f64 = 1e-15;

/// What a scoping decomposition did to a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopingOutcome {
    /// Root is SCOPED; lists slot node keys created now.
    Scoped { created: Vec<String> },
    /// Scoping failed; `k_root` capped and the root stays UNSCOPED.
    Capped,
}

/// Default statement of a slot whose decomposer gave none.
#[must_use]
pub fn default_slot_statement(slot: &str, root_statement: &str) -> String {
    format!("{slot}: {root_statement}")
}

/// Apply a scoping decomposition to a root.
///
/// Slots the decomposer named get its statement. When the decomposer named
/// none, every slot gets the default statement. When it named some, the rest
/// stay missing until a later slot decomposition materializes them.
pub fn decompose_root(
    root: &mut RootHypothesis,
    arena: &mut NodeArena,
    slots: &[SlotSpec],
    scoping: &ScopingDecomposition,
) -> ScopingOutcome {
    if !scoping.ok {
        root.k_root = root.k_root.min(UNSCOPED_CAP);
        root.scoping_failed = true;
        return ScopingOutcome::Capped;
    }

    let partial = slots
        .iter()
        .any(|slot| scoping.statement_for(&slot.key).is_some());
    let mut created = Vec::new();
    for slot in slots {
        let statement = match scoping.statement_for(&slot.key) {
            Some(text) => text.trim().to_string(),
            None if partial => continue,
            None => default_slot_statement(&slot.key, &root.statement),
        };
        if let Some(key) = attach_slot(root, arena, slot, statement) {
            created.push(key);
        }
    }
    root.status = RootStatus::Scoped;
    refresh_root_k(root, arena, slots);
    ScopingOutcome::Scoped { created }
}

/// Materialize one missing slot obligation. Returns the slot node key, or
/// `None` when the obligation already exists.
pub fn materialize_slot(
    root: &mut RootHypothesis,
    arena: &mut NodeArena,
    slots: &[SlotSpec],
    slot: &SlotSpec,
    scoping: &ScopingDecomposition,
) -> Option<String> {
    let statement = scoping.statement_for(&slot.key).map_or_else(
        || default_slot_statement(&slot.key, &root.statement),
        |text| text.trim().to_string(),
    );
    let key = attach_slot(root, arena, slot, statement)?;
    refresh_root_k(root, arena, slots);
    Some(key)
}

fn attach_slot(
    root: &mut RootHypothesis,
    arena: &mut NodeArena,
    slot: &SlotSpec,
    statement: String,
) -> Option<String> {
    if root.obligations.contains_key(&slot.key) {
        return None;
    }
    let key = format!("{}:{}", root.root_id, slot.key);
    arena.insert(Node::new(key.clone(), statement, slot.role));
    root.obligations.insert(slot.key.clone(), key.clone());
    Some(key)
}

/// Apply a node decomposition. Returns `true` when children were attached.
///
/// A node that already has a `decomp_type` is left alone. A decomposition
/// yielding no usable children turns the node into a terminal `NONE` leaf.
pub fn decompose_node(
    arena: &mut NodeArena,
    node_key: &str,
    decomposition: &NodeDecomposition,
) -> Result<bool> {
    let node = arena.get(node_key).ok_or_else(|| AbxError::Runtime {
        details: format!("decompose target {node_key} is not in the arena"),
    })?;
    if node.decomp_type.is_some() {
        return Ok(false);
    }

    let mut children = Vec::new();
    let mut seen = BTreeSet::new();
    if decomposition.ok && decomposition.decomp_type != Some(DecompType::None) {
        for spec in &decomposition.children {
            let statement = if spec.statement.trim().is_empty() {
                spec.child_id.trim()
            } else {
                spec.statement.trim()
            };
            if statement.is_empty() {
                continue;
            }
            let id = child_id(statement);
            if !seen.insert(id.clone()) {
                continue;
            }
            children.push(Node::new(
                format!("{node_key}:{id}"),
                statement.to_string(),
                NodeRole::parse_lenient(spec.role.as_deref()),
            ));
        }
    }

    let Some(node) = arena.get_mut(node_key) else {
        return Ok(false);
    };
    if children.is_empty() {
        node.decomp_type = Some(DecompType::None);
        return Ok(false);
    }
    let kind = decomposition.decomp_type.unwrap_or(DecompType::And);
    node.decomp_type = Some(kind);
    node.coupling = (kind == DecompType::And).then(|| Coupling::snap(decomposition.coupling));
    node.children = children.iter().map(|child| child.node_key.clone()).collect();
    for child in children {
        arena.insert(child);
    }
    Ok(true)
}

/// Values an internal node takes from its assessed children.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregate {
    pub p: f64,
    pub k: f64,
    pub validity: f64,
    pub guardrail_applied: bool,
}

/// Soft-AND of child probabilities.
#[must_use]
pub fn soft_and(coupling: f64, probabilities: &[f64]) -> f64 {
    if probabilities.is_empty() {
        return 0.5;
    }
    let min = probabilities.iter().copied().fold(f64::INFINITY, f64::min);
    let product: f64 = probabilities.iter().product();
    coupling.mul_add(min, (1.0 - coupling) * product)
}

/// Aggregate an internal node. `None` for leaves and for nodes with no
/// assessed child (their own values stand).
#[must_use]
pub fn aggregate(arena: &NodeArena, node_key: &str) -> Option<Aggregate> {
    let node = arena.get(node_key)?;
    if !node.is_internal() {
        return None;
    }
    let children: Vec<&Node> = node
        .children
        .iter()
        .filter_map(|key| arena.get(key))
        .collect();
    let assessed: Vec<&Node> = children.iter().copied().filter(|c| c.assessed).collect();
    if assessed.is_empty() {
        return None;
    }

    let (p, contributing): (f64, Vec<&Node>) = match node.decomp_type {
        Some(DecompType::Or) => {
            let decisive = assessed
                .iter()
                .copied()
                .max_by(|a, b| a.p.total_cmp(&b.p).then_with(|| b.node_key.cmp(&a.node_key)))?;
            (decisive.p, vec![decisive])
        }
        _ => {
            let coupling = node.coupling.unwrap_or(Coupling::Tight).value();
            let probabilities: Vec<f64> = assessed.iter().map(|c| c.p).collect();
            (soft_and(coupling, &probabilities), assessed.clone())
        }
    };

    let mut k = contributing.iter().map(|c| c.k).fold(f64::INFINITY, f64::min);
    let validity = contributing
        .iter()
        .map(|c| c.validity)
        .fold(f64::INFINITY, f64::min);
    let guardrail_applied = contributing.iter().any(|c| c.guardrail_applied);
    if guardrail_applied {
        k = k.min(GUARDRAIL_PROPAGATION_CAP);
    }
    if children.iter().any(|c| c.role == NodeRole::Unscoped) {
        k = k.min(UNSCOPED_CAP);
    }

    Some(Aggregate {
        p: p.clamp(0.0, 1.0),
        k: k.clamp(0.0, 1.0),
        validity: validity.clamp(0.0, 1.0),
        guardrail_applied,
    })
}

/// Re-aggregate the ancestors of `node_key` until nothing changes. Returns
/// the keys whose values changed, nearest first.
pub fn propagate_from(arena: &mut NodeArena, node_key: &str) -> Vec<String> {
    let mut changed = Vec::new();
    let mut cursor = parent_of(node_key).map(str::to_string);
    while let Some(key) = cursor {
        let Some(update) = aggregate(arena, &key) else {
            break;
        };
        let Some(node) = arena.get_mut(&key) else {
            break;
        };
        let same = node.assessed
            && (node.p - update.p).abs() <= CHANGE_TOLERANCE
            && (node.k - update.k).abs() <= CHANGE_TOLERANCE
            && (node.validity - update.validity).abs() <= CHANGE_TOLERANCE
            && node.guardrail_applied == update.guardrail_applied;
        if same {
            break;
        }
        node.p = update.p;
        node.k = update.k;
        node.validity = update.validity;
        node.guardrail_applied = update.guardrail_applied;
        node.assessed = true;
        changed.push(key.clone());
        cursor = parent_of(&key).map(str::to_string);
    }
    changed
}

/// `k_root` = min k over existing NEC slot nodes (all slots if none is
/// NEC). A failed scoping keeps its cap.
pub fn refresh_root_k(root: &mut RootHypothesis, arena: &NodeArena, slots: &[SlotSpec]) {
    let slot_k = |role: Option<NodeRole>| {
        slots
            .iter()
            .filter(|slot| role.is_none_or(|r| slot.role == r))
            .filter_map(|slot| root.obligations.get(&slot.key))
            .filter_map(|key| arena.get(key))
            .map(|node| node.k)
            .fold(None, |acc: Option<f64>, k| Some(acc.map_or(k, |a| a.min(k))))
    };
    if let Some(k) = slot_k(Some(NodeRole::Nec)).or_else(|| slot_k(None)) {
        root.k_root = if root.scoping_failed { k.min(UNSCOPED_CAP) } else { k };
    }
}
