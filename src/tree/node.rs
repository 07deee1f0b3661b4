//! Node arena for slot obligations and their recursive decompositions.
//!
//! Nodes reference children by hierarchical key (`root:slot:child`), never
//! by pointer, so the tree has no ownership cycles.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ports::{Entailment, EvidenceQuality};

/// Probability of a node before its first assessment.
pub const DEFAULT_P: f64 = 0.5;
/// Confidence of a node before its first assessment.
pub const DEFAULT_K: f64 = 0.15;

/// Role of a node within its parent obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeRole {
    /// Necessary condition; gates root confidence.
    Nec,
    /// Evidential support; informative but not gating.
    Evid,
    /// Decomposer supplied no usable role.
    Unscoped,
}

impl NodeRole {
    /// Lenient parse used for decomposer output.
    #[must_use]
    pub fn parse_lenient(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_uppercase()) {
            Some(v) if v == "NEC" => Self::Nec,
            Some(v) if v == "EVID" => Self::Evid,
            _ => Self::Unscoped,
        }
    }
}

/// Aggregation type of a decomposed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecompType {
    And,
    Or,
    /// Terminal leaf: decomposition was attempted and produced nothing.
    None,
}

impl fmt::Display for DecompType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::And => "AND",
            Self::Or => "OR",
            Self::None => "NONE",
        })
    }
}

/// Allowed soft-AND coupling buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coupling {
    Loose,
    Moderate,
    Tight,
    Strict,
}

impl Coupling {
    const BUCKETS: [(Self, f64); 4] = [
        (Self::Loose, 0.20),
        (Self::Moderate, 0.50),
        (Self::Tight, 0.80),
        (Self::Strict, 0.95),
    ];

    /// Numeric coupling weight `c` of the soft-AND.
    #[must_use]
    pub const fn value(self) -> f64 {
        match self {
            Self::Loose => 0.20,
            Self::Moderate => 0.50,
            Self::Tight => 0.80,
            Self::Strict => 0.95,
        }
    }

    /// Snap a raw coupling to the nearest bucket; missing or non-finite
    /// values map to [`Coupling::Tight`].
    #[must_use]
    pub fn snap(raw: Option<f64>) -> Self {
        let Some(raw) = raw.filter(|value| value.is_finite()) else {
            return Self::Tight;
        };
        let mut best = Self::Tight;
        let mut best_distance = f64::INFINITY;
        for (bucket, value) in Self::BUCKETS {
            let distance = (raw - value).abs();
            if distance < best_distance {
                best = bucket;
                best_distance = distance;
            }
        }
        best
    }
}

/// One obligation or sub-claim in the reasoning tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_key: String,
    pub statement: String,
    pub role: NodeRole,
    pub p: f64,
    pub k: f64,
    pub assessed: bool,
    pub children: Vec<String>,
    pub decomp_type: Option<DecompType>,
    pub coupling: Option<Coupling>,
    pub validity: f64,
    pub guardrail_applied: bool,
    /// Set by a direct evaluation; propagated values leave it untouched.
    pub evidence_ids: Vec<String>,
    pub entailment: Option<Entailment>,
    pub evidence_quality: Option<EvidenceQuality>,
    pub reasoning_summary: String,
    pub defeaters: Vec<String>,
}

impl Node {
    /// Fresh, unassessed node.
    #[must_use]
    pub fn new(node_key: String, statement: String, role: NodeRole) -> Self {
        Self {
            node_key,
            statement,
            role,
            p: DEFAULT_P,
            k: DEFAULT_K,
            assessed: false,
            children: Vec::new(),
            decomp_type: None,
            coupling: None,
            validity: 1.0,
            guardrail_applied: false,
            evidence_ids: Vec::new(),
            entailment: None,
            evidence_quality: None,
            reasoning_summary: String::new(),
            defeaters: Vec::new(),
        }
    }

    /// Root id prefix of this node's key.
    #[must_use]
    pub fn root_id(&self) -> &str {
        root_of(&self.node_key)
    }

    /// Whether the node has live children to aggregate.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(self.decomp_type, Some(DecompType::And | DecompType::Or))
            && !self.children.is_empty()
    }
}

/// Root id prefix of a node key.
#[must_use]
pub fn root_of(node_key: &str) -> &str {
    node_key.split(':').next().unwrap_or(node_key)
}

/// Parent key, or `None` for slot nodes (whose parent is the root itself).
#[must_use]
pub fn parent_of(node_key: &str) -> Option<&str> {
    let (parent, _) = node_key.rsplit_once(':')?;
    parent.contains(':').then_some(parent)
}

/// Slot key prefix (`root:slot`) of any node key below a root.
#[must_use]
pub fn slot_of(node_key: &str) -> Option<&str> {
    let mut cuts = node_key.match_indices(':').map(|(idx, _)| idx);
    let _first = cuts.next()?;
    match cuts.next() {
        Some(second) => Some(&node_key[..second]),
        None => Some(node_key),
    }
}

/// Depth below the slot node (slot = 0).
#[must_use]
pub fn depth_of(node_key: &str) -> usize {
    node_key.matches(':').count().saturating_sub(1)
}

/// Arena of nodes keyed by node key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeArena {
    nodes: BTreeMap<String, Node>,
}

impl NodeArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Node> {
        self.nodes.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.nodes.get_mut(key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    /// Insert a node unless its key already exists. Returns whether inserted.
    pub fn insert(&mut self, node: Node) -> bool {
        if self.nodes.contains_key(&node.node_key) {
            return false;
        }
        self.nodes.insert(node.node_key.clone(), node);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Snapshot of the arena as an ordered map.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, Node> {
        self.nodes.clone()
    }

    /// Deepest decomposition level reached below `slot_key`.
    #[must_use]
    pub fn subtree_depth(&self, slot_key: &str) -> usize {
        let base = depth_of(slot_key);
        let prefix = format!("{slot_key}:");
        self.nodes
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .map(|key| depth_of(key) - base)
            .max()
            .unwrap_or(0)
    }

    /// First unassessed leaf below (or at) `key`, depth-first in child order.
    #[must_use]
    pub fn first_unassessed_leaf(&self, key: &str) -> Option<&Node> {
        let node = self.nodes.get(key)?;
        if node.is_internal() {
            node.children
                .iter()
                .find_map(|child| self.first_unassessed_leaf(child))
        } else if node.assessed {
            None
        } else {
            Some(node)
        }
    }

    /// Lowest-k leaf below (or at) `key` that could still be decomposed.
    #[must_use]
    pub fn lowest_k_open_leaf(&self, key: &str) -> Option<&Node> {
        let node = self.nodes.get(key)?;
        if node.is_internal() {
            node.children
                .iter()
                .filter_map(|child| self.lowest_k_open_leaf(child))
                .min_by(|a, b| a.k.total_cmp(&b.k).then_with(|| a.node_key.cmp(&b.node_key)))
        } else if node.decomp_type.is_none() {
            Some(node)
        } else {
            None
        }
    }
}
