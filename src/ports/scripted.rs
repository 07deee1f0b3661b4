//! Deterministic scripted adapters.
//!
//! A script maps node keys to raw adapter payloads. Payloads stay raw JSON
//! until the engine asks for them, so contract violations surface on the
//! operation that consumes them, exactly as a live adapter's would. Keys may
//! use `*` in place of the root id (`*:feasibility`) to cover every root.

#![allow(missing_docs)]

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::errors::{AbxError, Result};
use crate::ports::{
    DecomposeTarget, Decomposer, Decomposition, EvaluationOutcome, EvaluationRequest, Evaluator,
    EvidenceItem, NodeDecomposition, ScopingDecomposition, Searcher, SessionPorts,
};
use crate::tree::node::root_of;

/// On-disk script for the scripted adapters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Script {
    pub evaluations: BTreeMap<String, Vec<serde_json::Value>>,
    pub fallback_evaluation: Option<serde_json::Value>,
    pub scopings: BTreeMap<String, serde_json::Value>,
    /// Scope unscripted roots successfully with default slot statements.
    pub default_scoping_ok: bool,
    pub decompositions: BTreeMap<String, serde_json::Value>,
    pub search_results: BTreeMap<String, Vec<EvidenceItem>>,
}

impl Script {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|err| AbxError::ConfigParse {
            context: "script",
            details: err.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AbxError::MissingConfig {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path).map_err(|err| AbxError::io(path, err))?;
        Self::from_json_str(&text)
    }

    /// Split into the three adapters.
    #[must_use]
    pub fn into_adapters(self) -> (ScriptedEvaluator, ScriptedDecomposer, ScriptedSearcher) {
        let evaluator = ScriptedEvaluator {
            queues: self
                .evaluations
                .into_iter()
                .map(|(key, values)| (key, values.into_iter().collect()))
                .collect(),
            fallback: self.fallback_evaluation,
            calls: Vec::new(),
        };
        let decomposer = ScriptedDecomposer {
            scopings: self.scopings,
            decompositions: self.decompositions,
            default_scoping_ok: self.default_scoping_ok,
            calls: Vec::new(),
        };
        let searcher = ScriptedSearcher {
            results: self.search_results,
            queries: Vec::new(),
        };
        (evaluator, decomposer, searcher)
    }
}

/// Scripted adapters, with the decomposer and searcher attached only when
/// the script gives them something to do.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPorts {
    pub evaluator: ScriptedEvaluator,
    pub decomposer: Option<ScriptedDecomposer>,
    pub searcher: Option<ScriptedSearcher>,
}

impl ScriptedPorts {
    /// Borrow the adapters as session ports.
    pub fn ports(&mut self) -> SessionPorts<'_> {
        let mut ports = SessionPorts::new(&mut self.evaluator);
        if let Some(decomposer) = self.decomposer.as_mut() {
            ports = ports.with_decomposer(decomposer);
        }
        if let Some(searcher) = self.searcher.as_mut() {
            ports = ports.with_searcher(searcher);
        }
        ports
    }
}

impl Script {
    #[must_use]
    pub fn into_ports(self) -> ScriptedPorts {
        let attach_decomposer = self.default_scoping_ok
            || !self.scopings.is_empty()
            || !self.decompositions.is_empty();
        let attach_searcher = !self.search_results.is_empty();
        let (evaluator, decomposer, searcher) = self.into_adapters();
        ScriptedPorts {
            evaluator,
            decomposer: attach_decomposer.then_some(decomposer),
            searcher: attach_searcher.then_some(searcher),
        }
    }
}

/// `H1:feasibility:c01` → `*:feasibility:c01`.
fn wildcard_key(key: &str) -> Option<String> {
    key.split_once(':').map(|(_, rest)| format!("*:{rest}"))
}

// ──────────────────── evaluator ────────────────────

#[derive(Debug, Clone, Default)]
pub struct ScriptedEvaluator {
    queues: BTreeMap<String, VecDeque<serde_json::Value>>,
    fallback: Option<serde_json::Value>,
    /// Node keys evaluated, in call order.
    pub calls: Vec<String>,
}

impl ScriptedEvaluator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw payload for a key (exact or wildcard).
    pub fn push(&mut self, key: &str, payload: serde_json::Value) {
        self.queues
            .entry(key.to_string())
            .or_default()
            .push_back(payload);
    }

    /// Payload used when nothing is queued for a key.
    pub fn set_fallback(&mut self, payload: serde_json::Value) {
        self.fallback = Some(payload);
    }

    fn next_payload(&mut self, key: &str) -> Option<serde_json::Value> {
        if let Some(payload) = self.queues.get_mut(key).and_then(VecDeque::pop_front) {
            return Some(payload);
        }
        if let Some(wild) = wildcard_key(key) {
            if let Some(payload) = self.queues.get_mut(&wild).and_then(VecDeque::pop_front) {
                return Some(payload);
            }
        }
        self.fallback.clone()
    }
}

impl Evaluator for ScriptedEvaluator {
    fn evaluate(&mut self, request: &EvaluationRequest) -> Result<EvaluationOutcome> {
        self.calls.push(request.node_key.clone());
        let payload = self
            .next_payload(&request.node_key)
            .ok_or_else(|| AbxError::PortFailure {
                port: "evaluator",
                details: format!("no scripted outcome for {}", request.node_key),
            })?;
        EvaluationOutcome::from_json(&payload)
    }
}

// ──────────────────── decomposer ────────────────────

#[derive(Debug, Clone, Default)]
pub struct ScriptedDecomposer {
    scopings: BTreeMap<String, serde_json::Value>,
    decompositions: BTreeMap<String, serde_json::Value>,
    default_scoping_ok: bool,
    /// Target keys decomposed, in call order.
    pub calls: Vec<String>,
}

impl ScriptedDecomposer {
    /// Decomposer that scopes every root with default statements and never
    /// splits nodes.
    #[must_use]
    pub fn scoping_only() -> Self {
        Self {
            default_scoping_ok: true,
            ..Self::default()
        }
    }

    pub fn set_scoping(&mut self, root_id: &str, payload: serde_json::Value) {
        self.scopings.insert(root_id.to_string(), payload);
    }

    pub fn set_decomposition(&mut self, key: &str, payload: serde_json::Value) {
        self.decompositions.insert(key.to_string(), payload);
    }
}

impl Decomposer for ScriptedDecomposer {
    fn decompose(&mut self, target: &DecomposeTarget) -> Result<Decomposition> {
        self.calls.push(target.key().to_string());
        match target {
            DecomposeTarget::Root { root_id, .. } => {
                let scoping = match self.scopings.get(root_id) {
                    Some(payload) => ScopingDecomposition::from_json(payload)?,
                    None => ScopingDecomposition {
                        ok: self.default_scoping_ok,
                        slot_statements: BTreeMap::new(),
                    },
                };
                Ok(Decomposition::Scoping(scoping))
            }
            DecomposeTarget::Node { node_key, .. } => {
                let payload = self.decompositions.get(node_key).or_else(|| {
                    wildcard_key(node_key).and_then(|wild| self.decompositions.get(&wild))
                });
                let decomposition = match payload {
                    Some(payload) => NodeDecomposition::from_json(payload)?,
                    None => NodeDecomposition::failed(),
                };
                Ok(Decomposition::Node(decomposition))
            }
        }
    }
}

// ──────────────────── searcher ────────────────────

#[derive(Debug, Clone, Default)]
pub struct ScriptedSearcher {
    results: BTreeMap<String, Vec<EvidenceItem>>,
    /// Queries issued, in call order.
    pub queries: Vec<String>,
}

impl ScriptedSearcher {
    pub fn set_results(&mut self, root_id: &str, items: Vec<EvidenceItem>) {
        self.results.insert(root_id.to_string(), items);
    }
}

impl Searcher for ScriptedSearcher {
    fn search(
        &mut self,
        query: &str,
        limit: usize,
        metadata: &BTreeMap<String, String>,
    ) -> Result<Vec<EvidenceItem>> {
        self.queries.push(query.to_string());
        let root = metadata.get("root_id").map_or("", |id| root_of(id));
        Ok(self
            .results
            .get(root)
            .map(|items| items.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}
