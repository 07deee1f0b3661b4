//! Ports consumed by the engine: evaluator, decomposer, audit sink and
//! searcher, with their typed payloads.
//!
//! Adapters (LLM-backed or otherwise) live outside the engine. Whatever they
//! return is validated here before it touches session state: a missing or
//! out-of-range field is a contract violation and nothing is applied.

pub mod scripted;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::audit::AuditEvent;
use crate::core::canonical::split_pair_key;
use crate::core::errors::{AbxError, Result};
use crate::tree::node::DecompType;

// ──────────────────── evidence ────────────────────

/// One item of the evidence packet handed to the evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub id: String,
    #[serde(default)]
    pub source: String,
    pub text: String,
    /// Restricts the item to one root's evaluations when set.
    #[serde(default)]
    pub root_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl EvidenceItem {
    /// Whether the item may be shown while evaluating `root_id`.
    #[must_use]
    pub fn applies_to(&self, root_id: &str) -> bool {
        self.root_id.as_deref().is_none_or(|owner| owner == root_id)
    }
}

// ──────────────────── evaluation outcome ────────────────────

/// Direction of the evaluated statement relative to the evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Entailment {
    Supports,
    Contradicts,
    Neutral,
    Unknown,
}

/// Evaluator's judgement of how directly the evidence bears on the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceQuality {
    Direct,
    Indirect,
    Weak,
    None,
}

impl EvidenceQuality {
    /// Validity assumed when the evaluator does not report one.
    #[must_use]
    pub const fn default_validity(self) -> f64 {
        match self {
            Self::Direct => 1.0,
            Self::Indirect => 0.75,
            Self::Weak => 0.5,
            Self::None => 0.25,
        }
    }
}

/// Four-dimension confidence rubric, each scored 0..=2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rubric {
    #[serde(rename = "A")]
    pub a: u8,
    #[serde(rename = "B")]
    pub b: u8,
    #[serde(rename = "C")]
    pub c: u8,
    #[serde(rename = "D")]
    pub d: u8,
}

impl Rubric {
    #[must_use]
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self { a, b, c, d }
    }

    #[must_use]
    pub const fn sum(self) -> u16 {
        self.a as u16 + self.b as u16 + self.c as u16 + self.d as u16
    }

    #[must_use]
    pub const fn has_zero(self) -> bool {
        self.a == 0 || self.b == 0 || self.c == 0 || self.d == 0
    }
}

/// Typed, directional evidence about one unordered root pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscriminatorPayload {
    /// Pair key `a|b` (either order).
    pub pair: String,
    /// Root id the evidence favors; must be a member of `pair`.
    pub favors: String,
    /// Evidence weight in [0, 1].
    pub strength: f64,
    #[serde(default)]
    pub evidence_ids: Vec<String>,
}

/// Verbatim quote the evaluator attributes to an evidence item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceQuote {
    pub evidence_id: String,
    pub text: String,
}

/// Structured result of one EVALUATE call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub p: f64,
    pub rubric: Rubric,
    pub evidence_ids: Vec<String>,
    #[serde(default)]
    pub discriminator_ids: Vec<String>,
    #[serde(default)]
    pub discriminator_payloads: Vec<DiscriminatorPayload>,
    pub entailment: Entailment,
    pub evidence_quality: EvidenceQuality,
    pub reasoning_summary: String,
    #[serde(default)]
    pub defeaters: Vec<String>,
    #[serde(default)]
    pub uncertainty_source: String,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub quotes: Vec<EvidenceQuote>,
    #[serde(default)]
    pub validity: Option<f64>,
}

/// Pull the offending field out of a serde message such as
/// "missing field `p` at line 1 column 2".
fn serde_field(message: &str) -> String {
    message
        .split('`')
        .nth(1)
        .map_or_else(|| "<payload>".to_string(), str::to_string)
}

impl EvaluationOutcome {
    /// Parse and validate a raw adapter payload.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let outcome: Self = serde_json::from_value(value.clone()).map_err(|err| {
            let message = err.to_string();
            AbxError::contract("evaluator", serde_field(&message), message)
        })?;
        outcome.validate()?;
        Ok(outcome)
    }

    /// Range checks on every numeric field.
    pub fn validate(&self) -> Result<()> {
        if !self.p.is_finite() || !(0.0..=1.0).contains(&self.p) {
            return Err(AbxError::contract(
                "evaluator",
                "p",
                format!("{} outside [0, 1]", self.p),
            ));
        }
        for (name, score) in [
            ("rubric.A", self.rubric.a),
            ("rubric.B", self.rubric.b),
            ("rubric.C", self.rubric.c),
            ("rubric.D", self.rubric.d),
        ] {
            if score > 2 {
                return Err(AbxError::contract(
                    "evaluator",
                    name,
                    format!("{score} outside 0..=2"),
                ));
            }
        }
        if let Some(validity) = self.validity {
            if !validity.is_finite() || !(0.0..=1.0).contains(&validity) {
                return Err(AbxError::contract(
                    "evaluator",
                    "validity",
                    format!("{validity} outside [0, 1]"),
                ));
            }
        }
        for (idx, payload) in self.discriminator_payloads.iter().enumerate() {
            let field = format!("discriminator_payloads[{idx}]");
            let Some((left, right)) = split_pair_key(&payload.pair) else {
                return Err(AbxError::contract(
                    "evaluator",
                    format!("{field}.pair"),
                    format!("{:?} is not an `a|b` pair key", payload.pair),
                ));
            };
            if left == right {
                return Err(AbxError::contract(
                    "evaluator",
                    format!("{field}.pair"),
                    "pair members must differ",
                ));
            }
            if payload.favors != left && payload.favors != right {
                return Err(AbxError::contract(
                    "evaluator",
                    format!("{field}.favors"),
                    format!("{:?} is not a member of {:?}", payload.favors, payload.pair),
                ));
            }
            if !payload.strength.is_finite() || !(0.0..=1.0).contains(&payload.strength) {
                return Err(AbxError::contract(
                    "evaluator",
                    format!("{field}.strength"),
                    format!("{} outside [0, 1]", payload.strength),
                ));
            }
        }
        Ok(())
    }

    /// Reject payloads naming roots the session does not know.
    pub fn validate_pair_members(&self, known_roots: &BTreeSet<String>) -> Result<()> {
        for (idx, payload) in self.discriminator_payloads.iter().enumerate() {
            if let Some((left, right)) = split_pair_key(&payload.pair) {
                for member in [left, right] {
                    if !known_roots.contains(member) {
                        return Err(AbxError::contract(
                            "evaluator",
                            format!("discriminator_payloads[{idx}].pair"),
                            format!("unknown root {member:?}"),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Whether the outcome carries any discriminating evidence.
    #[must_use]
    pub fn is_discriminative(&self) -> bool {
        !self.discriminator_ids.is_empty() || !self.discriminator_payloads.is_empty()
    }

    /// Reported validity, or the evidence-quality default.
    #[must_use]
    pub fn effective_validity(&self) -> f64 {
        self.validity
            .unwrap_or_else(|| self.evidence_quality.default_validity())
    }
}

// ──────────────────── decomposition ────────────────────

/// Root-scoping result: one statement per required slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopingDecomposition {
    pub ok: bool,
    #[serde(default)]
    pub slot_statements: BTreeMap<String, String>,
}

impl ScopingDecomposition {
    /// Parse `{ok, <slot>_statement: ...}` or `{ok, slot_statements: {...}}`.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let Some(object) = value.as_object() else {
            return Err(AbxError::contract(
                "decomposer",
                "<payload>",
                "scoping payload must be an object",
            ));
        };
        let ok = object
            .get("ok")
            .and_then(serde_json::Value::as_bool)
            .ok_or_else(|| AbxError::contract("decomposer", "ok", "missing boolean `ok`"))?;
        let mut slot_statements = BTreeMap::new();
        if let Some(map) = object.get("slot_statements").and_then(|v| v.as_object()) {
            for (slot, statement) in map {
                if let Some(text) = statement.as_str() {
                    slot_statements.insert(slot.clone(), text.to_string());
                }
            }
        }
        for (key, field) in object {
            let Some(slot) = key.strip_suffix("_statement") else {
                continue;
            };
            let Some(text) = field.as_str() else {
                return Err(AbxError::contract(
                    "decomposer",
                    key.clone(),
                    "slot statement must be a string",
                ));
            };
            slot_statements.insert(slot.to_string(), text.to_string());
        }
        Ok(Self {
            ok,
            slot_statements,
        })
    }

    /// Non-blank statement for a slot, if supplied.
    #[must_use]
    pub fn statement_for(&self, slot: &str) -> Option<&str> {
        self.slot_statements
            .get(slot)
            .map(String::as_str)
            .filter(|text| !text.trim().is_empty())
    }
}

/// One proposed child of a node decomposition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSpec {
    #[serde(default)]
    pub child_id: String,
    #[serde(default)]
    pub statement: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub falsifiable: bool,
    #[serde(default)]
    pub test_procedure: String,
    #[serde(default)]
    pub overlap_with_siblings: Vec<String>,
}

/// Slot/node decomposition result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDecomposition {
    pub ok: bool,
    #[serde(default)]
    pub children: Vec<ChildSpec>,
    #[serde(rename = "type", default)]
    pub decomp_type: Option<DecompType>,
    #[serde(default)]
    pub coupling: Option<f64>,
}

impl NodeDecomposition {
    /// A failed decomposition (the node becomes a terminal leaf).
    #[must_use]
    pub const fn failed() -> Self {
        Self {
            ok: false,
            children: Vec::new(),
            decomp_type: None,
            coupling: None,
        }
    }

    /// Parse and validate a raw adapter payload.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let decomposition: Self = serde_json::from_value(value.clone()).map_err(|err| {
            let message = err.to_string();
            AbxError::contract("decomposer", serde_field(&message), message)
        })?;
        if let Some(coupling) = decomposition.coupling {
            if !coupling.is_finite() || !(0.0..=1.0).contains(&coupling) {
                return Err(AbxError::contract(
                    "decomposer",
                    "coupling",
                    format!("{coupling} outside [0, 1]"),
                ));
            }
        }
        Ok(decomposition)
    }
}

/// Anything a decomposer may return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decomposition {
    Scoping(ScopingDecomposition),
    Node(NodeDecomposition),
}

/// What the decomposer is asked to refine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum DecomposeTarget {
    /// Scope a root into its required slots.
    Root {
        root_id: String,
        statement: String,
        exclusion_clause: String,
        slots: Vec<String>,
    },
    /// Split a slot or deeper node into AND/OR children.
    Node {
        node_key: String,
        statement: String,
    },
}

impl DecomposeTarget {
    /// Key the target is addressed by.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Root { root_id, .. } => root_id,
            Self::Node { node_key, .. } => node_key,
        }
    }
}

// ──────────────────── evaluation request ────────────────────

/// Why an operation was selected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpPurpose {
    #[default]
    Standard,
    /// Pre-empted probe for evidence against the runner-up.
    CounterevidenceProbe,
    /// Pre-empted evaluation targeting an unresolved pair.
    Discriminator,
}

/// Context handed to the evaluator alongside the node statement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationContext {
    pub claim: String,
    pub root_id: String,
    pub root_statement: String,
    pub slot_key: String,
    pub purpose: OpPurpose,
    /// Pair key under adjudication, when targeting one.
    pub pair: Option<String>,
    /// Other live contenders.
    pub rivals: Vec<String>,
}

/// One EVALUATE call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub node_key: String,
    pub statement: String,
    pub context: EvaluationContext,
    pub evidence: Vec<EvidenceItem>,
}

// ──────────────────── traits ────────────────────

/// Tests a node against evidence.
pub trait Evaluator {
    fn evaluate(&mut self, request: &EvaluationRequest) -> Result<EvaluationOutcome>;
}

/// Refines roots into slots and nodes into children.
pub trait Decomposer {
    fn decompose(&mut self, target: &DecomposeTarget) -> Result<Decomposition>;
}

/// Receives every audit event, in order.
pub trait AuditSink {
    fn append(&mut self, event: &AuditEvent) -> Result<()>;
}

/// Retrieves evidence on a fixed, non-adaptive schedule.
pub trait Searcher {
    fn search(
        &mut self,
        query: &str,
        limit: usize,
        metadata: &BTreeMap<String, String>,
    ) -> Result<Vec<EvidenceItem>>;
}

/// Ports borrowed by one session run.
pub struct SessionPorts<'a> {
    pub evaluator: &'a mut dyn Evaluator,
    pub decomposer: Option<&'a mut dyn Decomposer>,
    pub searcher: Option<&'a mut dyn Searcher>,
    pub audit_sink: Option<&'a mut dyn AuditSink>,
}

impl<'a> SessionPorts<'a> {
    /// Ports with only an evaluator attached.
    pub fn new(evaluator: &'a mut dyn Evaluator) -> Self {
        Self {
            evaluator,
            decomposer: None,
            searcher: None,
            audit_sink: None,
        }
    }

    #[must_use]
    pub fn with_decomposer(mut self, decomposer: &'a mut dyn Decomposer) -> Self {
        self.decomposer = Some(decomposer);
        self
    }

    #[must_use]
    pub fn with_searcher(mut self, searcher: &'a mut dyn Searcher) -> Self {
        self.searcher = Some(searcher);
        self
    }

    #[must_use]
    pub fn with_audit_sink(mut self, sink: &'a mut dyn AuditSink) -> Self {
        self.audit_sink = Some(sink);
        self
    }
}
