//! Session specification: roots, numeric configuration, evidence packet and
//! MECE certificate, loadable from TOML or JSON.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::errors::{AbxError, Result};
use crate::core::policy::{PolicyOverrides, PolicyProfile};
use crate::ports::EvidenceItem;
use crate::tree::node::NodeRole;

/// Reserved id of the "none of the above" residual.
pub const H_NOA: &str = "H_NOA";
/// Reserved id of the "underdetermined" residual.
pub const H_UND: &str = "H_UND";

/// Whether residual catch-all hypotheses exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorldMode {
    #[default]
    Open,
    Closed,
}

/// How far the scheduler is allowed to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Run until a stop condition fires.
    #[default]
    UntilStops,
    /// Only scope roots; stop once every root is scoped.
    StartOnly,
    /// Execute at most `count` operations.
    Operations { count: u32 },
}

/// A required slot obligation every scoped root must carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSpec {
    pub key: String,
    pub role: NodeRole,
}

impl SlotSpec {
    /// Convenience constructor.
    #[must_use]
    pub fn new(key: &str, role: NodeRole) -> Self {
        Self {
            key: key.to_string(),
            role,
        }
    }
}

fn default_slots() -> Vec<SlotSpec> {
    vec![
        SlotSpec::new("feasibility", NodeRole::Nec),
        SlotSpec::new("availability", NodeRole::Nec),
        SlotSpec::new("fit_to_key_features", NodeRole::Nec),
        SlotSpec::new("defeater_resistance", NodeRole::Nec),
    ]
}

/// Numeric and behavioral configuration of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Total credit budget; one operation consumes exactly one credit.
    pub credits: u32,
    /// Confidence threshold for NEC slots.
    pub tau: f64,
    /// Frontier tie window.
    pub epsilon: f64,
    pub gamma_noa: f64,
    pub gamma_und: f64,
    /// Damping weight toward the softmax proposal.
    pub alpha: f64,
    /// Log-odds step multiplier.
    pub beta: f64,
    /// Per-slot log-odds clip.
    pub w_max: f64,
    pub lambda_voi: f64,
    pub world_mode: WorldMode,
    pub required_slots: Vec<SlotSpec>,
    pub run_mode: RunMode,
    pub max_operations: Option<u32>,
    pub min_decomposition_depth: u32,
    pub profile: PolicyProfile,
    pub policy: PolicyOverrides,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credits: 20,
            tau: 0.70,
            epsilon: 0.05,
            gamma_noa: 0.10,
            gamma_und: 0.10,
            alpha: 0.40,
            beta: 1.0,
            w_max: 3.0,
            lambda_voi: 0.10,
            world_mode: WorldMode::Open,
            required_slots: default_slots(),
            run_mode: RunMode::UntilStops,
            max_operations: None,
            min_decomposition_depth: 0,
            profile: PolicyProfile::Default,
            policy: PolicyOverrides::default(),
        }
    }
}

impl SessionConfig {
    /// Effective operation limit from the run mode and `max_operations`.
    #[must_use]
    pub fn op_limit(&self) -> Option<u32> {
        let from_mode = match self.run_mode {
            RunMode::Operations { count } => Some(count),
            RunMode::UntilStops | RunMode::StartOnly => None,
        };
        match (from_mode, self.max_operations) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Range checks. Raised before any credit is spent.
    pub fn validate(&self) -> Result<()> {
        probability("config.tau", self.tau)?;
        if self.tau <= 0.0 {
            return Err(AbxError::config("config.tau", "must be > 0"));
        }
        finite_non_negative("config.epsilon", self.epsilon)?;
        probability("config.gamma_noa", self.gamma_noa)?;
        probability("config.gamma_und", self.gamma_und)?;
        if self.gamma_noa + self.gamma_und > 1.0 {
            return Err(AbxError::config(
                "config.gamma_noa + config.gamma_und",
                format!(
                    "{} + {} exceeds 1",
                    self.gamma_noa, self.gamma_und
                ),
            ));
        }
        probability("config.alpha", self.alpha)?;
        finite_non_negative("config.beta", self.beta)?;
        if self.beta <= 0.0 {
            return Err(AbxError::config("config.beta", "must be > 0"));
        }
        finite_non_negative("config.w_max", self.w_max)?;
        if self.w_max <= 0.0 {
            return Err(AbxError::config("config.w_max", "must be > 0"));
        }
        finite_non_negative("config.lambda_voi", self.lambda_voi)?;

        if self.required_slots.is_empty() {
            return Err(AbxError::config(
                "config.required_slots",
                "at least one slot is required",
            ));
        }
        let mut seen = BTreeSet::new();
        for slot in &self.required_slots {
            validate_key_segment("config.required_slots.key", &slot.key)?;
            if !seen.insert(slot.key.as_str()) {
                return Err(AbxError::config(
                    "config.required_slots.key",
                    format!("duplicate slot {:?}", slot.key),
                ));
            }
            if slot.role == NodeRole::Unscoped {
                return Err(AbxError::config(
                    "config.required_slots.role",
                    format!("slot {:?} must be NEC or EVID", slot.key),
                ));
            }
        }
        Ok(())
    }

    /// Slot spec by key.
    #[must_use]
    pub fn slot(&self, key: &str) -> Option<&SlotSpec> {
        self.required_slots.iter().find(|slot| slot.key == key)
    }
}

/// A caller-supplied candidate explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootSpec {
    pub root_id: String,
    pub statement: String,
    #[serde(default)]
    pub exclusion_clause: String,
    /// Atomic member roots when this root is a compositional story.
    #[serde(default)]
    pub components: Vec<String>,
}

impl RootSpec {
    /// Convenience constructor for an atomic root.
    #[must_use]
    pub fn new(root_id: &str, statement: &str) -> Self {
        Self {
            root_id: root_id.to_string(),
            statement: statement.to_string(),
            exclusion_clause: String::new(),
            components: Vec::new(),
        }
    }
}

/// Declared overlap and discriminator for one unordered root pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairCertificate {
    pub overlap: f64,
    #[serde(default)]
    pub discriminator: String,
}

/// Pairwise MECE certificate keyed by `a|b`.
pub type MeceCertificate = BTreeMap<String, PairCertificate>;

/// Everything needed to start (and replay) a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSpec {
    /// The claim or incident being explained.
    #[serde(default)]
    pub claim: String,
    pub roots: Vec<RootSpec>,
    #[serde(default)]
    pub config: SessionConfig,
    #[serde(default)]
    pub evidence: Vec<EvidenceItem>,
    #[serde(default)]
    pub mece_certificate: MeceCertificate,
}

impl SessionSpec {
    /// Build a spec with default configuration.
    #[must_use]
    pub fn new(claim: &str, roots: Vec<RootSpec>) -> Self {
        Self {
            claim: claim.to_string(),
            roots,
            config: SessionConfig::default(),
            evidence: Vec::new(),
            mece_certificate: MeceCertificate::new(),
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Parse a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|err| AbxError::ConfigParse {
            context: "serde_json",
            details: err.to_string(),
        })
    }

    /// Load from disk; `.json` is parsed as JSON, anything else as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AbxError::MissingConfig {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path).map_err(|err| AbxError::io(path, err))?;
        let spec = if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json_str(&text)?
        } else {
            Self::from_toml_str(&text)?
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Validate config and root specs. Certificate keys are checked once the
    /// contender space is final.
    pub fn validate(&self) -> Result<()> {
        self.config.validate()?;
        let mut ids = BTreeSet::new();
        for root in &self.roots {
            validate_root_id(&root.root_id)?;
            if root.statement.trim().is_empty() {
                return Err(AbxError::config(
                    format!("roots.{}.statement", root.root_id),
                    "statement must not be empty",
                ));
            }
            if !ids.insert(root.root_id.as_str()) {
                return Err(AbxError::config(
                    "roots.root_id",
                    format!("duplicate root id {:?}", root.root_id),
                ));
            }
        }
        let mut evidence_ids = BTreeSet::new();
        for item in &self.evidence {
            if item.id.trim().is_empty() {
                return Err(AbxError::config("evidence.id", "evidence id must not be empty"));
            }
            if !evidence_ids.insert(item.id.as_str()) {
                return Err(AbxError::config(
                    "evidence.id",
                    format!("duplicate evidence id {:?}", item.id),
                ));
            }
        }
        Ok(())
    }
}

/// Root ids become node-key prefixes and pair-key members.
pub fn validate_root_id(root_id: &str) -> Result<()> {
    validate_key_segment("roots.root_id", root_id)?;
    if root_id.contains('|') {
        return Err(AbxError::config(
            "roots.root_id",
            format!("{root_id:?} must not contain '|'"),
        ));
    }
    if root_id == H_NOA || root_id == H_UND {
        return Err(AbxError::config(
            "roots.root_id",
            format!("{root_id:?} is reserved for residual hypotheses"),
        ));
    }
    Ok(())
}

fn validate_key_segment(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AbxError::config(field, "must not be empty"));
    }
    if value.contains(':') {
        return Err(AbxError::config(
            field,
            format!("{value:?} must not contain ':'"),
        ));
    }
    Ok(())
}

fn probability(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(AbxError::config(field, format!("{value} outside [0, 1]")))
    }
}

fn finite_non_negative(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(AbxError::config(field, format!("{value} must be finite and >= 0")))
    }
}
