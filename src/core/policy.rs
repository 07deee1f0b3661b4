//! Session policy: one typed struct resolved once from profile defaults then
//! explicit overrides.
//!
//! Resolution is a pure function ([`Policy::resolve`]); the engine never
//! mutates the resolved policy mid-session.

#![allow(missing_docs)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::errors::{AbxError, Result};

/// Exact empirically tuned constants. Do not re-derive.
pub const DEFAULT_EPSILON_NC: f64 = 0.02;
pub const DEFAULT_CONTRADICTION_KAPPA: f64 = 0.25;

// ──────────────────── enums ────────────────────

/// Named bundle of policy defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyProfile {
    #[default]
    Default,
    /// Strict contrastive certification of a single causal story.
    CausalInvestigation,
    /// Exploratory reasoning with capped confidence.
    Forecasting,
    /// All closure gates off.
    Exploratory,
}

impl PolicyProfile {
    /// Snake-case name, as used in config files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::CausalInvestigation => "causal_investigation",
            Self::Forecasting => "forecasting",
            Self::Exploratory => "exploratory",
        }
    }
}

impl fmt::Display for PolicyProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyProfile {
    type Err = AbxError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim() {
            "default" => Ok(Self::Default),
            "causal_investigation" => Ok(Self::CausalInvestigation),
            "forecasting" => Ok(Self::Forecasting),
            "exploratory" => Ok(Self::Exploratory),
            other => Err(AbxError::UnknownPolicyValue {
                field: "profile",
                value: other.to_string(),
            }),
        }
    }
}

/// Whether the session explores or certifies a winner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningMode {
    #[default]
    Explore,
    Certify,
}

/// How contenders are formed from the supplied roots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContenderSpaceMode {
    /// Every root is one atomic hypothesis.
    #[default]
    Singleton,
    /// Roots may be bounded-cardinality stories over atomic roots.
    Compositional,
}

// ──────────────────── sections ────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MecePolicy {
    /// Require a complete pairwise certificate before spending credits.
    pub strict: bool,
    pub max_pair_overlap: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContenderSpacePolicy {
    pub mode: ContenderSpaceMode,
    pub max_cardinality: usize,
    /// Generate every story of cardinality 2..=max from the atomic roots.
    pub auto_expand: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairAdjudicationPolicy {
    pub enabled: bool,
    pub min_directional_evidence: u32,
    pub min_margin: f64,
    pub max_contradiction_density: f64,
    /// Restrict adjudication to the top-mass contenders.
    pub active_set_enabled: bool,
    pub active_set_size: usize,
    /// Freeze the active set while any of its pairs is unresolved.
    pub sticky_lock: bool,
    /// Closure additionally requires every active pair resolved.
    pub require_all_resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionContractPolicy {
    pub enabled: bool,
    pub min_winner_margin: f64,
    pub min_pair_coverage: f64,
    pub require_loser_falsification: bool,
    /// UND mass added on contract failure.
    pub und_elevation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicAbstentionPolicy {
    pub enabled: bool,
    pub weight_unresolved: f64,
    pub weight_contradiction: f64,
    pub weight_non_discriminative: f64,
    pub min_floor: f64,
    pub max_floor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetirementPolicy {
    pub enabled: bool,
    pub min_losses: u32,
    pub min_margin: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContrastiveBudgetPolicy {
    pub enabled: bool,
    /// Credits pre-empted for counterevidence probes on the runner-up.
    pub counterevidence_quota: u32,
    /// Credits pre-empted for evaluations targeting an unresolved pair.
    pub discriminator_quota: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchPolicy {
    pub enabled: bool,
    pub per_root_limit: usize,
}

/// Fully resolved session policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub profile: PolicyProfile,
    pub reasoning_mode: ReasoningMode,
    pub strict_contrastive: bool,
    pub epsilon_nc: f64,
    pub contradiction_kappa: f64,
    pub contradiction_min_validity: f64,
    /// Upper bound applied to every derived k (forecasting).
    pub confidence_cap: Option<f64>,
    pub mece: MecePolicy,
    pub contender_space: ContenderSpacePolicy,
    pub pair_adjudication: PairAdjudicationPolicy,
    pub decision_contract: DecisionContractPolicy,
    pub dynamic_abstention: DynamicAbstentionPolicy,
    pub retirement: RetirementPolicy,
    pub contrastive_budget: ContrastiveBudgetPolicy,
    pub search: SearchPolicy,
}

impl Default for Policy {
    fn default() -> Self {
        Self::profile_defaults(PolicyProfile::Default)
    }
}

// ──────────────────── overrides ────────────────────

/// Caller-supplied overrides. Every `None` keeps the profile default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyOverrides {
    pub reasoning_mode: Option<ReasoningMode>,
    pub strict_contrastive: Option<bool>,
    pub epsilon_nc: Option<f64>,
    pub contradiction_kappa: Option<f64>,
    pub contradiction_min_validity: Option<f64>,
    pub confidence_cap: Option<f64>,
    pub strict_mece: Option<bool>,
    pub max_pair_overlap: Option<f64>,
    pub contender_space_mode: Option<ContenderSpaceMode>,
    pub max_story_cardinality: Option<usize>,
    pub auto_expand_stories: Option<bool>,
    pub pair_adjudication: Option<bool>,
    pub pair_min_directional_evidence: Option<u32>,
    pub pair_min_margin: Option<f64>,
    pub pair_max_contradiction_density: Option<f64>,
    pub active_set: Option<bool>,
    pub active_set_size: Option<usize>,
    pub active_set_sticky_lock: Option<bool>,
    pub require_all_pairs_resolved: Option<bool>,
    pub decision_contract: Option<bool>,
    pub contract_min_winner_margin: Option<f64>,
    pub contract_min_pair_coverage: Option<f64>,
    pub contract_require_loser_falsification: Option<bool>,
    pub contract_und_elevation: Option<f64>,
    pub dynamic_abstention: Option<bool>,
    pub abstention_weight_unresolved: Option<f64>,
    pub abstention_weight_contradiction: Option<f64>,
    pub abstention_weight_non_discriminative: Option<f64>,
    pub abstention_min_floor: Option<f64>,
    pub abstention_max_floor: Option<f64>,
    pub retirement: Option<bool>,
    pub retirement_min_losses: Option<u32>,
    pub retirement_min_margin: Option<f64>,
    pub contrastive_budget: Option<bool>,
    pub counterevidence_quota: Option<u32>,
    pub discriminator_quota: Option<u32>,
    pub search: Option<bool>,
    pub search_per_root_limit: Option<usize>,
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

impl Policy {
    /// Defaults for a profile, before overrides.
    #[must_use]
    pub fn profile_defaults(profile: PolicyProfile) -> Self {
        let mut policy = Self {
            profile,
            reasoning_mode: ReasoningMode::Explore,
            strict_contrastive: false,
            epsilon_nc: DEFAULT_EPSILON_NC,
            contradiction_kappa: DEFAULT_CONTRADICTION_KAPPA,
            contradiction_min_validity: 0.5,
            confidence_cap: None,
            mece: MecePolicy {
                strict: false,
                max_pair_overlap: 0.25,
            },
            contender_space: ContenderSpacePolicy {
                mode: ContenderSpaceMode::Singleton,
                max_cardinality: 1,
                auto_expand: false,
            },
            pair_adjudication: PairAdjudicationPolicy {
                enabled: false,
                min_directional_evidence: 2,
                min_margin: 0.15,
                max_contradiction_density: 0.34,
                active_set_enabled: false,
                active_set_size: 3,
                sticky_lock: false,
                require_all_resolved: false,
            },
            decision_contract: DecisionContractPolicy {
                enabled: false,
                min_winner_margin: 0.10,
                min_pair_coverage: 1.0,
                require_loser_falsification: false,
                und_elevation: 0.10,
            },
            dynamic_abstention: DynamicAbstentionPolicy {
                enabled: false,
                weight_unresolved: 0.15,
                weight_contradiction: 0.10,
                weight_non_discriminative: 0.10,
                min_floor: 0.0,
                max_floor: 0.35,
            },
            retirement: RetirementPolicy {
                enabled: false,
                min_losses: 2,
                min_margin: 0.30,
            },
            contrastive_budget: ContrastiveBudgetPolicy {
                enabled: false,
                counterevidence_quota: 1,
                discriminator_quota: 2,
            },
            search: SearchPolicy {
                enabled: true,
                per_root_limit: 3,
            },
        };

        match profile {
            PolicyProfile::Default => {}
            PolicyProfile::CausalInvestigation => {
                policy.reasoning_mode = ReasoningMode::Certify;
                policy.strict_contrastive = true;
                policy.mece.strict = true;
                policy.pair_adjudication.enabled = true;
                policy.pair_adjudication.active_set_enabled = true;
                policy.pair_adjudication.sticky_lock = true;
                policy.decision_contract.enabled = true;
                policy.decision_contract.min_winner_margin = 0.15;
                policy.decision_contract.require_loser_falsification = true;
                policy.dynamic_abstention.enabled = true;
                policy.retirement.enabled = true;
                policy.contrastive_budget.enabled = true;
            }
            PolicyProfile::Forecasting => {
                policy.confidence_cap = Some(0.80);
            }
            PolicyProfile::Exploratory => {
                policy.search.per_root_limit = 5;
            }
        }
        policy
    }

    /// Resolve profile defaults, then apply explicit overrides, then validate.
    pub fn resolve(profile: PolicyProfile, overrides: &PolicyOverrides) -> Result<Self> {
        let mut policy = Self::profile_defaults(profile);
        let o = overrides.clone();

        set(&mut policy.reasoning_mode, o.reasoning_mode);
        set(&mut policy.strict_contrastive, o.strict_contrastive);
        set(&mut policy.epsilon_nc, o.epsilon_nc);
        set(&mut policy.contradiction_kappa, o.contradiction_kappa);
        set(&mut policy.contradiction_min_validity, o.contradiction_min_validity);
        if o.confidence_cap.is_some() {
            policy.confidence_cap = o.confidence_cap;
        }

        set(&mut policy.mece.strict, o.strict_mece);
        set(&mut policy.mece.max_pair_overlap, o.max_pair_overlap);

        set(&mut policy.contender_space.mode, o.contender_space_mode);
        set(&mut policy.contender_space.max_cardinality, o.max_story_cardinality);
        set(&mut policy.contender_space.auto_expand, o.auto_expand_stories);

        let pairs = &mut policy.pair_adjudication;
        set(&mut pairs.enabled, o.pair_adjudication);
        set(&mut pairs.min_directional_evidence, o.pair_min_directional_evidence);
        set(&mut pairs.min_margin, o.pair_min_margin);
        set(&mut pairs.max_contradiction_density, o.pair_max_contradiction_density);
        set(&mut pairs.active_set_enabled, o.active_set);
        set(&mut pairs.active_set_size, o.active_set_size);
        set(&mut pairs.sticky_lock, o.active_set_sticky_lock);
        set(&mut pairs.require_all_resolved, o.require_all_pairs_resolved);

        let contract = &mut policy.decision_contract;
        set(&mut contract.enabled, o.decision_contract);
        set(&mut contract.min_winner_margin, o.contract_min_winner_margin);
        set(&mut contract.min_pair_coverage, o.contract_min_pair_coverage);
        set(
            &mut contract.require_loser_falsification,
            o.contract_require_loser_falsification,
        );
        set(&mut contract.und_elevation, o.contract_und_elevation);

        let abstention = &mut policy.dynamic_abstention;
        set(&mut abstention.enabled, o.dynamic_abstention);
        set(&mut abstention.weight_unresolved, o.abstention_weight_unresolved);
        set(&mut abstention.weight_contradiction, o.abstention_weight_contradiction);
        set(
            &mut abstention.weight_non_discriminative,
            o.abstention_weight_non_discriminative,
        );
        set(&mut abstention.min_floor, o.abstention_min_floor);
        set(&mut abstention.max_floor, o.abstention_max_floor);

        set(&mut policy.retirement.enabled, o.retirement);
        set(&mut policy.retirement.min_losses, o.retirement_min_losses);
        set(&mut policy.retirement.min_margin, o.retirement_min_margin);

        set(&mut policy.contrastive_budget.enabled, o.contrastive_budget);
        set(
            &mut policy.contrastive_budget.counterevidence_quota,
            o.counterevidence_quota,
        );
        set(
            &mut policy.contrastive_budget.discriminator_quota,
            o.discriminator_quota,
        );

        set(&mut policy.search.enabled, o.search);
        set(&mut policy.search.per_root_limit, o.search_per_root_limit);

        policy.validate()?;
        Ok(policy)
    }

    /// Range checks. Raised before any credit is spent.
    pub fn validate(&self) -> Result<()> {
        unit("policy.epsilon_nc", self.epsilon_nc)?;
        unit("policy.contradiction_kappa", self.contradiction_kappa)?;
        unit(
            "policy.contradiction_min_validity",
            self.contradiction_min_validity,
        )?;
        if let Some(cap) = self.confidence_cap {
            unit("policy.confidence_cap", cap)?;
            if cap <= 0.0 {
                return Err(AbxError::config("policy.confidence_cap", "must be > 0"));
            }
        }
        non_negative("policy.mece.max_pair_overlap", self.mece.max_pair_overlap)?;
        if self.contender_space.max_cardinality == 0 {
            return Err(AbxError::config(
                "policy.contender_space.max_cardinality",
                "must be >= 1",
            ));
        }
        let pairs = &self.pair_adjudication;
        unit("policy.pair_adjudication.min_margin", pairs.min_margin)?;
        unit(
            "policy.pair_adjudication.max_contradiction_density",
            pairs.max_contradiction_density,
        )?;
        if pairs.active_set_enabled && pairs.active_set_size < 2 {
            return Err(AbxError::config(
                "policy.pair_adjudication.active_set_size",
                "an active set needs at least two contenders",
            ));
        }
        let contract = &self.decision_contract;
        unit(
            "policy.decision_contract.min_winner_margin",
            contract.min_winner_margin,
        )?;
        unit(
            "policy.decision_contract.min_pair_coverage",
            contract.min_pair_coverage,
        )?;
        unit("policy.decision_contract.und_elevation", contract.und_elevation)?;
        let abstention = &self.dynamic_abstention;
        non_negative(
            "policy.dynamic_abstention.weight_unresolved",
            abstention.weight_unresolved,
        )?;
        non_negative(
            "policy.dynamic_abstention.weight_contradiction",
            abstention.weight_contradiction,
        )?;
        non_negative(
            "policy.dynamic_abstention.weight_non_discriminative",
            abstention.weight_non_discriminative,
        )?;
        unit("policy.dynamic_abstention.min_floor", abstention.min_floor)?;
        unit("policy.dynamic_abstention.max_floor", abstention.max_floor)?;
        if abstention.min_floor > abstention.max_floor {
            return Err(AbxError::config(
                "policy.dynamic_abstention",
                format!(
                    "min_floor {} exceeds max_floor {}",
                    abstention.min_floor, abstention.max_floor
                ),
            ));
        }
        unit("policy.retirement.min_margin", self.retirement.min_margin)?;
        if self.retirement.enabled && self.retirement.min_losses == 0 {
            return Err(AbxError::config(
                "policy.retirement.min_losses",
                "must be >= 1 when retirement is enabled",
            ));
        }
        Ok(())
    }

    /// Whether closure needs pairwise evidence at all.
    #[must_use]
    pub const fn uses_pairwise_evidence(&self) -> bool {
        self.pair_adjudication.enabled || self.decision_contract.enabled
    }
}

fn unit(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(AbxError::config(field, format!("{value} outside [0, 1]")))
    }
}

fn non_negative(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(AbxError::config(field, format!("{value} must be finite and >= 0")))
    }
}
