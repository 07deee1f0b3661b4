//! Log-odds ledger updates, damping, and open-world residual recomputation.
//!
//! Clipping order per slot: `ln(p/0.5)` clipped to `±w_max`, then the
//! non-discriminative clip to `±epsilon_nc`, then the contradiction floor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::config::{H_NOA, H_UND, SessionConfig, WorldMode};
use crate::core::policy::Policy;
use crate::ledger::model::HypothesisSet;
use crate::tree::node::NodeArena;

/// Lower clip of both residual masses.
pub const RESIDUAL_MIN: f64 = 0.01;
/// Upper clip of both residual masses.
pub const RESIDUAL_MAX: f64 = 0.60;
/// Weight of the mismatch / underdetermination signals on the residuals.
pub const RESIDUAL_SIGNAL_WEIGHT: f64 = 0.25;

/// Tags on the slot touched by one evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateSignal<'a> {
    pub slot_key: &'a str,
    /// No discriminator ids or payloads under strict contrastive policy.
    pub non_discriminative: bool,
    /// Validity of a CONTRADICTS outcome above the policy minimum.
    pub contradiction_validity: Option<f64>,
}

/// Per-slot weight bookkeeping of one update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotWeight {
    pub slot: String,
    pub w_new: f64,
    pub w_prev: f64,
    pub delta: f64,
    pub non_discriminative_clip: bool,
    pub contradiction_floor: bool,
}

/// One root's ledger update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerUpdate {
    pub root_id: String,
    pub slots: Vec<SlotWeight>,
    pub log_odds: f64,
    pub p_base: f64,
    pub p_prop: f64,
    pub p_damped: f64,
}

/// Residual masses after an open-world recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResidualUpdate {
    pub mismatch: f64,
    pub underdetermination: f64,
    pub abstention_floor: f64,
    pub und_floor: f64,
    pub gamma_noa: f64,
    pub gamma_und: f64,
}

/// Running evaluation tallies that feed residuals and abstention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStats {
    pub evaluations: u32,
    pub non_discriminative: u32,
    pub contradictions: u32,
}

/// Session-owned ledger updater.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerUpdater {
    log_ledger: BTreeMap<String, f64>,
    /// Slot node key → weight already applied to the log ledger.
    applied: BTreeMap<String, f64>,
    stats: UpdateStats,
    /// Minimum `gamma_und` forced by decision-contract failures.
    und_floor: f64,
}

fn ratio(numerator: u32, denominator: u32) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        f64::from(numerator) / f64::from(denominator)
    }
}

/// Numerically stable softmax over `ids`.
fn softmax(log_ledger: &BTreeMap<String, f64>, ids: &[String]) -> BTreeMap<String, f64> {
    let max = ids
        .iter()
        .map(|id| log_ledger.get(id).copied().unwrap_or(0.0))
        .fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<(String, f64)> = ids
        .iter()
        .map(|id| {
            let value = log_ledger.get(id).copied().unwrap_or(0.0);
            (id.clone(), (value - max).exp())
        })
        .collect();
    let total: f64 = exps.iter().map(|(_, e)| e).sum();
    exps.into_iter()
        .map(|(id, e)| (id, if total > 0.0 { e / total } else { 0.0 }))
        .collect()
}

impl LedgerUpdater {
    #[must_use]
    pub fn new(set: &HypothesisSet) -> Self {
        Self {
            log_ledger: set.named_ids().into_iter().map(|id| (id, 0.0)).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn stats(&self) -> UpdateStats {
        self.stats
    }

    #[must_use]
    pub const fn und_floor(&self) -> f64 {
        self.und_floor
    }

    #[must_use]
    pub fn log_odds(&self, root_id: &str) -> f64 {
        self.log_ledger.get(root_id).copied().unwrap_or(0.0)
    }

    /// Count one evaluation outcome.
    pub fn record_evaluation(&mut self, discriminative: bool, contradicts: bool) {
        self.stats.evaluations += 1;
        if !discriminative {
            self.stats.non_discriminative += 1;
        }
        if contradicts {
            self.stats.contradictions += 1;
        }
    }

    #[must_use]
    pub fn non_discriminative_ratio(&self) -> f64 {
        ratio(self.stats.non_discriminative, self.stats.evaluations)
    }

    #[must_use]
    pub fn contradiction_density(&self) -> f64 {
        ratio(self.stats.contradictions, self.stats.evaluations)
    }

    /// Raise the UND floor (never lowers it).
    pub fn elevate_und_floor(&mut self, floor: f64) {
        self.und_floor = self.und_floor.max(floor.clamp(0.0, RESIDUAL_MAX));
    }

    /// Fold the evaluated root's slot weights into its log odds and move its
    /// share of named mass toward the softmax proposal.
    pub fn apply(
        &mut self,
        set: &mut HypothesisSet,
        arena: &NodeArena,
        config: &SessionConfig,
        policy: &Policy,
        root_id: &str,
        signal: &UpdateSignal<'_>,
    ) -> LedgerUpdate {
        let obligations: Vec<(String, String)> = set
            .root(root_id)
            .map(|root| {
                config
                    .required_slots
                    .iter()
                    .filter_map(|slot| {
                        root.obligations
                            .get(&slot.key)
                            .map(|node| (slot.key.clone(), node.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut slots = Vec::with_capacity(obligations.len());
        let mut total_delta = 0.0;
        for (slot, node_key) in obligations {
            let Some(node) = arena.get(&node_key) else {
                continue;
            };
            let p = node.p.clamp(f64::MIN_POSITIVE, 1.0);
            let w_new = (p / 0.5).ln().clamp(-config.w_max, config.w_max);
            let w_prev = self.applied.get(&node_key).copied().unwrap_or(0.0);
            let mut delta = w_new - w_prev;
            let touched = slot == signal.slot_key;

            let non_discriminative_clip = touched && signal.non_discriminative;
            if non_discriminative_clip {
                delta = delta.clamp(-policy.epsilon_nc, policy.epsilon_nc);
            }
            let contradiction_floor = touched && signal.contradiction_validity.is_some();
            if let Some(validity) = signal.contradiction_validity.filter(|_| touched) {
                delta = delta.min(-policy.contradiction_kappa * validity);
            }

            self.applied.insert(node_key, w_prev + delta);
            total_delta += delta;
            slots.push(SlotWeight {
                slot,
                w_new,
                w_prev,
                delta,
                non_discriminative_clip,
                contradiction_floor,
            });
        }

        let log_odds = self.log_ledger.entry(root_id.to_string()).or_insert(0.0);
        *log_odds += config.beta * total_delta;
        let log_odds = *log_odds;

        let active = set.active_ids();
        let named_mass = set.active_mass();
        let proposal = softmax(&self.log_ledger, &active);
        let p_base = if named_mass > 0.0 {
            set.mass(root_id) / named_mass
        } else {
            #[allow(clippy::cast_precision_loss)]
            let equal = 1.0 / active.len().max(1) as f64;
            equal
        };
        let p_prop = proposal.get(root_id).copied().unwrap_or(0.0);
        let p_damped = (1.0 - config.alpha).mul_add(p_base, config.alpha * p_prop);

        if named_mass > 0.0 && active.iter().any(|id| id == root_id) {
            let others: Vec<&String> = active.iter().filter(|id| *id != root_id).collect();
            let others_mass: f64 = others.iter().map(|id| set.mass(id)).sum();
            let new_mass = p_damped * named_mass;
            let remaining = (named_mass - new_mass).max(0.0);
            set.set_mass(root_id, new_mass);
            let proposed = |id: &str| proposal.get(id).copied().unwrap_or(0.0);
            let proposal_mass: f64 = others.iter().map(|id| proposed(id)).sum();
            for id in &others {
                #[allow(clippy::cast_precision_loss)]
                let share = if others_mass > 0.0 {
                    set.mass(id) / others_mass
                } else if proposal_mass > 0.0 {
                    proposed(id) / proposal_mass
                } else {
                    1.0 / others.len() as f64
                };
                set.set_mass(id, remaining * share);
            }
        }

        LedgerUpdate {
            root_id: root_id.to_string(),
            slots,
            log_odds,
            p_base,
            p_prop,
            p_damped,
        }
    }

    /// Recompute `H_NOA`/`H_UND` from mismatch and underdetermination and
    /// hand the rest to active named roots. `None` in a closed world.
    pub fn recompute_residuals(
        &self,
        set: &mut HypothesisSet,
        arena: &NodeArena,
        config: &SessionConfig,
        policy: &Policy,
        abstention_floor: f64,
    ) -> Option<ResidualUpdate> {
        if set.world == WorldMode::Closed {
            return None;
        }

        let mut mismatch: Option<f64> = None;
        let mut invalidity = Vec::new();
        for root in set.roots().filter(|root| !root.retired) {
            let nodes: Vec<_> = config
                .required_slots
                .iter()
                .filter_map(|slot| root.obligations.get(&slot.key))
                .filter_map(|key| arena.get(key))
                .collect();
            if nodes.is_empty() {
                continue;
            }
            #[allow(clippy::cast_precision_loss)]
            let mean = nodes.iter().map(|n| (1.0 - n.p) * n.k).sum::<f64>() / nodes.len() as f64;
            mismatch = Some(mismatch.map_or(mean, |m| m.min(mean)));
            invalidity.extend(nodes.iter().filter(|n| n.assessed).map(|n| 1.0 - n.validity));
        }
        let mismatch = mismatch.unwrap_or(0.0);
        #[allow(clippy::cast_precision_loss)]
        let mut underdetermination = if invalidity.is_empty() {
            0.0
        } else {
            invalidity.iter().sum::<f64>() / invalidity.len() as f64
        };
        if policy.strict_contrastive {
            underdetermination += 0.5 * self.non_discriminative_ratio();
        }

        let mut gamma_noa = RESIDUAL_SIGNAL_WEIGHT
            .mul_add(mismatch, config.gamma_noa)
            .clamp(RESIDUAL_MIN, RESIDUAL_MAX);
        let mut gamma_und = RESIDUAL_SIGNAL_WEIGHT
            .mul_add(underdetermination, config.gamma_und)
            .clamp(RESIDUAL_MIN, RESIDUAL_MAX)
            .max(abstention_floor)
            .max(self.und_floor);
        let residual = gamma_noa + gamma_und;
        if residual > 1.0 {
            gamma_noa /= residual;
            gamma_und /= residual;
        }

        let retired: f64 = set
            .roots()
            .filter(|root| root.retired)
            .map(|root| set.mass(&root.root_id))
            .sum();
        let remaining = (1.0 - gamma_noa - gamma_und - retired).max(0.0);
        let active = set.active_ids();
        let prior: f64 = active.iter().map(|id| set.mass(id)).sum();
        for id in &active {
            #[allow(clippy::cast_precision_loss)]
            let share = if prior > 0.0 {
                set.mass(id) / prior
            } else {
                1.0 / active.len() as f64
            };
            set.set_mass(id, remaining * share);
        }
        set.set_mass(H_NOA, gamma_noa);
        set.set_mass(H_UND, gamma_und);

        Some(ResidualUpdate {
            mismatch,
            underdetermination,
            abstention_floor,
            und_floor: self.und_floor,
            gamma_noa,
            gamma_und,
        })
    }
}
