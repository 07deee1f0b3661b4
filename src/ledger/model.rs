//! Root hypotheses and the probability ledger over them.
//!
//! **Invariant:** after [`HypothesisSet::enforce_invariants`] every ledger
//! value lies in `[0, 1]` and the values sum to one within `1e-9`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::canonical::canonical_id;
use crate::core::config::{H_NOA, H_UND, RootSpec, SessionConfig, WorldMode};
use crate::core::errors::{AbxError, Result};
use crate::tree::node::DEFAULT_K;

/// Allowed absolute drift of the ledger sum.
pub const SUM_TOLERANCE: f64 = 1e-9;
/// Drift above this is reported as a correction rather than rounding noise.
pub const CORRECTION_REPORT_THRESHOLD: f64 = 1e-6;
/// Mass left on a retired contender.
pub const RETIRED_MASS_FLOOR: f64 = 1e-6;

/// Scoping state of a root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RootStatus {
    #[default]
    Unscoped,
    Scoped,
}

/// A named candidate explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootHypothesis {
    pub root_id: String,
    pub statement: String,
    pub exclusion_clause: String,
    pub canonical_id: String,
    pub status: RootStatus,
    pub k_root: f64,
    pub credits_spent: u32,
    /// Required slot key → node key.
    pub obligations: BTreeMap<String, String>,
    /// Scoping was attempted and failed; the root is not re-scoped.
    pub scoping_failed: bool,
    pub retired: bool,
    /// Member roots when this root is a compositional story.
    pub components: Vec<String>,
}

impl RootHypothesis {
    /// Fresh, unscoped root from a caller spec.
    #[must_use]
    pub fn from_spec(spec: &RootSpec) -> Self {
        Self {
            root_id: spec.root_id.clone(),
            statement: spec.statement.clone(),
            exclusion_clause: spec.exclusion_clause.clone(),
            canonical_id: canonical_id(&spec.statement),
            status: RootStatus::Unscoped,
            k_root: DEFAULT_K,
            credits_spent: 0,
            obligations: BTreeMap::new(),
            scoping_failed: false,
            retired: false,
            components: spec.components.clone(),
        }
    }
}

/// Two roots whose statements normalize to the same canonical id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalCollision {
    pub canonical_id: String,
    pub roots: Vec<String>,
}

/// What [`HypothesisSet::enforce_invariants`] had to do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvariantReport {
    /// Entries that were NaN, negative or above one.
    pub clipped: Vec<String>,
    /// `|Σ − 1|` before renormalization.
    pub drift: f64,
    /// Newly detected canonical-id collisions.
    pub collisions: Vec<CanonicalCollision>,
}

impl InvariantReport {
    /// Whether the correction is large enough to audit.
    #[must_use]
    pub fn needs_correction_event(&self) -> bool {
        !self.clipped.is_empty() || self.drift > CORRECTION_REPORT_THRESHOLD
    }
}

/// Roots plus the ledger over roots and residuals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisSet {
    pub world: WorldMode,
    roots: BTreeMap<String, RootHypothesis>,
    ledger: BTreeMap<String, f64>,
    reported_collisions: BTreeSet<String>,
}

impl HypothesisSet {
    /// Allocate initial mass: residuals get `gamma_*` in open worlds and
    /// named roots share the rest equally.
    pub fn init(roots: &[RootSpec], config: &SessionConfig) -> Result<Self> {
        let mut map = BTreeMap::new();
        for spec in roots {
            if map
                .insert(spec.root_id.clone(), RootHypothesis::from_spec(spec))
                .is_some()
            {
                return Err(AbxError::config(
                    "roots.root_id",
                    format!("duplicate root id {:?}", spec.root_id),
                ));
            }
        }

        let mut ledger = BTreeMap::new();
        let count = map.len();
        match config.world_mode {
            WorldMode::Open => {
                let residual = config.gamma_noa + config.gamma_und;
                if count == 0 {
                    let (noa, und) = if residual > 0.0 {
                        (config.gamma_noa / residual, config.gamma_und / residual)
                    } else {
                        (0.5, 0.5)
                    };
                    ledger.insert(H_NOA.to_string(), noa);
                    ledger.insert(H_UND.to_string(), und);
                } else {
                    ledger.insert(H_NOA.to_string(), config.gamma_noa);
                    ledger.insert(H_UND.to_string(), config.gamma_und);
                    #[allow(clippy::cast_precision_loss)]
                    let share = (1.0 - residual) / count as f64;
                    for id in map.keys() {
                        ledger.insert(id.clone(), share);
                    }
                }
            }
            WorldMode::Closed => {
                #[allow(clippy::cast_precision_loss)]
                let share = if count == 0 { 0.0 } else { 1.0 / count as f64 };
                for id in map.keys() {
                    ledger.insert(id.clone(), share);
                }
            }
        }

        Ok(Self {
            world: config.world_mode,
            roots: map,
            ledger,
            reported_collisions: BTreeSet::new(),
        })
    }

    #[must_use]
    pub fn root(&self, root_id: &str) -> Option<&RootHypothesis> {
        self.roots.get(root_id)
    }

    pub fn root_mut(&mut self, root_id: &str) -> Option<&mut RootHypothesis> {
        self.roots.get_mut(root_id)
    }

    pub fn roots(&self) -> impl Iterator<Item = &RootHypothesis> {
        self.roots.values()
    }

    /// Ordered snapshot of the roots.
    #[must_use]
    pub fn roots_map(&self) -> BTreeMap<String, RootHypothesis> {
        self.roots.clone()
    }

    /// Ordered snapshot of the ledger.
    #[must_use]
    pub fn ledger(&self) -> &BTreeMap<String, f64> {
        &self.ledger
    }

    #[must_use]
    pub fn mass(&self, id: &str) -> f64 {
        self.ledger.get(id).copied().unwrap_or(0.0)
    }

    pub fn set_mass(&mut self, id: &str, value: f64) {
        self.ledger.insert(id.to_string(), value);
    }

    #[must_use]
    pub fn sum(&self) -> f64 {
        self.ledger.values().sum()
    }

    /// All named root ids (sorted by id).
    #[must_use]
    pub fn named_ids(&self) -> Vec<String> {
        self.roots.keys().cloned().collect()
    }

    /// Named, non-retired root ids (sorted by id).
    #[must_use]
    pub fn active_ids(&self) -> Vec<String> {
        self.roots
            .values()
            .filter(|root| !root.retired)
            .map(|root| root.root_id.clone())
            .collect()
    }

    /// Active roots in canonical-id order (the deterministic tie-break).
    #[must_use]
    pub fn active_by_canonical(&self) -> Vec<&RootHypothesis> {
        let mut roots: Vec<_> = self.roots.values().filter(|root| !root.retired).collect();
        roots.sort_by(|a, b| {
            a.canonical_id
                .cmp(&b.canonical_id)
                .then_with(|| a.root_id.cmp(&b.root_id))
        });
        roots
    }

    /// Active root ids ranked by mass descending, canonical id ascending.
    #[must_use]
    pub fn ranked_by_mass(&self) -> Vec<String> {
        let mut roots = self.active_by_canonical();
        roots.sort_by(|a, b| {
            self.mass(&b.root_id)
                .total_cmp(&self.mass(&a.root_id))
                .then_with(|| a.canonical_id.cmp(&b.canonical_id))
                .then_with(|| a.root_id.cmp(&b.root_id))
        });
        roots.into_iter().map(|root| root.root_id.clone()).collect()
    }

    /// Mass held by active named roots.
    #[must_use]
    pub fn active_mass(&self) -> f64 {
        self.roots
            .values()
            .filter(|root| !root.retired)
            .map(|root| self.mass(&root.root_id))
            .sum()
    }

    /// Clip, detect collisions, and restore sum-to-one.
    pub fn enforce_invariants(&mut self) -> InvariantReport {
        let mut report = InvariantReport::default();

        for (id, value) in &mut self.ledger {
            let clipped = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
            if clipped.to_bits() != value.to_bits() {
                report.clipped.push(id.clone());
                *value = clipped;
            }
        }

        let mut by_canonical: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for root in self.roots.values() {
            by_canonical
                .entry(root.canonical_id.as_str())
                .or_default()
                .push(root.root_id.clone());
        }
        for (canonical, roots) in by_canonical {
            if roots.len() > 1 && self.reported_collisions.insert(canonical.to_string()) {
                report.collisions.push(CanonicalCollision {
                    canonical_id: canonical.to_string(),
                    roots,
                });
            }
        }

        let sum = self.sum();
        report.drift = (sum - 1.0).abs();
        if self.ledger.is_empty() {
            report.drift = 0.0;
        } else if sum <= 0.0 {
            #[allow(clippy::cast_precision_loss)]
            let share = 1.0 / self.ledger.len() as f64;
            for value in self.ledger.values_mut() {
                *value = share;
            }
        } else if report.drift > 0.0 {
            for value in self.ledger.values_mut() {
                *value /= sum;
            }
        }
        report
    }

    /// Retire a contender: floor its mass and hand the rest to active
    /// survivors in proportion to their mass. Returns the mass moved.
    pub fn retire(&mut self, root_id: &str) -> f64 {
        let Some(root) = self.roots.get_mut(root_id) else {
            return 0.0;
        };
        if root.retired {
            return 0.0;
        }
        root.retired = true;
        let old = self.mass(root_id);
        let moved = (old - RETIRED_MASS_FLOOR).max(0.0);
        self.set_mass(root_id, old.min(RETIRED_MASS_FLOOR));

        let survivors = self.active_ids();
        let survivor_mass: f64 = survivors.iter().map(|id| self.mass(id)).sum();
        if survivors.is_empty() {
            return 0.0;
        }
        for id in &survivors {
            let share = if survivor_mass > 0.0 {
                self.mass(id) / survivor_mass
            } else {
                #[allow(clippy::cast_precision_loss)]
                let equal = 1.0 / survivors.len() as f64;
                equal
            };
            let value = self.mass(id) + moved * share;
            self.set_mass(id, value);
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(statements: &[(&str, &str)]) -> Vec<RootSpec> {
        statements
            .iter()
            .map(|(id, statement)| RootSpec::new(id, statement))
            .collect()
    }

    #[test]
    fn open_world_initial_allocation() {
        let set = HypothesisSet::init(
            &specs(&[("H1", "Mechanism A"), ("H2", "Mechanism B")]),
            &SessionConfig::default(),
        )
        .expect("init");
        assert!((set.mass("H1") - 0.40).abs() < 1e-12);
        assert!((set.mass("H2") - 0.40).abs() < 1e-12);
        assert!((set.mass(H_NOA) - 0.10).abs() < 1e-12);
        assert!((set.mass(H_UND) - 0.10).abs() < 1e-12);
        assert!((set.sum() - 1.0).abs() <= SUM_TOLERANCE);
    }

    #[test]
    fn closed_world_has_no_residuals() {
        let config = SessionConfig {
            world_mode: WorldMode::Closed,
            ..SessionConfig::default()
        };
        let set = HypothesisSet::init(&specs(&[("H1", "a"), ("H2", "b"), ("H3", "c")]), &config)
            .expect("init");
        assert!(!set.ledger().contains_key(H_NOA));
        assert!((set.sum() - 1.0).abs() <= SUM_TOLERANCE);
    }

    #[test]
    fn open_world_without_named_roots_is_all_residual() {
        let set = HypothesisSet::init(&[], &SessionConfig::default()).expect("init");
        assert!((set.mass(H_NOA) - 0.5).abs() < 1e-12);
        assert!((set.sum() - 1.0).abs() <= SUM_TOLERANCE);
    }

    #[test]
    fn enforce_clips_and_renormalizes() {
        let mut set = HypothesisSet::init(
            &specs(&[("H1", "a"), ("H2", "b")]),
            &SessionConfig::default(),
        )
        .expect("init");
        set.set_mass("H1", -0.2);
        set.set_mass("H2", f64::NAN);
        let report = set.enforce_invariants();
        assert_eq!(report.clipped, vec!["H1".to_string(), "H2".to_string()]);
        assert!(report.needs_correction_event());
        assert!((set.sum() - 1.0).abs() <= SUM_TOLERANCE);
        assert!(set.ledger().values().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn collisions_are_reported_once() {
        let mut set = HypothesisSet::init(
            &specs(&[("H1", "Valve failed"), ("H2", "valve  FAILED.")]),
            &SessionConfig::default(),
        )
        .expect("init");
        let first = set.enforce_invariants();
        assert_eq!(first.collisions.len(), 1);
        assert_eq!(first.collisions[0].roots, vec!["H1".to_string(), "H2".to_string()]);
        assert!(set.enforce_invariants().collisions.is_empty());
    }

    #[test]
    fn retirement_moves_mass_to_survivors() {
        let mut set = HypothesisSet::init(
            &specs(&[("H1", "a"), ("H2", "b"), ("H3", "c")]),
            &SessionConfig::default(),
        )
        .expect("init");
        set.set_mass("H1", 0.5);
        set.set_mass("H2", 0.2);
        set.set_mass("H3", 0.1);
        let moved = set.retire("H3");
        assert!((moved - (0.1 - RETIRED_MASS_FLOOR)).abs() < 1e-12);
        assert!(set.root("H3").is_some_and(|r| r.retired));
        assert!((set.sum() - 1.0).abs() < 1e-9);
        assert!(set.mass("H1") > 0.5 && set.mass("H2") > 0.2);
        assert_eq!(set.active_ids(), vec!["H1".to_string(), "H2".to_string()]);
        assert!(set.retire("H3").abs() < f64::EPSILON, "retiring twice is a no-op");
    }

    #[test]
    fn ranking_breaks_ties_by_canonical_id() {
        let set = HypothesisSet::init(
            &specs(&[("H1", "zeta"), ("H2", "alpha")]),
            &SessionConfig::default(),
        )
        .expect("init");
        let ranked = set.ranked_by_mass();
        let expected_first = if canonical_id("zeta") < canonical_id("alpha") {
            "H1"
        } else {
            "H2"
        };
        assert_eq!(ranked[0], expected_first);
    }
}
