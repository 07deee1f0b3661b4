//! Pair adjudication: directional, evidence-weighted support per unordered
//! root pair, with an optional active set of top-mass contenders.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::canonical::{pair_key, split_pair_key};
use crate::core::policy::PairAdjudicationPolicy;
use crate::ports::DiscriminatorPayload;

/// Accumulated directional evidence on one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairRecord {
    pub pair: String,
    pub left: String,
    pub right: String,
    pub support_left: f64,
    pub support_right: f64,
    pub count_left: u32,
    pub count_right: u32,
    pub evidence_ids: BTreeSet<String>,
}

impl PairRecord {
    fn new(left: &str, right: &str) -> Self {
        Self {
            pair: pair_key(left, right),
            left: left.min(right).to_string(),
            right: left.max(right).to_string(),
            support_left: 0.0,
            support_right: 0.0,
            count_left: 0,
            count_right: 0,
            evidence_ids: BTreeSet::new(),
        }
    }

    #[must_use]
    pub const fn total_count(&self) -> u32 {
        self.count_left + self.count_right
    }

    /// `|s_left − s_right| / (s_left + s_right)`, zero without support.
    #[must_use]
    pub fn margin(&self) -> f64 {
        let total = self.support_left + self.support_right;
        if total > 0.0 {
            (self.support_left - self.support_right).abs() / total
        } else {
            0.0
        }
    }

    /// Share of directional evidence pointing the minority way.
    #[must_use]
    pub fn contradiction_density(&self) -> f64 {
        let total = self.total_count();
        if total == 0 {
            0.0
        } else {
            f64::from(self.count_left.min(self.count_right)) / f64::from(total)
        }
    }

    /// Member with more support, if any.
    #[must_use]
    pub fn leader(&self) -> Option<(&str, &str)> {
        if self.support_left > self.support_right {
            Some((self.left.as_str(), self.right.as_str()))
        } else if self.support_right > self.support_left {
            Some((self.right.as_str(), self.left.as_str()))
        } else {
            None
        }
    }

    fn involves(&self, root: &str) -> bool {
        self.left == root || self.right == root
    }
}

/// Adjudication state of one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PairResolution {
    Unresolved { reason: String },
    Resolved { winner: String, loser: String, margin: f64 },
}

impl PairResolution {
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }
}

/// Resolve a pair record against thresholds.
#[must_use]
pub fn resolve(record: &PairRecord, policy: &PairAdjudicationPolicy) -> PairResolution {
    if record.total_count() < policy.min_directional_evidence {
        return PairResolution::Unresolved {
            reason: format!(
                "{} of {} directional items",
                record.total_count(),
                policy.min_directional_evidence
            ),
        };
    }
    let margin = record.margin();
    if margin < policy.min_margin {
        return PairResolution::Unresolved {
            reason: format!("margin {margin:.3} below {:.3}", policy.min_margin),
        };
    }
    let density = record.contradiction_density();
    if density > policy.max_contradiction_density {
        return PairResolution::Unresolved {
            reason: format!(
                "contradiction density {density:.3} above {:.3}",
                policy.max_contradiction_density
            ),
        };
    }
    match record.leader() {
        Some((winner, loser)) => PairResolution::Resolved {
            winner: winner.to_string(),
            loser: loser.to_string(),
            margin,
        },
        None => PairResolution::Unresolved {
            reason: "no leader".to_string(),
        },
    }
}

/// Pair ledger for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairLedger {
    records: BTreeMap<String, PairRecord>,
    active_set: Vec<String>,
    locked: bool,
    pruned: BTreeSet<String>,
    /// Most active pairs the total budget can fund.
    pair_cap: usize,
}

impl PairLedger {
    /// Empty records for every unordered pair of `roots`.
    #[must_use]
    pub fn new(roots: &[String], credits: u32, policy: &PairAdjudicationPolicy) -> Self {
        let mut records = BTreeMap::new();
        for (idx, left) in roots.iter().enumerate() {
            for right in &roots[idx + 1..] {
                let record = PairRecord::new(left, right);
                records.insert(record.pair.clone(), record);
            }
        }
        let per_pair = policy.min_directional_evidence.max(1);
        Self {
            records,
            active_set: Vec::new(),
            locked: false,
            pruned: BTreeSet::new(),
            pair_cap: usize::try_from(credits / per_pair).unwrap_or(usize::MAX).max(1),
        }
    }

    #[must_use]
    pub fn record(&self, pair: &str) -> Option<&PairRecord> {
        self.records.get(pair)
    }

    #[must_use]
    pub fn active_set(&self) -> &[String] {
        &self.active_set
    }

    #[must_use]
    pub const fn pair_cap(&self) -> usize {
        self.pair_cap
    }

    fn is_live(&self, record: &PairRecord) -> bool {
        !self.pruned.contains(&record.left) && !self.pruned.contains(&record.right)
    }

    /// Pairs whose members are both still contenders.
    pub fn live_records(&self) -> impl Iterator<Item = &PairRecord> {
        self.records.values().filter(|record| self.is_live(record))
    }

    /// Fold discriminator payloads into pair support. Payloads without
    /// evidence ids or strength carry no directional weight. Returns the
    /// touched pair keys.
    pub fn accumulate(&mut self, payloads: &[DiscriminatorPayload]) -> Vec<String> {
        let mut touched = BTreeSet::new();
        for payload in payloads {
            if payload.strength <= 0.0 || payload.evidence_ids.is_empty() {
                continue;
            }
            let Some((a, b)) = split_pair_key(&payload.pair) else {
                continue;
            };
            let key = pair_key(a, b);
            if self.pruned.contains(a) || self.pruned.contains(b) {
                continue;
            }
            let Some(record) = self.records.get_mut(&key) else {
                continue;
            };
            if payload.favors == record.left {
                record.support_left += payload.strength;
                record.count_left += 1;
            } else {
                record.support_right += payload.strength;
                record.count_right += 1;
            }
            record.evidence_ids.extend(payload.evidence_ids.iter().cloned());
            touched.insert(key);
        }
        touched.into_iter().collect()
    }

    #[must_use]
    pub fn resolution(&self, pair: &str, policy: &PairAdjudicationPolicy) -> Option<PairResolution> {
        self.records.get(pair).map(|record| resolve(record, policy))
    }

    /// Pairs in adjudication scope: all pairs of the active set in rank
    /// order, capped to what the budget can fund.
    #[must_use]
    pub fn active_pairs(&self) -> Vec<String> {
        let mut pairs = Vec::new();
        for (idx, left) in self.active_set.iter().enumerate() {
            for right in &self.active_set[idx + 1..] {
                let key = pair_key(left, right);
                if self.records.get(&key).is_some_and(|r| self.is_live(r)) {
                    pairs.push(key);
                }
            }
        }
        pairs.truncate(self.pair_cap);
        pairs
    }

    /// Active pairs still unresolved, in scope order.
    #[must_use]
    pub fn unresolved_active(&self, policy: &PairAdjudicationPolicy) -> Vec<String> {
        self.active_pairs()
            .into_iter()
            .filter(|pair| {
                !self
                    .resolution(pair, policy)
                    .is_some_and(|r| r.is_resolved())
            })
            .collect()
    }

    /// Resolved share of active pairs (1.0 when there are none).
    #[must_use]
    pub fn coverage(&self, policy: &PairAdjudicationPolicy) -> f64 {
        let active = self.active_pairs();
        if active.is_empty() {
            return 1.0;
        }
        let unresolved = self.unresolved_active(policy).len();
        #[allow(clippy::cast_precision_loss)]
        let coverage = (active.len() - unresolved) as f64 / active.len() as f64;
        coverage
    }

    /// Share of live pairs with no discriminator evidence at all.
    #[must_use]
    pub fn frame_adequacy_gap(&self) -> f64 {
        let (mut total, mut empty) = (0_usize, 0_usize);
        for record in self.live_records() {
            total += 1;
            if record.total_count() == 0 {
                empty += 1;
            }
        }
        if total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let gap = empty as f64 / total as f64;
        gap
    }

    /// Recompute the active set from roots ranked by mass. A sticky lock
    /// holds the current set while any of its pairs is unresolved. Returns
    /// whether the set changed.
    pub fn refresh_active_set(&mut self, ranked: &[String], policy: &PairAdjudicationPolicy) -> bool {
        let live: Vec<String> = ranked
            .iter()
            .filter(|id| !self.pruned.contains(*id))
            .cloned()
            .collect();
        let next = if policy.active_set_enabled {
            let current_live = self.active_set.len() >= 2
                && self.active_set.iter().all(|id| !self.pruned.contains(id));
            if policy.sticky_lock
                && self.locked
                && current_live
                && !self.unresolved_active(policy).is_empty()
            {
                return false;
            }
            self.locked = policy.sticky_lock;
            live.into_iter().take(policy.active_set_size.max(2)).collect()
        } else {
            live
        };
        if next == self.active_set {
            return false;
        }
        self.active_set = next;
        true
    }

    /// `(wins, decisive_losses)` of a root over resolved live pairs; a loss
    /// is decisive when its margin reaches `min_loss_margin`.
    #[must_use]
    pub fn tally(
        &self,
        root: &str,
        policy: &PairAdjudicationPolicy,
        min_loss_margin: f64,
    ) -> (u32, u32) {
        let (mut wins, mut losses) = (0, 0);
        for record in self.live_records().filter(|r| r.involves(root)) {
            if let PairResolution::Resolved { winner, margin, .. } = resolve(record, policy) {
                if winner == root {
                    wins += 1;
                } else if margin >= min_loss_margin {
                    losses += 1;
                }
            }
        }
        (wins, losses)
    }

    /// Drop a retired root from adjudication.
    pub fn prune_root(&mut self, root: &str) {
        self.pruned.insert(root.to_string());
        self.active_set.retain(|id| id != root);
    }
}
