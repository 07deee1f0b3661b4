//! Contender retirement: roots that keep losing decisive adjudications and
//! never win one leave the contest.

use serde::{Deserialize, Serialize};

use crate::core::policy::{PairAdjudicationPolicy, RetirementPolicy};
use crate::gates::pairs::PairLedger;
use crate::ledger::model::HypothesisSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetirementCandidate {
    pub root_id: String,
    pub losses: u32,
}

/// Roots to retire now, in canonical order. At least one contender always
/// survives.
#[must_use]
pub fn retirement_candidates(
    set: &HypothesisSet,
    pairs: &PairLedger,
    adjudication: &PairAdjudicationPolicy,
    policy: &RetirementPolicy,
) -> Vec<RetirementCandidate> {
    if !policy.enabled {
        return Vec::new();
    }
    let active = set.active_by_canonical();
    let mut survivors = active.len();
    let mut out = Vec::new();
    for root in active {
        if survivors <= 1 {
            break;
        }
        let (wins, losses) = pairs.tally(&root.root_id, adjudication, policy.min_margin);
        if wins == 0 && losses >= policy.min_losses {
            survivors -= 1;
            out.push(RetirementCandidate {
                root_id: root.root_id.clone(),
                losses,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{RootSpec, SessionConfig};
    use crate::core::policy::{Policy, PolicyProfile};
    use crate::ports::DiscriminatorPayload;

    fn payload(pair: &str, favors: &str) -> DiscriminatorPayload {
        DiscriminatorPayload {
            pair: pair.into(),
            favors: favors.into(),
            strength: 0.9,
            evidence_ids: vec!["E1".into()],
        }
    }

    #[test]
    fn repeated_decisive_losses_retire_a_contender() {
        let policy = Policy::profile_defaults(PolicyProfile::CausalInvestigation);
        let set = HypothesisSet::init(
            &[RootSpec::new("H1", "a"), RootSpec::new("H2", "b"), RootSpec::new("H3", "c")],
            &SessionConfig::default(),
        )
        .expect("init");
        let mut pairs = PairLedger::new(&set.named_ids(), 20, &policy.pair_adjudication);
        pairs.accumulate(&[
            payload("H1|H3", "H1"),
            payload("H1|H3", "H1"),
            payload("H2|H3", "H2"),
            payload("H2|H3", "H2"),
        ]);
        let retired =
            retirement_candidates(&set, &pairs, &policy.pair_adjudication, &policy.retirement);
        assert_eq!(
            retired,
            vec![RetirementCandidate {
                root_id: "H3".into(),
                losses: 2
            }]
        );

        let mut disabled = policy.retirement.clone();
        disabled.enabled = false;
        assert!(retirement_candidates(&set, &pairs, &policy.pair_adjudication, &disabled).is_empty());
    }

    #[test]
    fn last_contender_is_never_retired() {
        let mut policy = Policy::profile_defaults(PolicyProfile::CausalInvestigation);
        policy.retirement.min_losses = 1;
        let set = HypothesisSet::init(
            &[RootSpec::new("H1", "a"), RootSpec::new("H2", "b")],
            &SessionConfig::default(),
        )
        .expect("init");
        let mut pairs = PairLedger::new(&set.named_ids(), 20, &policy.pair_adjudication);
        pairs.accumulate(&[payload("H1|H2", "H1"), payload("H1|H2", "H1")]);
        let retired =
            retirement_candidates(&set, &pairs, &policy.pair_adjudication, &policy.retirement);
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].root_id, "H2");
    }
}
