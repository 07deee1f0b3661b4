//! Decision contract checked at prospective closure.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::policy::{DecisionContractPolicy, PairAdjudicationPolicy};
use crate::gates::GateStatus;
use crate::gates::pairs::PairLedger;
use crate::ledger::model::HypothesisSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractCheck {
    pub status: GateStatus,
    pub winner: Option<String>,
    pub runner_up: Option<String>,
    pub winner_margin: f64,
    pub pair_coverage: f64,
    /// `None` when loser falsification is not required.
    pub loser_falsified: Option<bool>,
    pub failures: Vec<String>,
}

/// Winner margin, active-set coverage and optional loser falsification.
#[must_use]
pub fn check_decision_contract(
    set: &HypothesisSet,
    pairs: &PairLedger,
    adjudication: &PairAdjudicationPolicy,
    contract: &DecisionContractPolicy,
    falsified: &BTreeSet<String>,
) -> ContractCheck {
    let ranked = set.ranked_by_mass();
    let winner = ranked.first().cloned();
    let runner_up = ranked.get(1).cloned();
    let winner_mass = winner.as_deref().map_or(0.0, |id| set.mass(id));
    let runner_mass = runner_up.as_deref().map_or(0.0, |id| set.mass(id));
    let winner_margin = winner_mass - runner_mass;
    let pair_coverage = pairs.coverage(adjudication);

    let mut failures = Vec::new();
    if winner.is_none() {
        failures.push("no active contender".to_string());
    }
    if winner_margin < contract.min_winner_margin {
        failures.push(format!(
            "winner margin {winner_margin:.4} below {:.4}",
            contract.min_winner_margin
        ));
    }
    if pair_coverage < contract.min_pair_coverage {
        failures.push(format!(
            "pair coverage {pair_coverage:.4} below {:.4}",
            contract.min_pair_coverage
        ));
    }
    let loser_falsified = contract.require_loser_falsification.then(|| {
        runner_up
            .as_deref()
            .is_none_or(|runner| falsified.contains(runner))
    });
    if loser_falsified == Some(false) {
        failures.push(format!(
            "runner-up {} has no counterevidence probe or valid contradiction",
            runner_up.as_deref().unwrap_or_default()
        ));
    }

    ContractCheck {
        status: GateStatus::from_pass(failures.is_empty()),
        winner,
        runner_up,
        winner_margin,
        pair_coverage,
        loser_falsified,
        failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{RootSpec, SessionConfig};
    use crate::core::policy::{Policy, PolicyProfile};
    use crate::ports::DiscriminatorPayload;

    fn setup() -> (HypothesisSet, PairLedger, Policy) {
        let policy = Policy::profile_defaults(PolicyProfile::CausalInvestigation);
        let mut set = HypothesisSet::init(
            &[RootSpec::new("H1", "a"), RootSpec::new("H2", "b")],
            &SessionConfig::default(),
        )
        .expect("init");
        set.set_mass("H1", 0.6);
        set.set_mass("H2", 0.2);
        let mut pairs = PairLedger::new(&set.named_ids(), 20, &policy.pair_adjudication);
        pairs.refresh_active_set(&set.ranked_by_mass(), &policy.pair_adjudication);
        (set, pairs, policy)
    }

    fn resolve_pair(pairs: &mut PairLedger) {
        let payload = DiscriminatorPayload {
            pair: "H1|H2".into(),
            favors: "H1".into(),
            strength: 0.8,
            evidence_ids: vec!["E1".into()],
        };
        pairs.accumulate(&[payload.clone(), payload]);
    }

    #[test]
    fn unresolved_pairs_fail_coverage() {
        let (set, pairs, policy) = setup();
        let check = check_decision_contract(
            &set,
            &pairs,
            &policy.pair_adjudication,
            &policy.decision_contract,
            &BTreeSet::from(["H2".to_string()]),
        );
        assert_eq!(check.status, GateStatus::Failed);
        assert!(check.pair_coverage.abs() < f64::EPSILON);
        assert_eq!(check.winner.as_deref(), Some("H1"));
    }

    #[test]
    fn loser_must_be_falsified_when_required() {
        let (set, mut pairs, policy) = setup();
        resolve_pair(&mut pairs);
        let unprobed = check_decision_contract(
            &set,
            &pairs,
            &policy.pair_adjudication,
            &policy.decision_contract,
            &BTreeSet::new(),
        );
        assert_eq!(unprobed.loser_falsified, Some(false));
        assert_eq!(unprobed.failures.len(), 1);

        let probed = check_decision_contract(
            &set,
            &pairs,
            &policy.pair_adjudication,
            &policy.decision_contract,
            &BTreeSet::from(["H2".to_string()]),
        );
        assert_eq!(probed.status, GateStatus::Passed, "{:?}", probed.failures);
    }

    #[test]
    fn thin_margin_fails() {
        let (mut set, mut pairs, policy) = setup();
        resolve_pair(&mut pairs);
        set.set_mass("H2", 0.55);
        let check = check_decision_contract(
            &set,
            &pairs,
            &policy.pair_adjudication,
            &policy.decision_contract,
            &BTreeSet::from(["H2".to_string()]),
        );
        assert!(check.failures.iter().any(|f| f.contains("winner margin")));
    }
}
