//! Dynamic-abstention floor on the underdetermination residual.

use serde::{Deserialize, Serialize};

use crate::core::policy::DynamicAbstentionPolicy;

/// Signals the floor is blended from, each a ratio in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AbstentionSignals {
    /// Share of active pairs still unresolved.
    pub unresolved_pair_ratio: f64,
    /// Share of evaluations that came back CONTRADICTS.
    pub contradiction_density: f64,
    /// Share of tagged updates that were non-discriminative.
    pub non_discriminative_ratio: f64,
    /// Share of named-root pairs with no discriminator evidence at all.
    pub frame_adequacy_gap: f64,
}

/// Floor for `gamma_und`, or `0.0` when the policy is off.
#[must_use]
pub fn abstention_floor(policy: &DynamicAbstentionPolicy, signals: &AbstentionSignals) -> f64 {
    if !policy.enabled {
        return 0.0;
    }
    let blended = policy.weight_unresolved * signals.unresolved_pair_ratio
        + policy.weight_contradiction * signals.contradiction_density
        + policy.weight_non_discriminative
            * signals
                .non_discriminative_ratio
                .max(signals.frame_adequacy_gap);
    if blended.is_finite() {
        blended.clamp(policy.min_floor, policy.max_floor)
    } else {
        policy.max_floor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> DynamicAbstentionPolicy {
        DynamicAbstentionPolicy {
            enabled: true,
            weight_unresolved: 0.15,
            weight_contradiction: 0.10,
            weight_non_discriminative: 0.10,
            min_floor: 0.02,
            max_floor: 0.35,
        }
    }

    #[test]
    fn disabled_policy_has_no_floor() {
        let mut off = policy();
        off.enabled = false;
        let signals = AbstentionSignals {
            unresolved_pair_ratio: 1.0,
            ..AbstentionSignals::default()
        };
        assert!(abstention_floor(&off, &signals).abs() < f64::EPSILON);
    }

    #[test]
    fn blend_uses_max_of_nd_ratio_and_frame_gap() {
        let signals = AbstentionSignals {
            unresolved_pair_ratio: 1.0,
            contradiction_density: 0.5,
            non_discriminative_ratio: 0.2,
            frame_adequacy_gap: 0.6,
        };
        let expected = 0.15 + 0.05 + 0.06;
        assert!((abstention_floor(&policy(), &signals) - expected).abs() < 1e-12);
    }

    #[test]
    fn floor_is_clipped() {
        assert!((abstention_floor(&policy(), &AbstentionSignals::default()) - 0.02).abs() < 1e-12);
        let mut heavy = policy();
        heavy.weight_unresolved = 5.0;
        let signals = AbstentionSignals {
            unresolved_pair_ratio: 1.0,
            ..AbstentionSignals::default()
        };
        assert!((abstention_floor(&heavy, &signals) - 0.35).abs() < 1e-12);
    }
}
