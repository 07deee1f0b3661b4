//! Rubric → confidence mapping and the outcome caps layered on top of it.
//!
//! Caps compose by taking the minimum; the order they are checked in does
//! not matter for `k`, only for the order of the reported cap list.

use serde::{Deserialize, Serialize};

use crate::core::canonical::collapse_whitespace;
use crate::ports::{EvaluationOutcome, EvidenceItem, EvidenceQuality, Rubric};

/// Cap applied when any rubric dimension is zero.
pub const GUARDRAIL_CAP: f64 = 0.55;
/// Cap for weak/none evidence and quote-fidelity mismatches.
pub const WEAK_EVIDENCE_CAP: f64 = 0.35;
/// Cap for indirect evidence, missing evidence ids and stated assumptions.
pub const INDIRECT_EVIDENCE_CAP: f64 = 0.55;

/// Why a derived confidence was capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceCap {
    RubricZero,
    MissingEvidenceIds,
    WeakEvidence,
    IndirectEvidence,
    QuoteFidelity,
    Assumptions,
    Policy,
}

/// Result of deriving `k` for one evaluation outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceDerivation {
    pub k: f64,
    pub guardrail_applied: bool,
    pub caps: Vec<ConfidenceCap>,
}

/// Map a rubric to `(k, guardrail_applied)`.
#[must_use]
pub fn derive_k(rubric: Rubric) -> (f64, bool) {
    let k: f64 = match rubric.sum() {
        0..=1 => 0.15,
        2..=3 => 0.35,
        4..=5 => 0.55,
        6..=7 => 0.75,
        _ => 0.90,
    };
    if rubric.has_zero() {
        (k.min(GUARDRAIL_CAP), true)
    } else {
        (k, false)
    }
}

/// Every quote must appear verbatim (modulo whitespace) in the evidence item
/// it cites.
#[must_use]
pub fn quotes_are_faithful(outcome: &EvaluationOutcome, evidence: &[EvidenceItem]) -> bool {
    outcome.quotes.iter().all(|quote| {
        evidence
            .iter()
            .find(|item| item.id == quote.evidence_id)
            .is_some_and(|item| {
                let needle = collapse_whitespace(&quote.text);
                !needle.is_empty() && collapse_whitespace(&item.text).contains(&needle)
            })
    })
}

/// Derive `k` for an outcome, applying every outcome cap and the optional
/// policy cap.
#[must_use]
pub fn derive_confidence(
    outcome: &EvaluationOutcome,
    evidence: &[EvidenceItem],
    policy_cap: Option<f64>,
) -> ConfidenceDerivation {
    let mut rubric = outcome.rubric;
    let mut caps = Vec::new();
    let mut outcome_cap = 1.0_f64;

    if outcome.evidence_ids.is_empty() {
        rubric.a = 0;
        caps.push(ConfidenceCap::MissingEvidenceIds);
        outcome_cap = outcome_cap.min(INDIRECT_EVIDENCE_CAP);
    }

    let (base_k, rubric_guardrail) = derive_k(rubric);
    if rubric_guardrail {
        caps.insert(0, ConfidenceCap::RubricZero);
    }

    match outcome.evidence_quality {
        EvidenceQuality::Weak | EvidenceQuality::None => {
            caps.push(ConfidenceCap::WeakEvidence);
            outcome_cap = outcome_cap.min(WEAK_EVIDENCE_CAP);
        }
        EvidenceQuality::Indirect => {
            caps.push(ConfidenceCap::IndirectEvidence);
            outcome_cap = outcome_cap.min(INDIRECT_EVIDENCE_CAP);
        }
        EvidenceQuality::Direct => {}
    }

    if !quotes_are_faithful(outcome, evidence) {
        caps.push(ConfidenceCap::QuoteFidelity);
        outcome_cap = outcome_cap.min(WEAK_EVIDENCE_CAP);
    }

    if outcome.assumptions.iter().any(|a| !a.trim().is_empty()) {
        caps.push(ConfidenceCap::Assumptions);
        outcome_cap = outcome_cap.min(INDIRECT_EVIDENCE_CAP);
    }

    if let Some(cap) = policy_cap {
        caps.push(ConfidenceCap::Policy);
        outcome_cap = outcome_cap.min(cap);
    }

    let k = base_k.min(outcome_cap);
    ConfidenceDerivation {
        k,
        guardrail_applied: rubric_guardrail || k < base_k,
        caps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{Entailment, EvidenceQuote};
    use std::collections::BTreeMap;

    fn outcome(rubric: Rubric, quality: EvidenceQuality) -> EvaluationOutcome {
        EvaluationOutcome {
            p: 0.7,
            rubric,
            evidence_ids: vec!["E1".into()],
            discriminator_ids: Vec::new(),
            discriminator_payloads: Vec::new(),
            entailment: Entailment::Supports,
            evidence_quality: quality,
            reasoning_summary: String::new(),
            defeaters: Vec::new(),
            uncertainty_source: String::new(),
            assumptions: Vec::new(),
            quotes: Vec::new(),
            validity: None,
        }
    }

    fn item(id: &str, text: &str) -> EvidenceItem {
        EvidenceItem {
            id: id.into(),
            source: String::new(),
            text: text.into(),
            root_id: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn rubric_buckets() {
        assert!((derive_k(Rubric::new(1, 0, 0, 0)).0 - 0.15).abs() < 1e-12);
        assert!((derive_k(Rubric::new(1, 1, 1, 1)).0 - 0.55).abs() < 1e-12);
        assert!((derive_k(Rubric::new(2, 2, 1, 1)).0 - 0.75).abs() < 1e-12);
        assert!((derive_k(Rubric::new(2, 2, 2, 1)).0 - 0.75).abs() < 1e-12);
        assert!((derive_k(Rubric::new(1, 1, 1, 0)).0 - 0.35).abs() < 1e-12);
    }

    #[test]
    fn full_rubric_with_evidence_reaches_090_without_guardrail() {
        let derived = derive_confidence(
            &outcome(Rubric::new(2, 2, 2, 2), EvidenceQuality::Direct),
            &[],
            None,
        );
        assert!((derived.k - 0.90).abs() < 1e-12);
        assert!(!derived.guardrail_applied);
        assert!(derived.caps.is_empty());
    }

    #[test]
    fn zero_dimension_caps_and_flags() {
        let (k, guardrail) = derive_k(Rubric::new(2, 2, 0, 1));
        assert!(k <= GUARDRAIL_CAP);
        assert!(guardrail);
        let (k, guardrail) = derive_k(Rubric::new(2, 2, 2, 0));
        assert!((k - 0.55).abs() < 1e-12, "sum 6 with a zero is capped to 0.55");
        assert!(guardrail);
    }

    #[test]
    fn missing_evidence_ids_force_a_to_zero() {
        let mut raw = outcome(Rubric::new(2, 2, 2, 2), EvidenceQuality::Direct);
        raw.evidence_ids.clear();
        let derived = derive_confidence(&raw, &[], None);
        assert!(derived.k <= INDIRECT_EVIDENCE_CAP);
        assert!(derived.guardrail_applied);
        assert!(derived.caps.contains(&ConfidenceCap::MissingEvidenceIds));
        assert!(derived.caps.contains(&ConfidenceCap::RubricZero));
    }

    #[test]
    fn evidence_quality_caps() {
        let weak = derive_confidence(
            &outcome(Rubric::new(2, 2, 2, 2), EvidenceQuality::Weak),
            &[],
            None,
        );
        assert!((weak.k - WEAK_EVIDENCE_CAP).abs() < 1e-12);
        let indirect = derive_confidence(
            &outcome(Rubric::new(2, 2, 2, 2), EvidenceQuality::Indirect),
            &[],
            None,
        );
        assert!((indirect.k - INDIRECT_EVIDENCE_CAP).abs() < 1e-12);
        assert!(indirect.guardrail_applied);
    }

    #[test]
    fn quote_mismatch_caps_at_035() {
        let mut raw = outcome(Rubric::new(2, 2, 2, 2), EvidenceQuality::Direct);
        raw.quotes = vec![EvidenceQuote {
            evidence_id: "E1".into(),
            text: "valve   closed".into(),
        }];
        let evidence = [item("E1", "The valve closed at 04:12.")];
        let faithful = derive_confidence(&raw, &evidence, None);
        assert!((faithful.k - 0.90).abs() < 1e-12);

        raw.quotes[0].text = "valve opened".into();
        let mismatched = derive_confidence(&raw, &evidence, None);
        assert!((mismatched.k - WEAK_EVIDENCE_CAP).abs() < 1e-12);
        assert!(mismatched.caps.contains(&ConfidenceCap::QuoteFidelity));
    }

    #[test]
    fn assumptions_and_policy_caps_compose_by_minimum() {
        let mut raw = outcome(Rubric::new(2, 2, 2, 2), EvidenceQuality::Direct);
        raw.assumptions = vec!["sensor calibrated".into()];
        let derived = derive_confidence(&raw, &[], Some(0.8));
        assert!((derived.k - INDIRECT_EVIDENCE_CAP).abs() < 1e-12);
        let policy_only = derive_confidence(
            &outcome(Rubric::new(2, 2, 2, 2), EvidenceQuality::Direct),
            &[],
            Some(0.8),
        );
        assert!((policy_only.k - 0.8).abs() < 1e-12);
    }
}
