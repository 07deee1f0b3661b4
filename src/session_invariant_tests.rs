//! Session invariant matrix: ledger, credit, node and replay invariants
//! checked over seeded randomized evaluator behavior.
//!
//! Families:
//! 1. Ledger normalization after every audited ledger change
//! 2. Credit accounting and operation-log density
//! 3. Node value ranges and unassessed defaults
//! 4. Determinism and replay equivalence
//! 5. Policy profiles never break the above
//!
//! Uses seeded RNG for reproducible randomized fixtures.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use crate::audit::replay::replay;
use crate::audit::{AuditEvent, AuditEventType};
use crate::core::canonical::pair_key;
use crate::core::config::{
    H_NOA, H_UND, PairCertificate, RootSpec, SessionConfig, SessionSpec, WorldMode,
};
use crate::core::errors::Result;
use crate::core::policy::PolicyProfile;
use crate::ledger::updater::RESIDUAL_MAX;
use crate::ports::scripted::ScriptedDecomposer;
use crate::ports::{EvaluationOutcome, EvaluationRequest, Evaluator, SessionPorts};
use crate::result::{SessionResult, StopReason};
use crate::scheduler::frontier::OpKind;
use crate::scheduler::run_session;
use crate::tree::node::{DEFAULT_K, DEFAULT_P};

// ──────────────────── seeded evaluator ────────────────────

/// Evaluator whose outcomes are drawn from a seeded RNG.
struct RandomEvaluator {
    rng: StdRng,
    roots: Vec<String>,
}

impl RandomEvaluator {
    fn new(seed: u64, roots: &[&str]) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            roots: roots.iter().map(|r| (*r).to_string()).collect(),
        }
    }
}

impl Evaluator for RandomEvaluator {
    fn evaluate(&mut self, request: &EvaluationRequest) -> Result<EvaluationOutcome> {
        let rng = &mut self.rng;
        let entailment = ["SUPPORTS", "CONTRADICTS", "NEUTRAL", "UNKNOWN"][rng.random_range(0..4)];
        let quality = ["direct", "indirect", "weak", "none"][rng.random_range(0..4)];
        let evidence_ids: Vec<String> = if rng.random_bool(0.8) {
            vec![format!("E{}", rng.random_range(1..=5))]
        } else {
            Vec::new()
        };
        let mut payloads = Vec::new();
        if self.roots.len() >= 2 && rng.random_bool(0.4) {
            let a = rng.random_range(0..self.roots.len());
            let b = (a + 1 + rng.random_range(0..self.roots.len() - 1)) % self.roots.len();
            let favors = if rng.random_bool(0.5) { a } else { b };
            payloads.push(json!({
                "pair": pair_key(&self.roots[a], &self.roots[b]),
                "favors": self.roots[favors],
                "strength": rng.random_range(0.0..=1.0),
            }));
        }
        let value = json!({
            "p": rng.random_range(0.0..=1.0),
            "rubric": {
                "A": rng.random_range(0..=2),
                "B": rng.random_range(0..=2),
                "C": rng.random_range(0..=2),
                "D": rng.random_range(0..=2),
            },
            "evidence_ids": evidence_ids,
            "discriminator_payloads": payloads,
            "entailment": entailment,
            "evidence_quality": quality,
            "reasoning_summary": format!("random outcome for {}", request.node_key),
        });
        EvaluationOutcome::from_json(&value)
    }
}

// ──────────────────── fixture builders ────────────────────

const ROOTS: [&str; 3] = ["H1", "H2", "H3"];

fn make_spec(rng: &mut StdRng, profile: PolicyProfile, world_mode: WorldMode) -> SessionSpec {
    let mut spec = SessionSpec::new(
        "Intermittent packet loss on the east link",
        vec![
            RootSpec::new("H1", "Faulty optic on the east uplink"),
            RootSpec::new("H2", "Misconfigured QoS policy drops bursts"),
            RootSpec::new("H3", "Upstream provider congestion"),
        ],
    );
    spec.config = SessionConfig {
        credits: rng.random_range(0..=30),
        tau: rng.random_range(0.5..=0.9),
        world_mode,
        profile,
        ..SessionConfig::default()
    };
    for (a, b) in [("H1", "H2"), ("H1", "H3"), ("H2", "H3")] {
        spec.mece_certificate.insert(
            pair_key(a, b),
            PairCertificate {
                overlap: 0.0,
                discriminator: format!("{a} vs {b}"),
            },
        );
    }
    spec
}

fn run_seeded(seed: u64, profile: PolicyProfile, world_mode: WorldMode, decompose: bool) -> SessionResult {
    let mut rng = StdRng::seed_from_u64(seed);
    let spec = make_spec(&mut rng, profile, world_mode);
    let mut evaluator = RandomEvaluator::new(seed ^ 0x9e37_79b9, &ROOTS);
    let mut decomposer = ScriptedDecomposer::scoping_only();
    decomposer.set_decomposition(
        "*:feasibility",
        json!({
            "ok": true,
            "type": "AND",
            "coupling": 0.8,
            "children": [
                {"child_id": "c1", "statement": "component one holds", "role": "NEC"},
                {"child_id": "c2", "statement": "component two holds", "role": "NEC"}
            ]
        }),
    );
    let mut ports = SessionPorts::new(&mut evaluator);
    if decompose {
        ports = ports.with_decomposer(&mut decomposer);
    }
    run_session(spec, &mut ports).expect("seeded session runs")
}

fn ledger_payloads(events: &[AuditEvent]) -> impl Iterator<Item = &serde_json::Value> {
    events.iter().filter_map(|event| match event.event_type {
        AuditEventType::LedgerUpdated
        | AuditEventType::ResidualsRecomputed
        | AuditEventType::LedgerCorrected
        | AuditEventType::ContenderRetired
        | AuditEventType::StopReasonSet => event.payload.get("ledger"),
        _ => None,
    })
}

fn assert_normalized(ledger: &serde_json::Value, context: &str) {
    let map = ledger.as_object().expect("ledger is an object");
    let mut sum = 0.0;
    for (id, value) in map {
        let mass = value.as_f64().expect("mass is a number");
        assert!((0.0..=1.0).contains(&mass), "{context}: {id} = {mass}");
        sum += mass;
    }
    assert!((sum - 1.0).abs() < 1e-9, "{context}: ledger sums to {sum}");
}

const PROFILES: [PolicyProfile; 4] = [
    PolicyProfile::Default,
    PolicyProfile::CausalInvestigation,
    PolicyProfile::Forecasting,
    PolicyProfile::Exploratory,
];

// ════════════════════════════════════════════════════════════
// INVARIANT FAMILY 1: Ledger normalization
// ════════════════════════════════════════════════════════════

#[test]
fn ledger_is_normalized_after_every_audited_change() {
    for seed in 0..40_u64 {
        let result = run_seeded(seed, PolicyProfile::Default, WorldMode::Open, seed % 2 == 0);
        for (idx, ledger) in ledger_payloads(&result.audit_log).enumerate() {
            assert_normalized(ledger, &format!("seed {seed} ledger #{idx}"));
        }
        assert!((result.ledger_sum() - 1.0).abs() < 1e-9, "seed {seed}");
    }
}

#[test]
fn residuals_stay_within_clip_in_open_worlds() {
    for seed in 0..25_u64 {
        let result = run_seeded(seed, PolicyProfile::Default, WorldMode::Open, false);
        for id in [H_NOA, H_UND] {
            let mass = result.ledger[id];
            assert!((0.0..=RESIDUAL_MAX + 1e-9).contains(&mass), "seed {seed}: {id} = {mass}");
        }
    }
}

#[test]
fn closed_world_never_carries_residuals() {
    for seed in 0..20_u64 {
        let result = run_seeded(seed, PolicyProfile::Default, WorldMode::Closed, seed % 3 == 0);
        assert!(!result.ledger.contains_key(H_NOA), "seed {seed}");
        assert!(!result.ledger.contains_key(H_UND), "seed {seed}");
        assert!((result.ledger_sum() - 1.0).abs() < 1e-9, "seed {seed}");
    }
}

// ════════════════════════════════════════════════════════════
// INVARIANT FAMILY 2: Credit accounting
// ════════════════════════════════════════════════════════════

#[test]
fn credits_balance_and_operation_log_is_dense() {
    for seed in 0..40_u64 {
        let result = run_seeded(seed, PolicyProfile::Default, WorldMode::Open, seed % 2 == 1);
        let budget = result.credits_remaining + result.total_credits_spent;
        let mut rng = StdRng::seed_from_u64(seed);
        let spec = make_spec(&mut rng, PolicyProfile::Default, WorldMode::Open);
        assert_eq!(budget, spec.config.credits, "seed {seed}");
        assert_eq!(
            result.operation_log.len(),
            result.total_credits_spent as usize,
            "seed {seed}"
        );
        for (idx, record) in result.operation_log.iter().enumerate() {
            assert_eq!(record.index as usize, idx, "seed {seed}");
            assert_eq!(
                record.credits_remaining_after,
                spec.config.credits - idx as u32 - 1,
                "seed {seed}"
            );
        }
        let per_root: u32 = result.roots.values().map(|r| r.credits_spent).sum();
        assert_eq!(per_root, result.total_credits_spent, "seed {seed}");
    }
}

#[test]
fn zero_credits_spends_nothing() {
    let mut spec = SessionSpec::new("c", vec![RootSpec::new("H1", "A"), RootSpec::new("H2", "B")]);
    spec.config.credits = 0;
    let mut evaluator = RandomEvaluator::new(7, &["H1", "H2"]);
    let mut ports = SessionPorts::new(&mut evaluator);
    let result = run_session(spec, &mut ports).expect("runs");
    assert_eq!(result.stop_reason, StopReason::CreditsExhausted);
    assert!(result.operation_log.is_empty());
}

#[test]
fn every_session_starts_by_scoping() {
    for seed in 0..20_u64 {
        let result = run_seeded(seed, PolicyProfile::Default, WorldMode::Open, true);
        if let Some(first) = result.operation_log.first() {
            assert_eq!(first.op.kind, OpKind::DecomposeRoot, "seed {seed}");
        }
    }
}

// ════════════════════════════════════════════════════════════
// INVARIANT FAMILY 3: Node value ranges
// ════════════════════════════════════════════════════════════

#[test]
fn node_values_stay_in_unit_interval() {
    for seed in 0..30_u64 {
        let result = run_seeded(seed, PolicyProfile::Default, WorldMode::Open, true);
        for node in result.nodes.values() {
            assert!((0.0..=1.0).contains(&node.p), "seed {seed}: {}", node.node_key);
            assert!((0.0..=1.0).contains(&node.k), "seed {seed}: {}", node.node_key);
            if !node.assessed {
                assert!((node.p - DEFAULT_P).abs() < 1e-12, "seed {seed}: {}", node.node_key);
                assert!((node.k - DEFAULT_K).abs() < 1e-12, "seed {seed}: {}", node.node_key);
            }
        }
        for root in result.roots.values() {
            assert!((0.0..=1.0).contains(&root.k_root), "seed {seed}: {}", root.root_id);
        }
    }
}

// ════════════════════════════════════════════════════════════
// INVARIANT FAMILY 4: Determinism and replay
// ════════════════════════════════════════════════════════════

#[test]
fn identical_inputs_produce_identical_traces() {
    for seed in [3_u64, 11, 29] {
        let a = run_seeded(seed, PolicyProfile::CausalInvestigation, WorldMode::Open, true);
        let b = run_seeded(seed, PolicyProfile::CausalInvestigation, WorldMode::Open, true);
        assert_eq!(a.metadata.trace_digest, b.metadata.trace_digest, "seed {seed}");
        assert_eq!(a.operation_log, b.operation_log, "seed {seed}");
    }
}

#[test]
fn replay_reproduces_seeded_sessions() {
    for seed in 0..15_u64 {
        let profile = PROFILES[(seed % 4) as usize];
        let original = run_seeded(seed, profile, WorldMode::Open, seed % 2 == 0);
        let replayed = replay(&original.audit_log).expect("replay succeeds");
        assert_eq!(replayed.stop_reason, original.stop_reason, "seed {seed}");
        assert_eq!(replayed.operation_log, original.operation_log, "seed {seed}");
        for (id, mass) in &original.ledger {
            assert!(
                (replayed.ledger[id] - mass).abs() < 1e-9,
                "seed {seed}: {id} {mass} vs {}",
                replayed.ledger[id]
            );
        }
    }
}

// ════════════════════════════════════════════════════════════
// INVARIANT FAMILY 5: Profiles
// ════════════════════════════════════════════════════════════

#[test]
fn every_profile_preserves_core_invariants() {
    for profile in PROFILES {
        for seed in 0..10_u64 {
            let result = run_seeded(seed, profile, WorldMode::Open, seed % 2 == 0);
            assert!((result.ledger_sum() - 1.0).abs() < 1e-9, "{profile} seed {seed}");
            assert_eq!(
                result.operation_log.len(),
                result.total_credits_spent as usize,
                "{profile} seed {seed}"
            );
            let stop_events = result
                .audit_log
                .iter()
                .filter(|e| e.event_type == AuditEventType::StopReasonSet)
                .count();
            assert_eq!(stop_events, 1, "{profile} seed {seed}");
            assert_eq!(
                result.audit_log.last().map(|e| e.event_type),
                Some(AuditEventType::StopReasonSet)
            );
        }
    }
}

#[test]
fn causal_profile_in_closed_world_never_spends() {
    for seed in 0..5_u64 {
        let result = run_seeded(seed, PolicyProfile::CausalInvestigation, WorldMode::Closed, true);
        assert_eq!(result.stop_reason, StopReason::PolicyConfigIncompatible, "seed {seed}");
        assert_eq!(result.total_credits_spent, 0, "seed {seed}");
    }
}

#[test]
fn forecasting_cap_bounds_every_assessed_k() {
    for seed in 0..10_u64 {
        let result = run_seeded(seed, PolicyProfile::Forecasting, WorldMode::Open, false);
        for node in result.nodes.values().filter(|n| n.entailment.is_some()) {
            assert!(node.k <= 0.80 + 1e-12, "seed {seed}: {} k={}", node.node_key, node.k);
        }
    }
}
