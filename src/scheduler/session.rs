//! Session context object and the scheduler run loop.
//!
//! A [`Session`] owns every piece of mutable state for one run: hypothesis
//! set, node arena, ledger updater, pair ledger and audit trail. Nothing
//! crosses sessions. Each loop iteration executes at most one operation and
//! finishes all of its ledger and audit side effects before the next one is
//! selected.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::{AuditEventType, AuditLog};
use crate::confidence::derive_confidence;
use crate::core::canonical::split_pair_key;
use crate::core::config::{H_UND, RunMode, SessionSpec, WorldMode};
use crate::core::errors::{AbxError, Result};
use crate::core::policy::{ContenderSpaceMode, Policy};
use crate::gates::contender::{ContenderCheck, expand_stories, validate_contender_space};
use crate::gates::contract::check_decision_contract;
use crate::gates::mece::{check_certificate, validate_certificate_keys};
use crate::gates::pairs::{PairLedger, resolve};
use crate::gates::retirement::retirement_candidates;
use crate::gates::{GateKind, GateSnapshot, GateStatus};
use crate::ledger::abstention::{AbstentionSignals, abstention_floor};
use crate::ledger::model::HypothesisSet;
use crate::ledger::updater::{LedgerUpdater, RESIDUAL_MAX, UpdateSignal};
use crate::ports::{
    DecomposeTarget, Decomposition, Entailment, EvaluationContext, EvaluationOutcome,
    EvaluationRequest, EvidenceItem, OpPurpose, ScopingDecomposition, SessionPorts,
};
use crate::result::{
    OperationRecord, PairSummary, RootExplanation, SessionMetadata, SessionResult,
    SlotExplanation, StopReason,
};
use crate::scheduler::frontier::{
    Candidate, FrontierContext, OpKind, Operation, compute_frontier, evaluate_op, legal_op,
    nec_gaps, root_is_confident, score, select,
};
use crate::scheduler::recommend::{is_epistemically_exhausted, recommend};
use crate::tree::node::{NodeArena, slot_of};
use crate::tree::obligations::{
    ScopingOutcome, decompose_node, decompose_root, materialize_slot, propagate_from,
    refresh_root_k,
};

/// Port response recorded in `OP_EXECUTED`; the sole input replay needs to
/// serve an operation again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "port", content = "payload", rename_all = "snake_case")]
pub enum PortResponse {
    Evaluator(EvaluationOutcome),
    Decomposer(Decomposition),
}

fn missing(what: &str, key: &str) -> AbxError {
    AbxError::Runtime {
        details: format!("{what} {key} is not part of the session"),
    }
}

/// Bare slot name of a node key (`H1:feasibility:c01` → `feasibility`).
fn bare_slot(node_key: &str) -> &str {
    slot_of(node_key)
        .and_then(|slot| slot.split_once(':'))
        .map_or("", |(_, slot)| slot)
}

/// One abductive-reasoning session.
#[derive(Debug)]
pub struct Session {
    /// Spec as supplied (before story expansion); replay starts from it.
    spec: SessionSpec,
    policy: Policy,
    set: HypothesisSet,
    arena: NodeArena,
    updater: LedgerUpdater,
    pairs: PairLedger,
    audit: AuditLog,
    evidence: Vec<EvidenceItem>,
    credits_remaining: u32,
    total_spent: u32,
    op_log: Vec<OperationRecord>,
    gate_snapshots: Vec<GateSnapshot>,
    contender: ContenderCheck,
    tau_effective: f64,
    last_root: Option<String>,
    probes_used: u32,
    discriminators_used: u32,
    /// Roots that received a counterevidence probe or a valid contradiction.
    falsified: BTreeSet<String>,
    target_pair: Option<String>,
}

impl Session {
    /// Validate the spec, resolve the policy and allocate initial mass.
    /// Every configuration error surfaces here, before any credit is spent.
    pub fn new(spec: SessionSpec) -> Result<Self> {
        spec.validate()?;
        let policy = Policy::resolve(spec.config.profile, &spec.config.policy)?;

        let space = &policy.contender_space;
        let (roots, expanded) =
            if space.mode == ContenderSpaceMode::Compositional && space.auto_expand {
                expand_stories(&spec.roots, space.max_cardinality)
            } else {
                (spec.roots.clone(), Vec::new())
            };
        let contender = validate_contender_space(&roots, space, expanded);

        let known: BTreeSet<String> = roots.iter().map(|root| root.root_id.clone()).collect();
        validate_certificate_keys(&spec.mece_certificate, &known)?;

        let set = HypothesisSet::init(&roots, &spec.config)?;
        let updater = LedgerUpdater::new(&set);
        let pairs = PairLedger::new(
            &set.named_ids(),
            spec.config.credits,
            &policy.pair_adjudication,
        );
        let tau_effective = policy
            .confidence_cap
            .map_or(spec.config.tau, |cap| spec.config.tau.min(cap));

        Ok(Self {
            evidence: spec.evidence.clone(),
            credits_remaining: spec.config.credits,
            spec,
            policy,
            set,
            arena: NodeArena::new(),
            updater,
            pairs,
            audit: AuditLog::new(),
            total_spent: 0,
            op_log: Vec::new(),
            gate_snapshots: Vec::new(),
            contender,
            tau_effective,
            last_root: None,
            probes_used: 0,
            discriminators_used: 0,
            falsified: BTreeSet::new(),
            target_pair: None,
        })
    }

    #[must_use]
    pub const fn policy(&self) -> &Policy {
        &self.policy
    }

    #[must_use]
    pub const fn hypotheses(&self) -> &HypothesisSet {
        &self.set
    }

    #[must_use]
    pub const fn credits_remaining(&self) -> u32 {
        self.credits_remaining
    }

    /// Run until a stop condition fires.
    pub fn run(mut self, ports: &mut SessionPorts<'_>) -> Result<SessionResult> {
        let payload = json!({
            "claim": self.spec.claim,
            "spec": self.spec,
            "decomposer_attached": ports.decomposer.is_some(),
            "searcher_attached": ports.searcher.is_some(),
        });
        self.emit(ports, AuditEventType::SessionInitialized, payload)?;
        let payload = json!({
            "profile": self.policy.profile,
            "policy": self.policy,
            "tau_effective": self.tau_effective,
        });
        self.emit(ports, AuditEventType::PolicyResolved, payload)?;

        if let Some(stop) = self.preflight(ports)? {
            return self.finish(ports, stop);
        }
        self.run_searches(ports)?;
        let stop = self.run_loop(ports)?;
        self.finish(ports, stop)
    }

    // ──────────────────── audit plumbing ────────────────────

    fn emit(
        &mut self,
        ports: &mut SessionPorts<'_>,
        event_type: AuditEventType,
        payload: serde_json::Value,
    ) -> Result<()> {
        let event = self.audit.record(event_type, payload);
        if let Some(sink) = ports.audit_sink.as_deref_mut() {
            sink.append(event)?;
        }
        Ok(())
    }

    fn ops_executed(&self) -> u32 {
        u32::try_from(self.op_log.len()).unwrap_or(u32::MAX)
    }

    fn snapshot(&mut self, gate: GateKind, status: GateStatus, details: serde_json::Value) {
        self.gate_snapshots.push(GateSnapshot {
            gate,
            status,
            at_operation: self.ops_executed(),
            details,
        });
    }

    fn frontier_context(&self, decomposer_attached: bool) -> FrontierContext<'_> {
        FrontierContext {
            config: &self.spec.config,
            tau_effective: self.tau_effective,
            decomposer_attached,
        }
    }

    // ──────────────────── preflight ────────────────────

    fn preflight(&mut self, ports: &mut SessionPorts<'_>) -> Result<Option<StopReason>> {
        let check = json!(self.contender);
        let status = self.contender.status;
        self.emit(ports, AuditEventType::ContenderSpaceChecked, check.clone())?;
        self.snapshot(GateKind::ContenderSpace, status, check);
        if !status.passed() {
            return Ok(Some(StopReason::PolicyConfigIncompatible));
        }

        let mut failures = Vec::new();
        if self.policy.decision_contract.enabled && self.set.world == WorldMode::Closed {
            failures.push("decision contract requires open-world underdetermination mass");
        }
        let status = GateStatus::from_pass(failures.is_empty());
        let details = json!({ "status": status, "failures": failures });
        self.emit(ports, AuditEventType::PolicyCompatibilityChecked, details.clone())?;
        self.snapshot(GateKind::PolicyCompatibility, status, details);
        if !status.passed() {
            return Ok(Some(StopReason::PolicyConfigIncompatible));
        }

        if self.policy.mece.strict {
            let check = check_certificate(
                &self.spec.mece_certificate,
                &self.set.named_ids(),
                self.policy.mece.max_pair_overlap,
            );
            let details = json!(check);
            self.emit(ports, AuditEventType::MeceCertificateChecked, details.clone())?;
            self.snapshot(GateKind::MeceCertificate, check.status, details);
            if !check.status.passed() {
                warn!(failures = check.failures.len(), "MECE certificate failed");
                return Ok(Some(StopReason::MeceCertificateFailed));
            }
        }

        self.enforce_invariants(ports)?;
        if self.policy.pair_adjudication.enabled {
            self.refresh_active_set(ports)?;
        }
        Ok(None)
    }

    fn run_searches(&mut self, ports: &mut SessionPorts<'_>) -> Result<()> {
        if !self.policy.search.enabled || ports.searcher.is_none() {
            return Ok(());
        }
        let limit = self.policy.search.per_root_limit;
        let queries: Vec<(String, String)> = self
            .set
            .active_by_canonical()
            .into_iter()
            .map(|root| (root.root_id.clone(), root.statement.clone()))
            .collect();
        for (root_id, query) in queries {
            let metadata = BTreeMap::from([("root_id".to_string(), root_id.clone())]);
            let Some(searcher) = ports.searcher.as_deref_mut() else {
                return Ok(());
            };
            let results = searcher.search(&query, limit, &metadata)?;
            let mut added = Vec::new();
            for item in results.iter().take(limit) {
                if self.evidence.iter().all(|known| known.id != item.id) {
                    self.evidence.push(item.clone());
                    added.push(item.id.clone());
                }
            }
            let payload = json!({
                "root_id": root_id,
                "query": query,
                "limit": limit,
                "results": results,
                "added": added,
            });
            self.emit(ports, AuditEventType::SearchExecuted, payload)?;
        }
        Ok(())
    }

    // ──────────────────── main loop ────────────────────

    fn run_loop(&mut self, ports: &mut SessionPorts<'_>) -> Result<StopReason> {
        let op_limit = self.spec.config.op_limit();
        let start_only = self.spec.config.run_mode == RunMode::StartOnly;
        let decomposer_attached = ports.decomposer.is_some();
        let lambda = self.spec.config.lambda_voi;
        let epsilon = self.spec.config.epsilon;

        loop {
            if self.credits_remaining == 0 {
                return Ok(StopReason::CreditsExhausted);
            }
            if op_limit.is_some_and(|limit| self.ops_executed() >= limit) {
                return Ok(StopReason::OpLimitReached);
            }
            let frontier = compute_frontier(&self.set, lambda, epsilon);
            if frontier.is_empty() {
                return Ok(StopReason::NoHypotheses);
            }

            let op = if start_only {
                match self.next_scoping_op(decomposer_attached) {
                    Some(op) => op,
                    None => return Ok(StopReason::OpLimitReached),
                }
            } else {
                let ctx = self.frontier_context(decomposer_attached);
                let roots: Vec<_> = frontier.iter().filter_map(|id| self.set.root(id)).collect();
                if roots.iter().all(|root| root_is_confident(root, &self.arena, &ctx)) {
                    return self.check_closure(ports);
                }
                let candidates: Vec<Candidate> = roots
                    .iter()
                    .filter_map(|root| legal_op(root, &self.arena, &ctx))
                    .map(|op| score(op, &self.set, &self.arena, lambda))
                    .collect();
                if candidates.is_empty() {
                    return Ok(StopReason::NoLegalOp);
                }
                match self.preempt(&ctx) {
                    Some(op) => op,
                    None => {
                        let idx = select(&candidates, self.last_root.as_deref(), epsilon)
                            .unwrap_or_default();
                        candidates[idx].op.clone()
                    }
                }
            };

            match op.purpose {
                OpPurpose::CounterevidenceProbe => self.probes_used += 1,
                OpPurpose::Discriminator => {
                    self.discriminators_used += 1;
                    self.target_pair.clone_from(&op.pair);
                }
                OpPurpose::Standard => {}
            }
            debug!(
                kind = ?op.kind,
                target = %op.target,
                purpose = ?op.purpose,
                credits_remaining = self.credits_remaining,
                "operation selected"
            );
            self.execute(ports, op)?;
        }
    }

    fn next_scoping_op(&self, decomposer_attached: bool) -> Option<Operation> {
        let ctx = self.frontier_context(decomposer_attached);
        self.set
            .active_by_canonical()
            .into_iter()
            .filter_map(|root| legal_op(root, &self.arena, &ctx))
            .find(|op| op.kind.is_scoping())
    }

    /// Contrastive-budget pre-emption: probe the runner-up once the leader
    /// has evidence, then spend discriminator credits on the targeted pair.
    fn preempt(&self, ctx: &FrontierContext<'_>) -> Option<Operation> {
        let budget = &self.policy.contrastive_budget;
        if !budget.enabled {
            return None;
        }

        if self.probes_used < budget.counterevidence_quota {
            let ranked = self.set.ranked_by_mass();
            if let (Some(leader), Some(runner)) = (ranked.first(), ranked.get(1)) {
                let leader_assessed = self.set.root(leader).is_some_and(|root| {
                    root.obligations
                        .values()
                        .any(|key| self.arena.get(key).is_some_and(|node| node.assessed))
                });
                if leader_assessed && !self.falsified.contains(runner) {
                    let probe = self
                        .set
                        .root(runner)
                        .and_then(|root| evaluate_op(root, &self.arena, ctx, false));
                    if let Some(op) = probe {
                        return Some(op.with_purpose(OpPurpose::CounterevidenceProbe, None));
                    }
                }
            }
        }

        let adjudication = &self.policy.pair_adjudication;
        if !adjudication.enabled || self.discriminators_used >= budget.discriminator_quota {
            return None;
        }
        let unresolved = self.pairs.unresolved_active(adjudication);
        let pair = self
            .target_pair
            .as_ref()
            .filter(|pair| adjudication.sticky_lock && unresolved.contains(*pair))
            .or_else(|| unresolved.first())?
            .clone();
        let (left, right) = split_pair_key(&pair)?;
        [left, right].into_iter().find_map(|member| {
            self.set
                .root(member)
                .and_then(|root| evaluate_op(root, &self.arena, ctx, false))
                .map(|op| op.with_purpose(OpPurpose::Discriminator, Some(pair.clone())))
        })
    }

    // ──────────────────── operations ────────────────────

    fn execute(&mut self, ports: &mut SessionPorts<'_>, op: Operation) -> Result<()> {
        match op.kind {
            OpKind::DecomposeRoot | OpKind::DecomposeSlot => self.execute_scoping(ports, &op),
            OpKind::DecomposeNode => self.execute_node_decomposition(ports, &op),
            OpKind::Evaluate => self.execute_evaluation(ports, &op),
        }
    }

    /// Spend the operation's credit and append `OP_EXECUTED`.
    fn record_op(
        &mut self,
        ports: &mut SessionPorts<'_>,
        op: &Operation,
        response: Option<PortResponse>,
    ) -> Result<()> {
        self.credits_remaining = self.credits_remaining.saturating_sub(1);
        self.total_spent += 1;
        if let Some(root) = self.set.root_mut(&op.root_id) {
            root.credits_spent += 1;
        }
        let index = self.ops_executed();
        self.op_log.push(OperationRecord {
            index,
            op: op.clone(),
            credits_remaining_after: self.credits_remaining,
        });
        self.last_root = Some(op.root_id.clone());
        let payload = json!({
            "index": index,
            "op": op,
            "credits_remaining": self.credits_remaining,
            "response": response,
        });
        self.emit(ports, AuditEventType::OpExecuted, payload)
    }

    fn execute_scoping(&mut self, ports: &mut SessionPorts<'_>, op: &Operation) -> Result<()> {
        let root = self
            .set
            .root(&op.root_id)
            .ok_or_else(|| missing("root", &op.root_id))?;
        let slot_key = match op.kind {
            OpKind::DecomposeSlot => Some(bare_slot(&op.target).to_string()),
            _ => None,
        };
        let slots = slot_key.clone().map_or_else(
            || {
                self.spec
                    .config
                    .required_slots
                    .iter()
                    .map(|slot| slot.key.clone())
                    .collect()
            },
            |slot| vec![slot],
        );
        let target = DecomposeTarget::Root {
            root_id: root.root_id.clone(),
            statement: root.statement.clone(),
            exclusion_clause: root.exclusion_clause.clone(),
            slots,
        };

        let (scoping, response) = match ports.decomposer.as_deref_mut() {
            Some(decomposer) => match decomposer.decompose(&target)? {
                Decomposition::Scoping(scoping) => {
                    let response = PortResponse::Decomposer(Decomposition::Scoping(scoping.clone()));
                    (scoping, Some(response))
                }
                Decomposition::Node(_) => {
                    return Err(AbxError::contract(
                        "decomposer",
                        "kind",
                        format!("expected a scoping decomposition for {}", op.root_id),
                    ));
                }
            },
            None => (
                ScopingDecomposition {
                    ok: true,
                    slot_statements: BTreeMap::new(),
                },
                None,
            ),
        };
        self.record_op(ports, op, response)?;

        let slots = &self.spec.config.required_slots;
        let root = self
            .set
            .root_mut(&op.root_id)
            .ok_or_else(|| missing("root", &op.root_id))?;
        let (event_type, payload) = match slot_key {
            None => match decompose_root(root, &mut self.arena, slots, &scoping) {
                ScopingOutcome::Scoped { created } => (
                    AuditEventType::RootScoped,
                    json!({ "root_id": op.root_id, "created": created, "k_root": root.k_root }),
                ),
                ScopingOutcome::Capped => (
                    AuditEventType::RootScopingFailed,
                    json!({ "root_id": op.root_id, "k_root": root.k_root }),
                ),
            },
            Some(slot_key) => {
                let slot = slots
                    .iter()
                    .find(|slot| slot.key == slot_key)
                    .ok_or_else(|| missing("slot", &slot_key))?;
                let node_key = materialize_slot(root, &mut self.arena, slots, slot, &scoping);
                (
                    AuditEventType::SlotMaterialized,
                    json!({
                        "root_id": op.root_id,
                        "slot": slot_key,
                        "node_key": node_key,
                        "k_root": root.k_root,
                    }),
                )
            }
        };
        self.emit(ports, event_type, payload)
    }

    fn execute_node_decomposition(
        &mut self,
        ports: &mut SessionPorts<'_>,
        op: &Operation,
    ) -> Result<()> {
        let statement = self
            .arena
            .get(&op.target)
            .map(|node| node.statement.clone())
            .ok_or_else(|| missing("node", &op.target))?;
        let target = DecomposeTarget::Node {
            node_key: op.target.clone(),
            statement,
        };
        let Some(decomposer) = ports.decomposer.as_deref_mut() else {
            return Err(AbxError::Runtime {
                details: format!("decomposing {} requires a decomposer", op.target),
            });
        };
        let decomposition = match decomposer.decompose(&target)? {
            Decomposition::Node(decomposition) => decomposition,
            Decomposition::Scoping(_) => {
                return Err(AbxError::contract(
                    "decomposer",
                    "kind",
                    format!("expected a node decomposition for {}", op.target),
                ));
            }
        };
        let response = PortResponse::Decomposer(Decomposition::Node(decomposition.clone()));
        self.record_op(ports, op, Some(response))?;

        let attached = decompose_node(&mut self.arena, &op.target, &decomposition)?;
        let payload = self.arena.get(&op.target).map_or_else(
            || json!({ "node_key": op.target, "attached": attached }),
            |node| {
                json!({
                    "node_key": op.target,
                    "attached": attached,
                    "decomp_type": node.decomp_type,
                    "coupling": node.coupling,
                    "children": node.children,
                })
            },
        );
        self.emit(ports, AuditEventType::NodeDecomposed, payload)
    }

    fn evaluation_request(&self, op: &Operation) -> Result<EvaluationRequest> {
        let node = self
            .arena
            .get(&op.target)
            .ok_or_else(|| missing("node", &op.target))?;
        let root = self
            .set
            .root(&op.root_id)
            .ok_or_else(|| missing("root", &op.root_id))?;
        Ok(EvaluationRequest {
            node_key: node.node_key.clone(),
            statement: node.statement.clone(),
            context: EvaluationContext {
                claim: self.spec.claim.clone(),
                root_id: root.root_id.clone(),
                root_statement: root.statement.clone(),
                slot_key: bare_slot(&op.target).to_string(),
                purpose: op.purpose,
                pair: op.pair.clone(),
                rivals: self
                    .set
                    .active_ids()
                    .into_iter()
                    .filter(|id| *id != op.root_id)
                    .collect(),
            },
            evidence: self
                .evidence
                .iter()
                .filter(|item| item.applies_to(&op.root_id))
                .cloned()
                .collect(),
        })
    }

    fn execute_evaluation(&mut self, ports: &mut SessionPorts<'_>, op: &Operation) -> Result<()> {
        let request = self.evaluation_request(op)?;
        let outcome = ports.evaluator.evaluate(&request)?;
        outcome.validate()?;
        let known: BTreeSet<String> = self.set.named_ids().into_iter().collect();
        outcome.validate_pair_members(&known)?;
        self.record_op(ports, op, Some(PortResponse::Evaluator(outcome.clone())))?;
        self.apply_evaluation(ports, op, &outcome)
    }

    fn apply_evaluation(
        &mut self,
        ports: &mut SessionPorts<'_>,
        op: &Operation,
        outcome: &EvaluationOutcome,
    ) -> Result<()> {
        let derivation = derive_confidence(outcome, &self.evidence, self.policy.confidence_cap);
        let validity = outcome.effective_validity();
        let node = self
            .arena
            .get_mut(&op.target)
            .ok_or_else(|| missing("node", &op.target))?;
        node.p = outcome.p;
        node.k = derivation.k;
        node.assessed = true;
        node.validity = validity;
        node.guardrail_applied = derivation.guardrail_applied;
        node.evidence_ids.clone_from(&outcome.evidence_ids);
        node.entailment = Some(outcome.entailment);
        node.evidence_quality = Some(outcome.evidence_quality);
        node.reasoning_summary.clone_from(&outcome.reasoning_summary);
        node.defeaters.clone_from(&outcome.defeaters);
        let payload = json!({
            "node_key": op.target,
            "p": outcome.p,
            "k": derivation.k,
            "guardrail_applied": derivation.guardrail_applied,
            "caps": derivation.caps,
            "validity": validity,
            "entailment": outcome.entailment,
            "purpose": op.purpose,
        });
        self.emit(ports, AuditEventType::NodeEvaluated, payload)?;

        let changed = propagate_from(&mut self.arena, &op.target);
        if !changed.is_empty() {
            let payload = json!({ "from": op.target, "changed": changed });
            self.emit(ports, AuditEventType::NodePropagated, payload)?;
        }
        if let Some(root) = self.set.root_mut(&op.root_id) {
            refresh_root_k(root, &self.arena, &self.spec.config.required_slots);
        }

        let discriminative = outcome.is_discriminative();
        let contradicts = outcome.entailment == Entailment::Contradicts
            && validity >= self.policy.contradiction_min_validity;
        self.updater.record_evaluation(discriminative, contradicts);

        let touched = self.pairs.accumulate(&outcome.discriminator_payloads);
        if !touched.is_empty() {
            let adjudication = &self.policy.pair_adjudication;
            let resolutions: BTreeMap<&str, _> = touched
                .iter()
                .filter_map(|pair| {
                    self.pairs
                        .resolution(pair, adjudication)
                        .map(|r| (pair.as_str(), r))
                })
                .collect();
            let payload = json!({ "node_key": op.target, "pairs": resolutions });
            self.emit(ports, AuditEventType::PairEvidenceRecorded, payload)?;
        }
        if op.purpose == OpPurpose::CounterevidenceProbe || contradicts {
            self.falsified.insert(op.root_id.clone());
        }

        let slot = bare_slot(&op.target).to_string();
        let signal = UpdateSignal {
            slot_key: &slot,
            non_discriminative: self.policy.strict_contrastive && !discriminative,
            contradiction_validity: contradicts.then_some(validity),
        };
        let update = self.updater.apply(
            &mut self.set,
            &self.arena,
            &self.spec.config,
            &self.policy,
            &op.root_id,
            &signal,
        );
        let payload = json!({ "update": update, "ledger": self.set.ledger() });
        self.emit(ports, AuditEventType::LedgerUpdated, payload)?;

        if self.policy.retirement.enabled {
            let candidates = retirement_candidates(
                &self.set,
                &self.pairs,
                &self.policy.pair_adjudication,
                &self.policy.retirement,
            );
            for candidate in candidates {
                let moved = self.set.retire(&candidate.root_id);
                self.pairs.prune_root(&candidate.root_id);
                info!(root = %candidate.root_id, losses = candidate.losses, "contender retired");
                let payload = json!({
                    "root_id": candidate.root_id,
                    "losses": candidate.losses,
                    "moved_mass": moved,
                    "ledger": self.set.ledger(),
                });
                self.emit(ports, AuditEventType::ContenderRetired, payload)?;
            }
        }
        if self.policy.pair_adjudication.enabled {
            self.refresh_active_set(ports)?;
        }

        self.recompute_residuals(ports)?;
        self.enforce_invariants(ports)
    }

    // ──────────────────── ledger upkeep ────────────────────

    fn abstention_signals(&self) -> AbstentionSignals {
        let adjudication = &self.policy.pair_adjudication;
        let (unresolved_pair_ratio, frame_adequacy_gap) = if adjudication.enabled {
            let active = self.pairs.active_pairs().len();
            let unresolved = self.pairs.unresolved_active(adjudication).len();
            #[allow(clippy::cast_precision_loss)]
            let ratio = if active == 0 {
                0.0
            } else {
                unresolved as f64 / active as f64
            };
            (ratio, self.pairs.frame_adequacy_gap())
        } else {
            (0.0, 0.0)
        };
        AbstentionSignals {
            unresolved_pair_ratio,
            contradiction_density: self.updater.contradiction_density(),
            non_discriminative_ratio: self.updater.non_discriminative_ratio(),
            frame_adequacy_gap,
        }
    }

    fn recompute_residuals(&mut self, ports: &mut SessionPorts<'_>) -> Result<()> {
        let floor = abstention_floor(&self.policy.dynamic_abstention, &self.abstention_signals());
        let update = self.updater.recompute_residuals(
            &mut self.set,
            &self.arena,
            &self.spec.config,
            &self.policy,
            floor,
        );
        if let Some(update) = update {
            let payload = json!({ "residuals": update, "ledger": self.set.ledger() });
            self.emit(ports, AuditEventType::ResidualsRecomputed, payload)?;
        }
        Ok(())
    }

    fn enforce_invariants(&mut self, ports: &mut SessionPorts<'_>) -> Result<()> {
        let report = self.set.enforce_invariants();
        for collision in &report.collisions {
            warn!(
                canonical_id = %collision.canonical_id,
                roots = ?collision.roots,
                "canonical id collision"
            );
            let payload = json!({
                "canonical_id": collision.canonical_id,
                "roots": collision.roots,
            });
            self.emit(ports, AuditEventType::MeceViolation, payload)?;
        }
        if report.needs_correction_event() {
            warn!(drift = report.drift, clipped = ?report.clipped, "ledger corrected");
            let payload = json!({
                "clipped": report.clipped,
                "drift": report.drift,
                "ledger": self.set.ledger(),
            });
            self.emit(ports, AuditEventType::LedgerCorrected, payload)?;
        }
        Ok(())
    }

    fn refresh_active_set(&mut self, ports: &mut SessionPorts<'_>) -> Result<()> {
        let ranked = self.set.ranked_by_mass();
        if self
            .pairs
            .refresh_active_set(&ranked, &self.policy.pair_adjudication)
        {
            let payload = json!({
                "active_set": self.pairs.active_set(),
                "active_pairs": self.pairs.active_pairs(),
            });
            self.emit(ports, AuditEventType::ActiveSetChanged, payload)?;
        }
        Ok(())
    }

    // ──────────────────── closure ────────────────────

    /// Run the closure gates over a confident frontier.
    fn check_closure(&mut self, ports: &mut SessionPorts<'_>) -> Result<StopReason> {
        if !self.policy.uses_pairwise_evidence() {
            debug!("closure needs no pairwise evidence");
            return Ok(StopReason::FrontierConfident);
        }
        let mut passed = true;

        let adjudication = self.policy.pair_adjudication.clone();
        if adjudication.enabled {
            let unresolved = self.pairs.unresolved_active(&adjudication);
            let status =
                GateStatus::from_pass(!(adjudication.require_all_resolved && !unresolved.is_empty()));
            let details = json!({
                "status": status,
                "active_set": self.pairs.active_set(),
                "active_pairs": self.pairs.active_pairs(),
                "unresolved": unresolved,
                "coverage": self.pairs.coverage(&adjudication),
            });
            self.emit(ports, AuditEventType::PairAdjudicationChecked, details.clone())?;
            self.snapshot(GateKind::PairAdjudication, status, details);
            passed &= status.passed();
        }

        if self.policy.decision_contract.enabled {
            let check = check_decision_contract(
                &self.set,
                &self.pairs,
                &adjudication,
                &self.policy.decision_contract,
                &self.falsified,
            );
            let details = json!(check);
            self.emit(ports, AuditEventType::DecisionContractChecked, details.clone())?;
            self.snapshot(GateKind::DecisionContract, check.status, details);
            if !check.status.passed() {
                passed = false;
                let floor = (self.set.mass(H_UND) + self.policy.decision_contract.und_elevation)
                    .min(RESIDUAL_MAX);
                self.updater.elevate_und_floor(floor);
                let payload = json!({
                    "und_floor": self.updater.und_floor(),
                    "failures": check.failures,
                });
                self.emit(ports, AuditEventType::UnderdeterminationElevated, payload)?;
                self.recompute_residuals(ports)?;
                self.enforce_invariants(ports)?;
            }
        }

        Ok(if passed {
            StopReason::FrontierConfident
        } else {
            StopReason::ClosureGatesUnmet
        })
    }

    // ──────────────────── result ────────────────────

    fn explanations(&self, ctx: &FrontierContext<'_>) -> BTreeMap<String, RootExplanation> {
        self.set
            .roots()
            .map(|root| {
                let slots = self
                    .spec
                    .config
                    .required_slots
                    .iter()
                    .filter_map(|slot| {
                        let key = root.obligations.get(&slot.key)?;
                        let node = self.arena.get(key)?;
                        Some(SlotExplanation {
                            slot: slot.key.clone(),
                            node_key: key.clone(),
                            p: node.p,
                            k: node.k,
                            assessed: node.assessed,
                            evidence_ids: node.evidence_ids.clone(),
                            reasoning_summary: node.reasoning_summary.clone(),
                        })
                    })
                    .collect();
                let explanation = RootExplanation {
                    root_id: root.root_id.clone(),
                    statement: root.statement.clone(),
                    probability: self.set.mass(&root.root_id),
                    k_root: root.k_root,
                    status: root.status,
                    retired: root.retired,
                    credits_spent: root.credits_spent,
                    slots,
                    gaps: nec_gaps(root, &self.arena, ctx),
                };
                (root.root_id.clone(), explanation)
            })
            .collect()
    }

    fn finish(mut self, ports: &mut SessionPorts<'_>, reason: StopReason) -> Result<SessionResult> {
        let ctx = self.frontier_context(ports.decomposer.is_some());
        let exhausted =
            reason.is_exhaustion() && is_epistemically_exhausted(&self.set, &self.arena, &ctx);
        let stop = if exhausted {
            StopReason::EpistemicallyExhausted
        } else {
            reason
        };
        let recommendations = recommend(
            &self.set,
            &self.arena,
            &self.pairs,
            &self.policy,
            &ctx,
            self.credits_remaining,
        );
        let explanations = self.explanations(&ctx);

        if exhausted {
            let payload = json!({
                "reclassified_from": reason,
                "recommendations": recommendations,
            });
            self.emit(ports, AuditEventType::EpistemicExhaustion, payload)?;
        }
        let payload = json!({
            "stop_reason": stop,
            "credits_remaining": self.credits_remaining,
            "total_credits_spent": self.total_spent,
            "ledger": self.set.ledger(),
        });
        self.emit(ports, AuditEventType::StopReasonSet, payload)?;
        info!(
            stop_reason = %stop,
            credits_spent = self.total_spent,
            credits_remaining = self.credits_remaining,
            "session stopped"
        );

        let adjudication = &self.policy.pair_adjudication;
        let pairs = self
            .pairs
            .live_records()
            .map(|record| PairSummary {
                pair: record.pair.clone(),
                support_left: record.support_left,
                support_right: record.support_right,
                resolution: resolve(record, adjudication),
            })
            .collect();
        let metadata = SessionMetadata {
            policy: self.policy.clone(),
            world_mode: self.set.world,
            tau_effective: self.tau_effective,
            gate_snapshots: self.gate_snapshots,
            recommendations,
            expanded_contenders: self.contender.expanded,
            pairs,
            und_floor: self.updater.und_floor(),
            trace_digest: self.audit.digest(),
        };
        Ok(SessionResult {
            claim: self.spec.claim,
            roots: self.set.roots_map(),
            ledger: self.set.ledger().clone(),
            nodes: self.arena.to_map(),
            audit_log: self.audit.into_events(),
            stop_reason: stop,
            credits_remaining: self.credits_remaining,
            total_credits_spent: self.total_spent,
            operation_log: self.op_log,
            explanations,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{RootSpec, SessionConfig};
    use crate::core::policy::PolicyProfile;
    use crate::ports::scripted::{ScriptedDecomposer, ScriptedEvaluator};

    fn spec(config: SessionConfig) -> SessionSpec {
        let mut spec = SessionSpec::new(
            "Pump station outage",
            vec![RootSpec::new("H1", "Mechanism A"), RootSpec::new("H2", "Mechanism B")],
        );
        spec.config = config;
        spec
    }

    fn strong_support() -> serde_json::Value {
        json!({
            "p": 0.8,
            "rubric": {"A": 2, "B": 2, "C": 2, "D": 2},
            "evidence_ids": ["E1"],
            "entailment": "SUPPORTS",
            "evidence_quality": "direct",
            "reasoning_summary": "telemetry matches"
        })
    }

    #[test]
    fn initial_ledger_splits_named_mass_evenly() {
        let session = Session::new(spec(SessionConfig::default())).expect("session");
        let ledger = session.hypotheses().ledger();
        assert!((ledger["H1"] - 0.40).abs() < 1e-12);
        assert!((ledger["H2"] - 0.40).abs() < 1e-12);
        assert!((ledger["H_NOA"] - 0.10).abs() < 1e-12);
        assert!((ledger["H_UND"] - 0.10).abs() < 1e-12);
        assert_eq!(session.credits_remaining(), 20);
    }

    #[test]
    fn start_only_scopes_every_root_then_stops() {
        let config = SessionConfig {
            run_mode: RunMode::StartOnly,
            credits: 5,
            ..SessionConfig::default()
        };
        let mut evaluator = ScriptedEvaluator::new();
        let mut ports = SessionPorts::new(&mut evaluator);
        let result = Session::new(spec(config)).expect("session").run(&mut ports).expect("run");
        assert_eq!(result.stop_reason, StopReason::OpLimitReached);
        assert_eq!(result.total_credits_spent, 2);
        assert!(result.operation_log.iter().all(|r| r.op.kind == OpKind::DecomposeRoot));
        assert!(evaluator.calls.is_empty());
    }

    #[test]
    fn strong_support_closes_a_confident_frontier() {
        let mut evaluator = ScriptedEvaluator::new();
        evaluator.set_fallback(strong_support());
        let mut ports = SessionPorts::new(&mut evaluator);
        let result = Session::new(spec(SessionConfig::default()))
            .expect("session")
            .run(&mut ports)
            .expect("run");
        assert_eq!(result.stop_reason, StopReason::FrontierConfident);
        // Two scopings plus four slot evaluations per root at most.
        assert!(result.total_credits_spent <= 10);
        assert_eq!(result.operation_log.len() as u32, result.total_credits_spent);
        assert_eq!(result.credits_remaining, 20 - result.total_credits_spent);
        assert_eq!(result.operation_log[0].op.kind, OpKind::DecomposeRoot);
        assert!((result.ledger_sum() - 1.0).abs() < 1e-9);
        assert!(result.ledger.values().all(|v| (0.0..=1.0).contains(v)));
        assert!(!result.audit_log.iter().any(|e| matches!(
            e.event_type,
            AuditEventType::PairAdjudicationChecked | AuditEventType::DecisionContractChecked
        )));
    }

    #[test]
    fn contract_violation_aborts_the_run() {
        let mut evaluator = ScriptedEvaluator::new();
        evaluator.set_fallback(json!({"p": 0.5}));
        let mut decomposer = ScriptedDecomposer::scoping_only();
        let mut ports = SessionPorts::new(&mut evaluator).with_decomposer(&mut decomposer);
        let err = Session::new(spec(SessionConfig::default()))
            .expect("session")
            .run(&mut ports)
            .unwrap_err();
        assert_eq!(err.code(), "ABX-2001");
    }

    #[test]
    fn contract_in_closed_world_is_incompatible() {
        let config = SessionConfig {
            world_mode: WorldMode::Closed,
            profile: PolicyProfile::CausalInvestigation,
            ..SessionConfig::default()
        };
        let mut spec = spec(config);
        spec.mece_certificate.insert(
            "H1|H2".into(),
            crate::core::config::PairCertificate {
                overlap: 0.0,
                discriminator: "valve telemetry".into(),
            },
        );
        let mut evaluator = ScriptedEvaluator::new();
        let mut ports = SessionPorts::new(&mut evaluator);
        let result = Session::new(spec).expect("session").run(&mut ports).expect("run");
        assert_eq!(result.stop_reason, StopReason::PolicyConfigIncompatible);
        assert_eq!(result.total_credits_spent, 0);
        assert!(
            result
                .metadata
                .gate_snapshots
                .iter()
                .any(|s| s.gate == GateKind::PolicyCompatibility && s.status == GateStatus::Failed)
        );
    }

    fn thin_support() -> serde_json::Value {
        json!({
            "p": 0.6,
            "rubric": {"A": 1, "B": 1, "C": 1, "D": 1},
            "evidence_ids": ["E1"],
            "entailment": "SUPPORTS",
            "evidence_quality": "weak",
            "reasoning_summary": "thin"
        })
    }

    #[test]
    fn low_confidence_without_decomposer_stops_with_no_legal_op() {
        let mut evaluator = ScriptedEvaluator::new();
        evaluator.set_fallback(thin_support());
        let mut ports = SessionPorts::new(&mut evaluator);
        let result = Session::new(spec(SessionConfig::default()))
            .expect("session")
            .run(&mut ports)
            .expect("run");
        assert_eq!(result.stop_reason, StopReason::NoLegalOp);
        assert!(result.credits_remaining > 0);
        assert_eq!(result.credits_remaining, 20 - result.total_credits_spent);
        assert!(
            !result
                .audit_log
                .iter()
                .any(|e| e.event_type == AuditEventType::EpistemicExhaustion)
        );
    }

    #[test]
    fn spent_budget_with_open_gaps_is_epistemic_exhaustion() {
        let mut evaluator = ScriptedEvaluator::new();
        evaluator.set_fallback(thin_support());
        let mut ports = SessionPorts::new(&mut evaluator);
        let baseline = Session::new(spec(SessionConfig::default()))
            .expect("session")
            .run(&mut ports)
            .expect("run");
        let credits = baseline.total_credits_spent;

        let mut evaluator = ScriptedEvaluator::new();
        evaluator.set_fallback(thin_support());
        let mut ports = SessionPorts::new(&mut evaluator);
        let result = Session::new(spec(SessionConfig {
            credits,
            ..SessionConfig::default()
        }))
        .expect("session")
        .run(&mut ports)
        .expect("run");
        assert_eq!(result.stop_reason, StopReason::EpistemicallyExhausted);
        assert_eq!(result.credits_remaining, 0);
        assert!(!result.metadata.recommendations.is_empty());
        assert!(
            result
                .audit_log
                .iter()
                .any(|e| e.event_type == AuditEventType::EpistemicExhaustion)
        );
    }
}
