//! Heartbeat cycle and operator surface. `ControlPlane` owns the keyed
//! per-tenant subsystems (mode manager, envelope guard, arbiter,
//! adaptation scheduler, policy registry, quarantine) and drives one
//! short, idempotent control cycle per call: read month artifacts,
//! project risk, arbitrate, guard, transition, append the ledger batch,
//! persist the flight record.

use crate::adaptation::{AdaptationDecision, AdaptationGate, AdaptationScheduler};
use crate::arbiter::{
    AiRecommendation, ArbiterConfig, ArbiterOutcome, ArbiterResult, CommandArbiter, CommandRequest,
};
use crate::autonomy::{
    default_rules, AutonomyMode, ModeManager, ModeStateSnapshot, TransitionContext,
    TransitionLogEntry,
};
use crate::config::Config;
use crate::ledger::event::{system_actor, system_context, EventEnvelope, KNOWN_KINDS};
use crate::ledger::replay::{replay_deterministic, validate_replay_chain};
use crate::ledger::snapshot::{SnapshotPolicy, SnapshotRecord};
use crate::logging::{self, json_log, obj, v_bool, v_num, v_str};
use crate::policy::{
    approve_policy_proposal, CanaryReport, CanaryThresholds, PolicyRegistry, PolicyVersionRecord,
    RegressionDeltas, TruthLink, TruthLinkStore,
};
use crate::quarantine::{QuarantineEnvelope, QuarantineStore, ReplayReport};
use crate::recorder::FlightRecord;
use crate::risk::{
    CumulativeRiskState, EnvelopeDecision, EnvelopeRequest, RiskEnvelopeGuard, RiskLimits, RiskTier,
};
use crate::store::{
    artifact_id, Artifact, ControlStore, StoreError, ARTIFACT_COLLECTION, QUARANTINE_COLLECTION,
};
use anyhow::{anyhow, bail, Result};
use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

// =============================================================================
// Execution budget
// =============================================================================

/// Logical ceilings per cycle. Exceeding any of them forces the cycle
/// into rule-only fallback: the AI stage is skipped entirely.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionBudget {
    pub max_tokens: u64,
    pub max_steps: u64,
    pub max_cost: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BudgetUsage {
    pub tokens: u64,
    pub steps: u64,
    pub cost: f64,
}

impl ExecutionBudget {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_tokens: cfg.budget_max_tokens,
            max_steps: cfg.budget_max_steps,
            max_cost: cfg.budget_max_cost,
        }
    }

    pub fn exceeded(&self, usage: &BudgetUsage) -> Vec<String> {
        let mut reasons = Vec::new();
        if usage.tokens > self.max_tokens {
            reasons.push(format!("tokens {} over budget {}", usage.tokens, self.max_tokens));
        }
        if usage.steps > self.max_steps {
            reasons.push(format!("steps {} over budget {}", usage.steps, self.max_steps));
        }
        if usage.cost > self.max_cost {
            reasons.push(format!("cost {:.2} over budget {:.2}", usage.cost, self.max_cost));
        }
        reasons
    }
}

// =============================================================================
// Risk projection
// =============================================================================

/// What the month's artifacts say about the tenant right now. Missing
/// artifacts fall back to conservative defaults.
#[derive(Debug, Clone, Serialize)]
pub struct RiskProjection {
    pub tenant_id: String,
    pub month_key: String,
    pub projected_amount: f64,
    pub scope_breadth: u32,
    pub confidence: f64,
    pub health_score: f64,
    /// Deterministic-vs-AI divergence signal feeding the drift monitor.
    pub divergence: f64,
    /// Explicit drift score published by the analytics pipeline, if any.
    pub drift_score: Option<f64>,
    #[serde(skip)]
    pub budget_usage: BudgetUsage,
    #[serde(skip)]
    pub ai: Option<AiRecommendation>,
}

fn field_f64(payload: &Value, key: &str) -> Option<f64> {
    payload.get(key).and_then(Value::as_f64)
}

impl RiskProjection {
    pub fn from_artifacts(tenant_id: &str, month_key: &str, artifacts: &[Artifact]) -> Self {
        let mut p = Self {
            tenant_id: tenant_id.to_string(),
            month_key: month_key.to_string(),
            projected_amount: 0.0,
            scope_breadth: 1,
            confidence: 0.5,
            health_score: 1.0,
            divergence: 0.0,
            drift_score: None,
            budget_usage: BudgetUsage::default(),
            ai: None,
        };
        for artifact in artifacts {
            let body = &artifact.payload;
            match artifact.artifact_type.as_str() {
                "exposure_projection" => {
                    if let Some(v) = field_f64(body, "projectedAmount") {
                        p.projected_amount = v;
                    }
                    if let Some(v) = field_f64(body, "scopeBreadth") {
                        p.scope_breadth = v as u32;
                    }
                }
                "quality_scores" => {
                    if let Some(v) = field_f64(body, "healthScore") {
                        p.health_score = v;
                    }
                    if let Some(v) = field_f64(body, "confidence") {
                        p.confidence = v;
                    }
                    if let Some(v) = field_f64(body, "divergence") {
                        p.divergence = v;
                    }
                    p.drift_score = field_f64(body, "driftScore");
                }
                "budget_usage" => {
                    p.budget_usage = BudgetUsage {
                        tokens: field_f64(body, "tokens").unwrap_or(0.0) as u64,
                        steps: field_f64(body, "steps").unwrap_or(0.0) as u64,
                        cost: field_f64(body, "cost").unwrap_or(0.0),
                    };
                }
                "ai_recommendation" => {
                    p.ai = Some(AiRecommendation {
                        allow: body.get("allow").and_then(Value::as_bool).unwrap_or(false),
                        confidence: field_f64(body, "confidence").unwrap_or(0.0),
                        rationale: body
                            .get("rationale")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                    });
                }
                _ => {}
            }
        }
        p
    }
}

fn wrong_type(payload: &Value, key: &str) -> bool {
    payload.get(key).map(|v| !v.is_number()).unwrap_or(false)
}

/// Schema check for the known artifact types. Returns a description of
/// the first problem, or `None` when the payload is usable. Unknown
/// artifact types always pass; they carry no fields the projection
/// reads.
fn artifact_schema_error(artifact: &Artifact) -> Option<String> {
    let body = &artifact.payload;
    if !body.is_object() {
        return Some("payload is not an object".to_string());
    }
    match artifact.artifact_type.as_str() {
        "exposure_projection" => {
            if field_f64(body, "projectedAmount").is_none() {
                return Some("projectedAmount missing or not numeric".to_string());
            }
            if wrong_type(body, "scopeBreadth") {
                return Some("scopeBreadth not numeric".to_string());
            }
        }
        "quality_scores" => {
            for key in ["healthScore", "confidence", "divergence", "driftScore"] {
                if wrong_type(body, key) {
                    return Some(format!("{} not numeric", key));
                }
            }
        }
        "budget_usage" => {
            for key in ["tokens", "steps", "cost"] {
                if wrong_type(body, key) {
                    return Some(format!("{} not numeric", key));
                }
            }
        }
        "ai_recommendation" => {
            if body.get("allow").map(|v| !v.is_boolean()).unwrap_or(true) {
                return Some("allow missing or not boolean".to_string());
            }
            if wrong_type(body, "confidence") {
                return Some("confidence not numeric".to_string());
            }
        }
        _ => {}
    }
    None
}

// =============================================================================
// Heartbeat report
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatReport {
    pub tenant_id: String,
    pub month_key: String,
    pub mode_before: AutonomyMode,
    pub mode_after: AutonomyMode,
    pub gate: AdaptationGate,
    pub drift_score: f64,
    pub arbiter: ArbiterResult,
    pub envelope: Option<EnvelopeDecision>,
    pub budget_fallback: bool,
    pub transition: TransitionLogEntry,
    pub event_ids: Vec<String>,
    pub flight_record_id: String,
    pub reasons: Vec<String>,
}

/// What happened to an externally supplied event: accepted onto the
/// ledger, or wrapped into a dead-letter envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum IngestOutcome {
    Accepted { event_id: String },
    Quarantined { quarantine_id: String, reason: String },
}

// =============================================================================
// Control plane
// =============================================================================

pub struct ControlPlane {
    pub config: Config,
    pub modes: ModeManager,
    pub guard: RiskEnvelopeGuard,
    pub arbiter: CommandArbiter,
    pub scheduler: AdaptationScheduler,
    pub policies: PolicyRegistry,
    pub truth_links: TruthLinkStore,
    pub quarantine: QuarantineStore,
    store: Box<dyn ControlStore>,
    /// Tenants whose governance document has been loaded this process.
    hydrated: HashSet<String>,
}

pub const GOVERNANCE_COLLECTION: &str = "governance";
pub const GOVERNANCE_DOC: &str = "state";

/// Per-tenant governance state as persisted between processes. Every
/// mutating operator call writes it back, so a restart resumes with the
/// same mode, exposure counters, violation window, disagreement count,
/// policy history, truth links, and dead-letter queue.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct GovernanceState {
    mode: Option<ModeStateSnapshot>,
    envelope: Option<CumulativeRiskState>,
    disagreements: u32,
    policies: Vec<PolicyVersionRecord>,
    truth_links: Vec<TruthLink>,
    quarantine: Vec<QuarantineEnvelope>,
}

/// RFC3339 timestamp at `base_ms + offset_ms`. Batch events get strictly
/// increasing timestamps so the `(timestamp, id)` order matches append
/// order.
fn batch_timestamp(base_ms: u64, offset_ms: u64) -> String {
    match Utc.timestamp_millis_opt((base_ms + offset_ms) as i64) {
        chrono::LocalResult::Single(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        _ => logging::ts_now(),
    }
}

/// Millisecond base for new appends: strictly after the tenant's current
/// tail so `(timestamp, id)` order can never tie with it.
fn next_base_ms(existing: &[EventEnvelope], now_ms: u64) -> u64 {
    existing
        .last()
        .and_then(|e| chrono::DateTime::parse_from_rfc3339(&e.timestamp).ok())
        .map(|dt| (dt.timestamp_millis().max(0) as u64).saturating_add(1))
        .map(|after_tail| after_tail.max(now_ms))
        .unwrap_or(now_ms)
}

/// Ingress validation for replayed payloads: a tagged union with a known
/// `type` discriminant.
pub fn valid_control_payload(payload: &Value) -> bool {
    payload
        .get("type")
        .and_then(Value::as_str)
        .map(|t| KNOWN_KINDS.contains(&t))
        .unwrap_or(false)
}

impl ControlPlane {
    pub fn new(config: Config, store: Box<dyn ControlStore>) -> Self {
        let rules = default_rules(
            config.mode_confidence_floor,
            config.mode_violation_threshold,
            config.mode_violation_window_secs,
        );
        Self {
            modes: ModeManager::new(
                rules,
                config.mode_history_cap,
                config.mode_violation_window_secs,
            ),
            guard: RiskEnvelopeGuard::new(RiskLimits::from_config(&config)),
            arbiter: CommandArbiter::new(ArbiterConfig::from_config(&config)),
            scheduler: AdaptationScheduler::new(
                config.drift_tolerance,
                config.drift_moderate_multiplier,
                config.drift_baseline_window,
                config.drift_recent_window,
            ),
            policies: PolicyRegistry::new(),
            truth_links: TruthLinkStore::new(),
            quarantine: QuarantineStore::new(),
            store,
            hydrated: HashSet::new(),
            config,
        }
    }

    /// Load a tenant's governance document into the keyed subsystems.
    /// Runs once per tenant per process; a missing document means a
    /// brand-new tenant.
    fn hydrate(&mut self, tenant_id: &str) -> Result<()> {
        if !self.hydrated.insert(tenant_id.to_string()) {
            return Ok(());
        }
        let doc = match self
            .store
            .read_item(tenant_id, GOVERNANCE_COLLECTION, GOVERNANCE_DOC)?
        {
            Some(doc) => doc,
            None => return Ok(()),
        };
        let state: GovernanceState = serde_json::from_value(doc)?;
        if let Some(mode) = state.mode {
            self.modes.restore(tenant_id, mode);
        }
        if let Some(envelope) = state.envelope {
            self.guard.restore(tenant_id, envelope);
        }
        self.arbiter
            .restore_disagreements(tenant_id, state.disagreements);
        self.policies.restore(tenant_id, state.policies);
        self.truth_links.restore(tenant_id, state.truth_links);
        self.quarantine.restore(tenant_id, state.quarantine);
        Ok(())
    }

    /// Write the tenant's governance state back. Called at the end of
    /// every mutating operator call.
    fn persist_governance(&mut self, tenant_id: &str) -> Result<()> {
        let state = GovernanceState {
            mode: self.modes.export(tenant_id),
            envelope: self.guard.state(tenant_id).cloned(),
            disagreements: self.arbiter.disagreements(tenant_id),
            policies: self.policies.history(tenant_id).to_vec(),
            truth_links: self.truth_links.export(tenant_id),
            quarantine: self.quarantine.export(tenant_id),
        };
        self.store.write_doc(
            tenant_id,
            GOVERNANCE_COLLECTION,
            GOVERNANCE_DOC,
            serde_json::to_value(&state)?,
        )?;
        Ok(())
    }

    pub fn store(&self) -> &dyn ControlStore {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> &mut dyn ControlStore {
        self.store.as_mut()
    }

    fn control_state_json(&self, tenant_id: &str) -> Value {
        let (daily, cumulative) = self
            .guard
            .state(tenant_id)
            .map(|s| (s.daily_exposure, s.cumulative_exposure))
            .unwrap_or((0.0, 0.0));
        json!({
            "mode": self.modes.mode(tenant_id).as_str(),
            "exposure": {"daily": daily, "cumulative": cumulative},
            "disagreements": self.arbiter.disagreements(tenant_id),
            "policyVersion": self.policies.active(tenant_id).map(|p| p.version.clone()),
        })
    }

    /// One full control cycle for a tenant/month. Either the whole event
    /// batch lands on the ledger or the cycle errors before any commit.
    pub fn run_heartbeat(
        &mut self,
        tenant_id: &str,
        month_key: &str,
        tier: RiskTier,
    ) -> Result<HeartbeatReport> {
        let now = logging::ts_epoch_secs();
        let now_ms = logging::ts_epoch_ms();
        let now_iso = logging::ts_now();
        let mut reasons: Vec<String> = Vec::new();

        self.hydrate(tenant_id)?;

        // The tenant's chain must verify before we extend it.
        let existing = self.store.read_events(tenant_id)?;
        validate_replay_chain(&existing).map_err(|e| anyhow!("ledger integrity: {}", e))?;

        let before_state = self.control_state_json(tenant_id);

        // Malformed month artifacts go to the dead-letter queue instead
        // of silently feeding defaults into the projection.
        let mut artifacts = Vec::new();
        for artifact in self.store.read_artifacts_by_month(tenant_id, month_key)? {
            match artifact_schema_error(&artifact) {
                Some(problem) => {
                    let qid = self.quarantine_payload(
                        tenant_id,
                        "artifact_ingest",
                        "SCHEMA_INVALID",
                        json!({
                            "monthKey": month_key,
                            "artifactType": artifact.artifact_type,
                            "payload": artifact.payload,
                        }),
                    )?;
                    reasons.push(format!(
                        "artifact {} quarantined as {}: {}",
                        artifact.artifact_type, qid, problem
                    ));
                }
                None => artifacts.push(artifact),
            }
        }
        let projection = RiskProjection::from_artifacts(tenant_id, month_key, &artifacts);

        // Budget gate: over-budget cycles run rule-only.
        let budget = ExecutionBudget::from_config(&self.config);
        let budget_reasons = budget.exceeded(&projection.budget_usage);
        let budget_fallback = !budget_reasons.is_empty();
        if budget_fallback {
            reasons.push("rule-only fallback: execution budget exceeded".to_string());
            reasons.extend(budget_reasons);
        }

        // Drift gate.
        self.scheduler.observe(tenant_id, projection.divergence);
        let drift = projection
            .drift_score
            .unwrap_or_else(|| self.scheduler.drift_score(tenant_id));
        let adaptation: AdaptationDecision =
            self.scheduler.evaluate_with_drift(tenant_id, drift, &now_iso);
        if adaptation.gate == AdaptationGate::Hold {
            reasons.push(format!("drift {:.3} past moderate band", drift));
        }

        // Arbitration and envelope guard.
        let mode_before = self.modes.mode(tenant_id);
        let request = CommandRequest {
            tenant_id: tenant_id.to_string(),
            command: "apply_month_adjustments".to_string(),
            amount: projection.projected_amount,
            confidence: projection.confidence,
            scope_breadth: projection.scope_breadth,
            now,
        };
        let ai = if budget_fallback { None } else { projection.ai.as_ref() };
        let arbiter_result = self.arbiter.arbitrate(&request, mode_before, ai);
        reasons.extend(arbiter_result.reasons.iter().cloned());

        let envelope_request = EnvelopeRequest {
            tenant_id: tenant_id.to_string(),
            amount: projection.projected_amount,
            confidence: projection.confidence,
            risk_tier: tier,
            scope_breadth: projection.scope_breadth,
            now,
        };
        let envelope = if arbiter_result.outcome == ArbiterOutcome::Allow {
            let decision = self.guard.validate(&envelope_request);
            if !decision.approved {
                self.modes.record_violation(tenant_id, now);
                for code in decision.block_codes() {
                    reasons.push(format!("envelope block: {}", code));
                }
            }
            Some(decision)
        } else if mode_before.allows_advice() {
            // Advisory cycles check the envelope without spending it, so a
            // tenant can earn promotion to ConstrainedAct before the arbiter
            // ever allows execution.
            Some(self.guard.preview(&envelope_request))
        } else {
            None
        };
        let envelope_approved = envelope.as_ref().map(|d| d.approved).unwrap_or(false);
        let downgrade = envelope
            .as_ref()
            .map(|d| d.downgrade_recommended)
            .unwrap_or(false);

        // Mode transition implied by the cycle.
        let target = if arbiter_result.outcome == ArbiterOutcome::Escalate
            || adaptation.gate == AdaptationGate::Hold
            || downgrade
        {
            AutonomyMode::Hold
        } else {
            match mode_before {
                AutonomyMode::Observe => AutonomyMode::Advise,
                AutonomyMode::Advise if envelope_approved => AutonomyMode::ConstrainedAct,
                other => other,
            }
        };
        let ctx = TransitionContext {
            confidence: projection.confidence,
            envelope_approved,
            scoring_stable: adaptation.gate == AdaptationGate::Observe,
            emergency: false,
            now,
        };
        let transition = self.modes.attempt_transition(tenant_id, target, &ctx);
        let mode_after = self.modes.mode(tenant_id);

        // Ledger batch: heartbeat, decision, mode_transition when the
        // mode actually moved, policy_proposal when the drift gate asked
        // for one. Payloads are built first; appends then run in order.
        let mut batch: Vec<(String, Map<String, Value>)> = Vec::new();
        batch.push((
            "heartbeat".to_string(),
            to_payload(json!({
                "type": "heartbeat",
                "monthKey": month_key,
                "gate": adaptation.gate.as_str(),
                "driftScore": drift,
                "healthScore": projection.health_score,
                "budgetFallback": budget_fallback,
            })),
        ));
        batch.push((
            "decision".to_string(),
            to_payload(json!({
                "type": "decision",
                "monthKey": month_key,
                "command": request.command,
                "amount": projection.projected_amount,
                "outcome": arbiter_result.outcome,
                "winner": arbiter_result.winner,
                "conflict": arbiter_result.conflict,
                "envelopeApproved": envelope_approved,
                "reasons": reasons,
            })),
        ));
        if transition.approved && mode_before != mode_after {
            batch.push((
                "mode_transition".to_string(),
                to_payload(json!({
                    "type": "mode_transition",
                    "from": mode_before.as_str(),
                    "to": mode_after.as_str(),
                    "ruleId": transition.rule_id.clone(),
                })),
            ));
        }
        if let Some(proposal) = &adaptation.proposal {
            batch.push((
                "policy_proposal".to_string(),
                to_payload(json!({
                    "type": "policy_proposal",
                    "proposalId": proposal.proposal_id,
                    "driftScore": proposal.drift_score,
                    "proposedChanges": proposal.proposed_changes,
                    "requiresApproval": proposal.requires_approval,
                })),
            ));
        }

        let base_ms = next_base_ms(&existing, now_ms);
        let mut parent = existing.last().map(|e| e.id.clone());
        let mut event_ids = Vec::new();
        for (offset, (kind, payload)) in batch.into_iter().enumerate() {
            let event = EventEnvelope::new(
                &kind,
                system_actor(tenant_id),
                system_context(tenant_id, &format!("hb-{}", now_ms)),
                payload,
                batch_timestamp(base_ms, offset as u64),
                parent.clone(),
            );
            parent = Some(event.id.clone());
            event_ids.push(event.id.clone());
            self.store.create_event(event)?;
        }

        // Snapshot cadence: cut a fold of the tenant's timeline every
        // `snapshot_interval` events and keep the newest `retention`.
        self.maybe_snapshot(tenant_id)?;

        // Proposal document for the approval surface.
        if let Some(proposal) = &adaptation.proposal {
            self.store.write_doc(
                tenant_id,
                "proposals",
                &proposal.proposal_id,
                serde_json::to_value(proposal)?,
            )?;
        }

        // Flight record for the cycle.
        let after_state = self.control_state_json(tenant_id);
        let record = FlightRecord::capture(
            tenant_id,
            "heartbeat",
            &self.config.config_hash(),
            &before_state,
            &after_state,
            reasons.clone(),
            &now_iso,
        );
        let flight_record_id = record.record_id.clone();
        self.store.write_doc(
            tenant_id,
            ARTIFACT_COLLECTION,
            &artifact_id(month_key, "flight_record"),
            serde_json::to_value(&record)?,
        )?;

        self.persist_governance(tenant_id)?;

        json_log(
            "heartbeat",
            obj(&[
                ("tenant_id", v_str(tenant_id)),
                ("month_key", v_str(month_key)),
                ("gate", v_str(adaptation.gate.as_str())),
                ("drift_score", v_num(drift)),
                ("mode_before", v_str(mode_before.as_str())),
                ("mode_after", v_str(mode_after.as_str())),
                ("outcome", v_str(&format!("{:?}", arbiter_result.outcome))),
                ("budget_fallback", v_bool(budget_fallback)),
                ("events", v_num(event_ids.len() as f64)),
            ]),
        );

        Ok(HeartbeatReport {
            tenant_id: tenant_id.to_string(),
            month_key: month_key.to_string(),
            mode_before,
            mode_after,
            gate: adaptation.gate,
            drift_score: drift,
            arbiter: arbiter_result,
            envelope,
            budget_fallback,
            transition,
            event_ids,
            flight_record_id,
            reasons,
        })
    }

    fn maybe_snapshot(&mut self, tenant_id: &str) -> Result<()> {
        let events = self.store.read_events(tenant_id)?;
        let tail = match events.last() {
            Some(tail) => tail.clone(),
            None => return Ok(()),
        };
        let policy = SnapshotPolicy::new(
            self.config.snapshot_interval,
            self.config.snapshot_retention,
        );
        let last_index = self
            .store
            .read_snapshot(tenant_id, "ledger", "latest")?
            .and_then(|v| v.get("fromEventIndex").and_then(Value::as_u64))
            .unwrap_or(0) as usize;
        if !policy.should_snapshot(events.len().saturating_sub(last_index)) {
            return Ok(());
        }

        let folded = replay_deterministic(&events, json!({"counts": {}}), fold_ledger_state);
        if !folded.is_valid() {
            return Ok(());
        }
        let snap = SnapshotRecord::new(
            tenant_id,
            &tail.id,
            &tail.timestamp,
            events.len(),
            folded.state,
        );

        let mut history: Vec<SnapshotRecord> = self
            .store
            .read_snapshot(tenant_id, "ledger", "history")?
            .and_then(|v| {
                v.get("snapshots")
                    .cloned()
                    .and_then(|s| serde_json::from_value(s).ok())
            })
            .unwrap_or_default();
        history.push(snap.clone());
        let (kept, _) = policy.prune(history);
        self.store.write_snapshot(
            tenant_id,
            "ledger",
            "history",
            json!({"snapshots": kept}),
        )?;
        self.store
            .write_snapshot(tenant_id, "ledger", "latest", serde_json::to_value(&snap)?)?;
        Ok(())
    }

    /// Canary-gate a policy proposal and record the outcome on the
    /// ledger.
    pub fn approve_policy_proposal(
        &mut self,
        tenant_id: &str,
        proposal_id: &str,
        candidate_version: &str,
        baseline_version: &str,
        deltas: RegressionDeltas,
        approved_by: &str,
    ) -> Result<CanaryReport> {
        self.hydrate(tenant_id)?;
        let now_iso = logging::ts_now();
        if self.policies.active(tenant_id).is_none() {
            self.policies
                .activate(tenant_id, baseline_version, "bootstrap", &now_iso);
        }
        let report = approve_policy_proposal(
            &mut self.policies,
            tenant_id,
            proposal_id,
            candidate_version,
            baseline_version,
            deltas,
            CanaryThresholds {
                max_allowed_precision_drop: self.config.max_allowed_precision_drop,
                max_allowed_recall_drop: self.config.max_allowed_recall_drop,
            },
            approved_by,
            &now_iso,
        );

        let existing = self.store.read_events(tenant_id)?;
        let parent = existing.last().map(|e| e.id.clone());
        let ts = batch_timestamp(next_base_ms(&existing, logging::ts_epoch_ms()), 0);
        let event = EventEnvelope::new(
            "policy_activation",
            system_actor(tenant_id),
            system_context(tenant_id, &format!("canary-{}", proposal_id)),
            to_payload(json!({
                "type": "policy_activation",
                "proposalId": proposal_id,
                "candidateVersion": candidate_version,
                "baselineVersion": baseline_version,
                "approved": report.approved,
                "autoRollback": report.auto_rollback,
                "activeVersion": report.active_version,
            })),
            ts,
            parent,
        );
        self.store.create_event(event)?;
        self.persist_governance(tenant_id)?;

        json_log(
            "policy_canary",
            obj(&[
                ("tenant_id", v_str(tenant_id)),
                ("proposal_id", v_str(proposal_id)),
                ("approved", v_bool(report.approved)),
                ("auto_rollback", v_bool(report.auto_rollback)),
                ("active_version", v_str(&report.active_version)),
            ]),
        );
        Ok(report)
    }

    /// Isolate a failed payload in the dead-letter queue.
    pub fn quarantine_payload(
        &mut self,
        tenant_id: &str,
        source_type: &str,
        reason_code: &str,
        payload: Value,
    ) -> Result<String> {
        self.hydrate(tenant_id)?;
        let envelope =
            QuarantineEnvelope::new(tenant_id, source_type, reason_code, payload, &logging::ts_now());
        let id = envelope.quarantine_id.clone();
        self.store.write_doc(
            tenant_id,
            QUARANTINE_COLLECTION,
            &id,
            serde_json::to_value(&envelope)?,
        )?;
        self.quarantine.put(envelope);
        self.persist_governance(tenant_id)?;
        Ok(id)
    }

    /// Land an externally supplied event on the ledger. Schema and chain
    /// integrity failures are wrapped into a dead-letter envelope rather
    /// than dropped; backend failures propagate.
    pub fn ingest_event(&mut self, tenant_id: &str, event: EventEnvelope) -> Result<IngestOutcome> {
        self.hydrate(tenant_id)?;
        let event_id = event.id.clone();
        match self.store.create_event(event.clone()) {
            Ok(()) => Ok(IngestOutcome::Accepted { event_id }),
            Err(StoreError::Integrity(err)) => {
                let reason = if err.is_integrity() {
                    "INTEGRITY_FAILED"
                } else {
                    "SCHEMA_INVALID"
                };
                json_log(
                    "event_ingest",
                    obj(&[
                        ("tenant_id", v_str(tenant_id)),
                        ("event_id", v_str(&event_id)),
                        ("reason", v_str(reason)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
                let quarantine_id = self.quarantine_payload(
                    tenant_id,
                    "event_ingest",
                    reason,
                    serde_json::to_value(&event)?,
                )?;
                Ok(IngestOutcome::Quarantined {
                    quarantine_id,
                    reason: reason.to_string(),
                })
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Bounded dead-letter replay against the ingress validator.
    pub fn replay_dead_letter(
        &mut self,
        tenant_id: &str,
        quarantine_id: &str,
        max_attempts: Option<u32>,
    ) -> Result<ReplayReport> {
        self.hydrate(tenant_id)?;
        let max_attempts = max_attempts.unwrap_or(self.config.max_replay_attempts);
        let report = self
            .quarantine
            .replay(tenant_id, quarantine_id, max_attempts, valid_control_payload);
        let report = match report {
            Some(r) => r,
            None => bail!("unknown quarantine item {}/{}", tenant_id, quarantine_id),
        };

        if let Some(envelope) = self.quarantine.get(tenant_id, quarantine_id) {
            self.store.write_doc(
                tenant_id,
                QUARANTINE_COLLECTION,
                quarantine_id,
                serde_json::to_value(envelope)?,
            )?;
        }

        let existing = self.store.read_events(tenant_id)?;
        let parent = existing.last().map(|e| e.id.clone());
        let ts = batch_timestamp(next_base_ms(&existing, logging::ts_epoch_ms()), 0);
        let event = EventEnvelope::new(
            "quarantine",
            system_actor(tenant_id),
            system_context(tenant_id, &format!("dlq-{}", quarantine_id)),
            to_payload(json!({
                "type": "quarantine",
                "quarantineId": quarantine_id,
                "status": report.status.as_str(),
                "replayAttempts": report.replay_attempts,
                "failureCode": report.failure_code,
            })),
            ts,
            parent,
        );
        self.store.create_event(event)?;
        self.persist_governance(tenant_id)?;
        Ok(report)
    }

    /// Bind a decision to its observed outcome. Idempotent per decision.
    pub fn bind_truth_link(&mut self, tenant_id: &str, link: TruthLink) -> Result<TruthLink> {
        self.hydrate(tenant_id)?;
        let bound = self.truth_links.bind(tenant_id, link).clone();
        let existing = self.store.read_events(tenant_id)?;
        let parent = existing.last().map(|e| e.id.clone());
        let ts = batch_timestamp(next_base_ms(&existing, logging::ts_epoch_ms()), 0);
        let event = EventEnvelope::new(
            "truth_link",
            system_actor(tenant_id),
            system_context(tenant_id, &format!("truth-{}", bound.decision_id)),
            to_payload(json!({
                "type": "truth_link",
                "decisionId": bound.decision_id,
                "policyVersion": bound.policy_version,
                "outcome": bound.outcome,
            })),
            ts,
            parent,
        );
        self.store.create_event(event)?;
        self.persist_governance(tenant_id)?;
        Ok(bound)
    }

    /// Append operator feedback about a decision. Unlike truth links,
    /// any number of feedback events may reference one decision.
    pub fn record_feedback(
        &mut self,
        tenant_id: &str,
        decision_id: &str,
        note: Value,
    ) -> Result<String> {
        let existing = self.store.read_events(tenant_id)?;
        let parent = existing.last().map(|e| e.id.clone());
        let ts = batch_timestamp(next_base_ms(&existing, logging::ts_epoch_ms()), 0);
        let event = EventEnvelope::new(
            "feedback",
            system_actor(tenant_id),
            system_context(tenant_id, &format!("feedback-{}", decision_id)),
            to_payload(json!({
                "type": "feedback",
                "decisionId": decision_id,
                "note": note,
            })),
            ts,
            parent,
        );
        let id = event.id.clone();
        self.store.create_event(event)?;
        Ok(id)
    }
}

/// Reducer for the ledger snapshot fold: event counts per kind plus the
/// tail event id.
fn fold_ledger_state(state: Value, event: &EventEnvelope) -> Value {
    let mut counts = state
        .get("counts")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let n = counts.get(&event.kind).and_then(Value::as_u64).unwrap_or(0);
    counts.insert(event.kind.clone(), json!(n + 1));
    json!({"counts": counts, "tailEventId": event.id})
}

fn to_payload(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        other => {
            let mut m = Map::new();
            m.insert("value".to_string(), other);
            m
        }
    }
}
