//! The dispatch consistency gate.
//!
//! [`DispatchGate::evaluate`] runs one request through the admission state
//! machine and returns a [`GateOutcome`]: forward the (possibly rewritten)
//! request, or reject it with a [`GateError`].
//!
//! ```text
//! attempt ─► exempt? ──yes──► forward (exempt-readonly)
//!              │no
//!              ▼
//!         blocking condition? ──yes──► 503 unsafe
//!              │no
//!              ▼  ┌──────────── supervisor cycle ────────────┐
//!         load snapshot (timeout ─► cache | 503 unsafe)       │
//!              ▼                                              │
//!         validate ─invalid─► forced refresh, validate again  │
//!              ▼                                              │
//!         stale? ─► rollback to trusted ─► validate | 503     │
//!              ▼                                              │
//!         decide: allow | block (409) | reroute (guarded)     │
//!              └──────────────────────────────────────────────┘
//! ```
//!
//! In shadow mode the same evaluation runs without any writes, and every
//! outcome is forwarded with the decision that would have been enforced.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dgate_core::audit::{AuditEmitter, AuditEvent, TracingAuditEmitter};
use dgate_core::binding::{Binding, EXEMPT_BINDING_ID, ExemptRoute, UNBOUND_BINDING_ID};
use dgate_core::clock::{Clock, SystemClock, rfc3339_ms};
use dgate_core::config::DgateConfig;
use dgate_core::safety::{
    ActivateCondition, QuarantineKind, RegisterQuarantine, SafetyRuntimeStore,
    UnsafeConditionCode,
};
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};

use super::attempt::DispatchAttempt;
use super::policy::{DispatchAction, PolicyEvaluator, ValidationReason, ValidationResult};
use super::request::{DispatchRequest, RequestSnapshot};
use super::reroute::{RerouteProvenance, apply_reroute, check_preconditions};
use super::response::{ConflictBody, FailsafeBody, GateError};
use super::snapshot::{LoadedFrom, SnapshotLoad, SnapshotProvider};
use super::supervisor::{CycleId, InterpreterSupervisor};

/// Dedupe key of the quarantine raised on a timeout with no cache.
pub const POLICY_TIMEOUT_DEDUPE_KEY: &str = "policy-engine-timeout";

/// Dedupe key of the quarantine raised on an unreconcilable version.
pub const MEMORY_MISMATCH_DEDUPE_KEY: &str = "memory-version-mismatch";

/// Actor recorded on gate-initiated snapshot writes.
pub const GATE_ACTOR: &str = "dispatch-gate";

// =============================================================================
// Configuration
// =============================================================================

/// Gate settings.
#[derive(Debug, Clone)]
pub struct DispatchGateConfig {
    /// Budget for one snapshot load or rollback.
    pub policy_timeout: Duration,
    /// Compute and log decisions without enforcing them.
    pub shadow_mode: bool,
    /// Reject traffic while a blocking unsafe condition is active.
    pub enforce_blocking_conditions: bool,
    /// Routes admitted without any checks.
    pub exempt_routes: Vec<ExemptRoute>,
    /// Entity id reported to the supervisor.
    pub supervisor_entity: String,
}

impl Default for DispatchGateConfig {
    fn default() -> Self {
        Self::from(&DgateConfig::default())
    }
}

impl From<&DgateConfig> for DispatchGateConfig {
    fn from(config: &DgateConfig) -> Self {
        Self {
            policy_timeout: config.gate.policy_timeout,
            shadow_mode: config.gate.shadow_mode,
            enforce_blocking_conditions: config.gate.enforce_blocking_conditions,
            exempt_routes: config.gate.exempt_routes.clone(),
            supervisor_entity: config.supervisor.entity_id.clone(),
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Decision reported in the `x-dispatch-decision` header and audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    /// Forwarded unchanged.
    Allow,
    /// Rejected with a 409.
    Block,
    /// Forwarded after a rewrite.
    Reroute,
    /// Rejected with a 503 unsafe-to-proceed payload.
    Unsafe,
    /// Rejected with a 503 failsafe body.
    Failsafe,
}

impl GateDecision {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
            Self::Reroute => "reroute",
            Self::Unsafe => "unsafe",
            Self::Failsafe => "failsafe",
        }
    }

    /// Value of the `x-dispatch-decision` header. Rejections that shadow
    /// mode forwarded are reported as `block`.
    #[must_use]
    pub const fn header_value(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Reroute => "reroute",
            Self::Block | Self::Unsafe | Self::Failsafe => "block",
        }
    }

    /// The decision a rejection corresponds to.
    #[must_use]
    pub const fn of_error(error: &GateError) -> Self {
        match error {
            GateError::Timeout { .. } | GateError::Unsafe { .. } => Self::Unsafe,
            GateError::Conflict { .. } => Self::Block,
            GateError::Execution { .. } | GateError::Config { .. } | GateError::Internal { .. } => {
                Self::Failsafe
            },
        }
    }
}

impl From<DispatchAction> for GateDecision {
    fn from(action: DispatchAction) -> Self {
        match action {
            DispatchAction::Allow => Self::Allow,
            DispatchAction::Block => Self::Block,
            DispatchAction::Reroute => Self::Reroute,
        }
    }
}

/// Per-request context attached to forwarded requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchContext {
    /// `"<METHOD> <path>"` of the original request.
    pub route_attempted: String,
    /// Binding the request resolved to.
    pub binding_id: String,
    /// Memory version the decision was made against.
    pub memory_version: Option<String>,
    /// Decision taken (or, in shadow mode, the one that would have been).
    pub decision: GateDecision,
    /// Origin of the snapshot used.
    pub loaded_from: Option<LoadedFrom>,
    /// Validation reason when the request was not plainly valid.
    pub conflict_reason: Option<String>,
    /// Original route when the request was rerouted.
    pub rerouted_from: Option<String>,
    /// Whether the decision was computed in shadow mode.
    pub shadow: bool,
}

impl DispatchContext {
    fn new(attempt: &DispatchAttempt, binding_id: &str, decision: GateDecision) -> Self {
        Self {
            route_attempted: attempt.route_attempted.clone(),
            binding_id: binding_id.to_string(),
            memory_version: None,
            decision,
            loaded_from: None,
            conflict_reason: None,
            rerouted_from: None,
            shadow: false,
        }
    }

    fn with_load(mut self, load: &SnapshotLoad) -> Self {
        self.memory_version = Some(load.memory_version.clone());
        self.loaded_from = Some(load.loaded_from);
        self
    }
}

/// Result of [`DispatchGate::evaluate`].
#[derive(Debug)]
pub enum GateOutcome {
    /// Pass the request downstream.
    Forward(DispatchContext),
    /// Answer the request directly.
    Reject(GateError),
}

impl GateOutcome {
    /// Returns `true` for [`GateOutcome::Forward`].
    #[must_use]
    pub const fn is_forward(&self) -> bool {
        matches!(self, Self::Forward(_))
    }
}

// =============================================================================
// DispatchGate
// =============================================================================

/// Per-request evaluation inputs.
struct Evaluation<'a> {
    attempt: &'a DispatchAttempt,
    binding: Option<&'a Binding>,
    binding_id: &'a str,
    cycle: &'a CycleId,
    shadow: bool,
}

/// Admission-control state machine in front of the route memory snapshot.
pub struct DispatchGate {
    config: DispatchGateConfig,
    bindings: Arc<[Binding]>,
    snapshots: Arc<dyn SnapshotProvider>,
    policy: Arc<dyn PolicyEvaluator>,
    supervisor: Arc<dyn InterpreterSupervisor>,
    safety: Arc<SafetyRuntimeStore>,
    audit: Arc<dyn AuditEmitter>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DispatchGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchGate")
            .field("config", &self.config)
            .field("bindings", &self.bindings.len())
            .finish_non_exhaustive()
    }
}

impl DispatchGate {
    /// Creates a gate auditing through `tracing` on the system clock.
    #[must_use]
    pub fn new(
        config: DispatchGateConfig,
        bindings: Vec<Binding>,
        snapshots: Arc<dyn SnapshotProvider>,
        policy: Arc<dyn PolicyEvaluator>,
        supervisor: Arc<dyn InterpreterSupervisor>,
        safety: Arc<SafetyRuntimeStore>,
    ) -> Self {
        Self {
            config,
            bindings: bindings.into(),
            snapshots,
            policy,
            supervisor,
            safety,
            audit: Arc::new(TracingAuditEmitter),
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Replaces the audit emitter.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditEmitter>) -> Self {
        self.audit = audit;
        self
    }

    /// Replaces the clock used for body timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Gate settings.
    #[must_use]
    pub const fn config(&self) -> &DispatchGateConfig {
        &self.config
    }

    /// The safety store consulted for admission.
    #[must_use]
    pub const fn safety(&self) -> &Arc<SafetyRuntimeStore> {
        &self.safety
    }

    /// Runs `req` through the gate. On [`GateOutcome::Forward`] the request
    /// may have been rewritten by a reroute; on [`GateOutcome::Reject`] it is
    /// unchanged.
    pub async fn evaluate(&self, req: &mut DispatchRequest) -> GateOutcome {
        let attempt = DispatchAttempt::from_request(req);

        if let Some(ctx) = self.admit_exempt(&attempt) {
            return GateOutcome::Forward(ctx);
        }

        let binding = self.policy.resolve_binding(&attempt, &self.bindings);
        let binding_id = binding.map_or(UNBOUND_BINDING_ID, |b| b.id.as_str());
        let shadow = self.config.shadow_mode;

        if self.config.enforce_blocking_conditions && self.safety.has_unsafe_blocking_conditions()
        {
            let error = GateError::Unsafe {
                payload: self.safety.unsafe_to_proceed_payload(),
            };
            return self.settle(&attempt, binding_id, shadow, Err(error));
        }

        let cycle = self
            .supervisor
            .begin_cycle(&self.config.supervisor_entity, &attempt.route_attempted);
        let ev = Evaluation {
            attempt: &attempt,
            binding,
            binding_id,
            cycle: &cycle,
            shadow,
        };

        let pristine = RequestSnapshot::capture(req);
        let caught = AssertUnwindSafe(self.decide(req, &ev)).catch_unwind().await;
        let result = match caught {
            Ok(result) => result,
            Err(_) => {
                pristine.restore(req);
                tracing::error!(
                    route = %attempt.route_attempted,
                    "dispatch evaluation panicked"
                );
                Err(GateError::Internal {
                    body: self.failsafe_body(&ev, None, "gate_panicked"),
                })
            },
        };

        match &result {
            Err(
                e @ (GateError::Timeout { .. }
                | GateError::Internal { .. }
                | GateError::Execution { .. }),
            ) => self.supervisor.fail_cycle(&cycle, e.kind()),
            _ => self.supervisor.complete_cycle(&cycle),
        }

        self.settle(&attempt, binding_id, shadow, result)
    }

    /// Admits an exempt route from its method and path alone, so callers
    /// can skip reading the body. Returns `None` if no exempt rule matches.
    pub fn exempt(&self, method: &str, path: &str) -> Option<DispatchContext> {
        self.admit_exempt(&DispatchAttempt::new(method, path, None))
    }

    fn admit_exempt(&self, attempt: &DispatchAttempt) -> Option<DispatchContext> {
        if !attempt.is_exempt(&self.config.exempt_routes) {
            return None;
        }
        let ctx = DispatchContext::new(attempt, EXEMPT_BINDING_ID, GateDecision::Allow);
        self.audit_decision(&ctx, None);
        Some(ctx)
    }

    /// Rejects a request whose body could not be read. Nothing is
    /// evaluated; the rejection is audited like any other.
    pub fn reject_unreadable_body(&self, method: &str, path: &str) -> GateError {
        let attempt = DispatchAttempt::new(method, path, None);
        let error = GateError::Internal {
            body: FailsafeBody::new(
                &attempt.route_attempted,
                None,
                UNBOUND_BINDING_ID,
                "request_body_unreadable",
                self.now(),
            ),
        };
        let mut ctx = DispatchContext::new(&attempt, UNBOUND_BINDING_ID, GateDecision::Failsafe);
        ctx.conflict_reason = error.reason().map(str::to_string);
        self.audit_decision(&ctx, Some(&error));
        error
    }

    /// Converts a decision result into an outcome, applying shadow mode and
    /// emitting the audit event.
    fn settle(
        &self,
        attempt: &DispatchAttempt,
        binding_id: &str,
        shadow: bool,
        result: Result<DispatchContext, GateError>,
    ) -> GateOutcome {
        match result {
            Ok(mut ctx) => {
                ctx.shadow = shadow;
                self.audit_decision(&ctx, None);
                GateOutcome::Forward(ctx)
            },
            Err(error) if shadow => {
                let mut ctx =
                    DispatchContext::new(attempt, binding_id, GateDecision::of_error(&error));
                ctx.conflict_reason = error.reason().map(str::to_string);
                ctx.memory_version = error.memory_version().map(str::to_string);
                ctx.shadow = true;
                self.audit_decision(&ctx, Some(&error));
                GateOutcome::Forward(ctx)
            },
            Err(error) => {
                let mut ctx =
                    DispatchContext::new(attempt, binding_id, GateDecision::of_error(&error));
                ctx.conflict_reason = error.reason().map(str::to_string);
                ctx.memory_version = error.memory_version().map(str::to_string);
                self.audit_decision(&ctx, Some(&error));
                GateOutcome::Reject(error)
            },
        }
    }

    async fn decide(
        &self,
        req: &mut DispatchRequest,
        ev: &Evaluation<'_>,
    ) -> Result<DispatchContext, GateError> {
        let client_version = req.memory_version().map(str::to_string);
        let baseline_ts = req.baseline_ts_ms();
        let validate = |load: &SnapshotLoad| {
            self.policy.validate_against_snapshot(
                ev.binding,
                ev.attempt,
                &load.snapshot,
                client_version.as_deref(),
                baseline_ts,
            )
        };

        let mut load = self.load_snapshot(ev, false).await?;
        let mut validation = validate(&load);

        if !validation.valid {
            load = self.load_snapshot(ev, true).await?;
            validation = validate(&load);
        }

        if !validation.valid && validation.reason == ValidationReason::StaleVersion {
            if ev.shadow {
                tracing::info!(
                    route = %ev.attempt.route_attempted,
                    "shadow mode: stale version, rollback skipped"
                );
            } else {
                let Some(trusted) = self.rollback(ev).await else {
                    return Err(self.memory_mismatch(ev, &load, "no trusted snapshot"));
                };
                let revalidated = validate(&trusted);
                if revalidated.reason == ValidationReason::StaleVersion && !revalidated.valid {
                    return Err(self.memory_mismatch(ev, &trusted, "stale after rollback"));
                }
                load = trusted;
                validation = revalidated;
            }
        }

        let (sensitivity, conflict_policy) = ev
            .binding
            .map(|b| (b.sensitivity, b.conflict_policy))
            .unwrap_or_default();
        let action = self
            .policy
            .decide_action(&validation, sensitivity, conflict_policy);

        let mut ctx =
            DispatchContext::new(ev.attempt, ev.binding_id, action.into()).with_load(&load);
        if !validation.valid {
            ctx.conflict_reason = Some(validation.reason.as_str().to_string());
        }

        match action {
            DispatchAction::Allow => {
                if !ev.shadow {
                    self.bookkeep(ev, &load, &validation).await;
                }
                Ok(ctx)
            },
            DispatchAction::Block => Err(GateError::Conflict {
                body: ConflictBody::new(
                    &ev.attempt.route_attempted,
                    Some(&load.memory_version),
                    ev.binding_id,
                    validation.reason.as_str(),
                    self.now(),
                ),
            }),
            DispatchAction::Reroute => {
                let target = check_preconditions(ev.binding, Some(&load)).map_err(|e| {
                    GateError::Config {
                        body: self.failsafe_body(
                            ev,
                            Some(&load.memory_version),
                            e.failsafe_reason(),
                        ),
                    }
                })?;
                if ev.shadow {
                    return Ok(ctx);
                }
                let provenance = RerouteProvenance {
                    original_route: ev.attempt.route_attempted.clone(),
                    original_uri: req.uri.to_string(),
                    prompt_field: None,
                    binding_id: ev.binding_id.to_string(),
                    conflict_reason: validation.reason.as_str().to_string(),
                    memory_version: load.memory_version.clone(),
                    rerouted_at: self.now(),
                };
                match apply_reroute(req, target, provenance) {
                    Ok(()) => {
                        ctx.rerouted_from = Some(ev.attempt.route_attempted.clone());
                        Ok(ctx)
                    },
                    Err(source) => {
                        let body = self.failsafe_body(
                            ev,
                            Some(&load.memory_version),
                            source.failsafe_reason(),
                        );
                        Err(GateError::Execution { source, body })
                    },
                }
            },
        }
    }

    /// Loads a snapshot raced against the policy timeout. The load runs as
    /// its own task so a timed-out load completes in the background and is
    /// discarded.
    async fn load_snapshot(
        &self,
        ev: &Evaluation<'_>,
        force_refresh: bool,
    ) -> Result<SnapshotLoad, GateError> {
        self.supervisor.heartbeat(ev.cycle);
        let provider = Arc::clone(&self.snapshots);
        let task = tokio::spawn(async move { provider.get_snapshot(force_refresh).await });

        let (failure, timed_out) =
            match tokio::time::timeout(self.config.policy_timeout, task).await {
                Ok(Ok(Ok(load))) => return Ok(load),
                Ok(Ok(Err(e))) => {
                    tracing::warn!(error = %e, force_refresh, "snapshot load failed");
                    ("snapshot_load_failed", false)
                },
                Ok(Err(e)) => {
                    tracing::error!(error = %e, force_refresh, "snapshot load task failed");
                    ("snapshot_load_failed", false)
                },
                Err(_) => ("snapshot_load_timeout", true),
            };

        if let Some(cached) = self.snapshots.cached_snapshot() {
            self.audit.emit(
                AuditEvent::warn("dispatch_snapshot_degraded")
                    .with("route_attempted", &ev.attempt.route_attempted)
                    .with("reason", failure)
                    .with("memory_version", &cached.memory_version),
            );
            return Ok(cached.with_origin(LoadedFrom::Cache));
        }

        if timed_out {
            return Err(self.timeout_no_fallback(ev));
        }
        Err(GateError::Internal {
            body: self.failsafe_body(ev, None, failure),
        })
    }

    async fn rollback(&self, ev: &Evaluation<'_>) -> Option<SnapshotLoad> {
        self.supervisor.heartbeat(ev.cycle);
        match tokio::time::timeout(
            self.config.policy_timeout,
            self.snapshots.rollback_to_trusted_snapshot(GATE_ACTOR),
        )
        .await
        {
            Ok(Ok(Some(load))) => {
                self.audit.emit(
                    AuditEvent::info("dispatch_snapshot_rollback")
                        .with("route_attempted", &ev.attempt.route_attempted)
                        .with("memory_version", &load.memory_version),
                );
                Some(load)
            },
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "rollback to trusted snapshot failed");
                None
            },
            Err(_) => {
                tracing::warn!("rollback to trusted snapshot timed out");
                None
            },
        }
    }

    /// Remembers the snapshot as trusted and heals missing route state.
    /// Failures are logged only.
    async fn bookkeep(
        &self,
        ev: &Evaluation<'_>,
        load: &SnapshotLoad,
        validation: &ValidationResult,
    ) {
        if let Err(e) = self.snapshots.remember_trusted_snapshot(load).await {
            tracing::warn!(error = %e, "failed to remember trusted snapshot");
        }
        if !validation.requires_snapshot_update {
            return;
        }
        let expected = validation
            .expected_route
            .as_deref()
            .unwrap_or(&ev.attempt.route_attempted);
        if let Err(e) = self
            .snapshots
            .upsert_route_state(&ev.attempt.route_attempted, expected, GATE_ACTOR)
            .await
        {
            tracing::warn!(
                error = %e,
                route = %ev.attempt.route_attempted,
                "route state upsert failed"
            );
        }
    }

    fn timeout_no_fallback(&self, ev: &Evaluation<'_>) -> GateError {
        let timeout_ms = u64::try_from(self.config.policy_timeout.as_millis()).unwrap_or(u64::MAX);
        if !ev.shadow {
            let message = format!("snapshot load exceeded {timeout_ms}ms with no cached snapshot");
            self.raise(
                ev,
                QuarantineKind::Policy,
                POLICY_TIMEOUT_DEDUPE_KEY,
                UnsafeConditionCode::PolicyEngineTimeoutNoFallback,
                &message,
            );
        }
        GateError::Timeout {
            timeout_ms,
            payload: self.safety.unsafe_to_proceed_payload(),
        }
    }

    fn memory_mismatch(&self, ev: &Evaluation<'_>, load: &SnapshotLoad, detail: &str) -> GateError {
        let message = format!(
            "memory version {} could not be reconciled: {detail}",
            load.memory_version
        );
        self.raise(
            ev,
            QuarantineKind::Memory,
            MEMORY_MISMATCH_DEDUPE_KEY,
            UnsafeConditionCode::MemoryVersionMismatch,
            &message,
        );
        GateError::Unsafe {
            payload: self.safety.unsafe_to_proceed_payload(),
        }
    }

    /// Registers a deduplicated quarantine and a blocking condition tied
    /// to it.
    fn raise(
        &self,
        ev: &Evaluation<'_>,
        kind: QuarantineKind,
        dedupe_key: &str,
        code: UnsafeConditionCode,
        message: &str,
    ) {
        let mut metadata = Map::new();
        metadata.insert(
            "route_attempted".into(),
            Value::String(ev.attempt.route_attempted.clone()),
        );
        metadata.insert("binding_id".into(), Value::String(ev.binding_id.to_string()));

        let quarantine = self.safety.register_quarantine(
            RegisterQuarantine::new(kind, message)
                .auto_recoverable(false)
                .dedupe_key(dedupe_key)
                .metadata(metadata.clone()),
        );
        self.safety.activate_unsafe_condition(
            ActivateCondition::new(code, message)
                .quarantine(quarantine.quarantine_id)
                .metadata(metadata),
        );
    }

    fn failsafe_body(
        &self,
        ev: &Evaluation<'_>,
        memory_version: Option<&str>,
        reason: &str,
    ) -> FailsafeBody {
        FailsafeBody::new(
            &ev.attempt.route_attempted,
            memory_version,
            ev.binding_id,
            reason,
            self.now(),
        )
    }

    fn audit_decision(&self, ctx: &DispatchContext, error: Option<&GateError>) {
        let event = match ctx.decision {
            GateDecision::Allow | GateDecision::Reroute => AuditEvent::info("dispatch_decision"),
            GateDecision::Block | GateDecision::Unsafe | GateDecision::Failsafe => {
                AuditEvent::warn("dispatch_decision")
            },
        };
        let mut event = event
            .with("route_attempted", &ctx.route_attempted)
            .with("decision", ctx.decision.as_str())
            .with("binding_id", &ctx.binding_id)
            .with("memory_version", &ctx.memory_version)
            .with("conflict_reason", &ctx.conflict_reason)
            .with("shadow", ctx.shadow);
        if let Some(from) = ctx.loaded_from {
            event = event.with("loaded_from", from.as_str());
        }
        if let Some(from) = &ctx.rerouted_from {
            event = event.with("rerouted_from", from);
        }
        if let Some(error) = error {
            event = event
                .with("error_kind", error.kind())
                .with("error", error.to_string());
        }
        self.audit.emit(event);
    }

    fn now(&self) -> String {
        rfc3339_ms(self.clock.now_ms())
    }
}
