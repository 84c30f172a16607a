//! Gate state machine tests: exemption, timeout fallback, stale-version
//! rollback, block/reroute application, shadow mode and the top-level
//! failsafe.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use bytes::Bytes;
use dgate_core::audit::MemoryAuditSink;
use dgate_core::binding::{Binding, ConflictPolicy, ExemptRoute, Sensitivity};
use dgate_core::clock::{ManualClock, VersionClock};
use dgate_core::safety::{
    ActivateCondition, QuarantineKind, SafetyRuntimeStore, SafetyStoreConfig, UnsafeConditionCode,
};

use super::*;

// =============================================================================
// Test Doubles
// =============================================================================

/// Wraps the in-memory provider with injectable latency and failures.
struct ScriptedProvider {
    inner: InMemorySnapshotProvider,
    delay: Duration,
    fail: bool,
    preset_cache: Option<SnapshotLoad>,
    loads: AtomicUsize,
}

#[async_trait]
impl SnapshotProvider for ScriptedProvider {
    async fn get_snapshot(&self, force_refresh: bool) -> Result<SnapshotLoad, SnapshotError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(SnapshotError::Unavailable("backend down".into()));
        }
        self.inner.get_snapshot(force_refresh).await
    }

    fn cached_snapshot(&self) -> Option<SnapshotLoad> {
        self.preset_cache
            .clone()
            .or_else(|| self.inner.cached_snapshot())
    }

    async fn rollback_to_trusted_snapshot(
        &self,
        updated_by: &str,
    ) -> Result<Option<SnapshotLoad>, SnapshotError> {
        self.inner.rollback_to_trusted_snapshot(updated_by).await
    }

    async fn remember_trusted_snapshot(&self, load: &SnapshotLoad) -> Result<(), SnapshotError> {
        self.inner.remember_trusted_snapshot(load).await
    }

    async fn upsert_route_state(
        &self,
        route_attempted: &str,
        expected_route: &str,
        updated_by: &str,
    ) -> Result<(), SnapshotError> {
        self.inner
            .upsert_route_state(route_attempted, expected_route, updated_by)
            .await
    }
}

#[derive(Default)]
struct RecordingSupervisor {
    calls: Mutex<Vec<String>>,
}

impl RecordingSupervisor {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl InterpreterSupervisor for RecordingSupervisor {
    fn begin_cycle(&self, _entity_id: &str, _label: &str) -> CycleId {
        self.calls.lock().unwrap().push("begin".into());
        CycleId::new()
    }

    fn heartbeat(&self, _cycle: &CycleId) {
        self.calls.lock().unwrap().push("heartbeat".into());
    }

    fn complete_cycle(&self, _cycle: &CycleId) {
        self.calls.lock().unwrap().push("complete".into());
    }

    fn fail_cycle(&self, _cycle: &CycleId, reason: &str) {
        self.calls.lock().unwrap().push(format!("fail:{reason}"));
    }
}

/// Evaluator whose validation panics.
struct PanickingPolicy;

impl PolicyEvaluator for PanickingPolicy {
    fn resolve_binding<'b>(
        &self,
        attempt: &DispatchAttempt,
        bindings: &'b [Binding],
    ) -> Option<&'b Binding> {
        RuleBasedPolicyEvaluator::new(Duration::ZERO).resolve_binding(attempt, bindings)
    }

    fn validate_against_snapshot(
        &self,
        _binding: Option<&Binding>,
        _attempt: &DispatchAttempt,
        _snapshot: &DispatchMemorySnapshot,
        _client_version: Option<&str>,
        _expected_baseline_ts_ms: Option<u64>,
    ) -> ValidationResult {
        panic!("rule table corrupted");
    }

    fn decide_action(
        &self,
        _validation: &ValidationResult,
        _sensitivity: Sensitivity,
        _conflict_policy: ConflictPolicy,
    ) -> DispatchAction {
        DispatchAction::Allow
    }
}

// =============================================================================
// Test Helpers
// =============================================================================

struct Harness {
    gate: DispatchGate,
    provider: Arc<ScriptedProvider>,
    supervisor: Arc<RecordingSupervisor>,
    safety: Arc<SafetyRuntimeStore>,
    audit: Arc<MemoryAuditSink>,
    clock: Arc<ManualClock>,
}

struct HarnessBuilder {
    conflict_policy: ConflictPolicy,
    reroute_target: &'static str,
    routes: BTreeMap<String, RouteState>,
    delay: Duration,
    fail: bool,
    with_cache: bool,
    shadow: bool,
    policy: Option<Arc<dyn PolicyEvaluator>>,
}

fn builder() -> HarnessBuilder {
    HarnessBuilder {
        conflict_policy: ConflictPolicy::Block,
        reroute_target: "/ask",
        routes: BTreeMap::new(),
        delay: Duration::ZERO,
        fail: false,
        with_cache: false,
        shadow: false,
        policy: None,
    }
}

impl HarnessBuilder {
    const fn conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    const fn reroute_target(mut self, target: &'static str) -> Self {
        self.reroute_target = target;
        self
    }

    fn route(mut self, attempted: &str, expected: &str) -> Self {
        self.routes.insert(
            attempted.into(),
            RouteState {
                expected_route: expected.into(),
                updated_by: "seed".into(),
                updated_at_ms: 0,
            },
        );
        self
    }

    const fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    const fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    const fn cached(mut self) -> Self {
        self.with_cache = true;
        self
    }

    const fn shadow(mut self) -> Self {
        self.shadow = true;
        self
    }

    fn policy(mut self, policy: Arc<dyn PolicyEvaluator>) -> Self {
        self.policy = Some(policy);
        self
    }

    fn build(self) -> Harness {
        let clock = ManualClock::new(1_000);
        let audit = Arc::new(MemoryAuditSink::new());
        let versions = Arc::new(VersionClock::new(Arc::clone(&clock) as _));
        let inner = InMemorySnapshotProvider::with_routes(versions, self.routes);
        let preset_cache = self
            .with_cache
            .then(|| SnapshotLoad::new(inner.current(), LoadedFrom::Cache));
        let provider = Arc::new(ScriptedProvider {
            inner,
            delay: self.delay,
            fail: self.fail,
            preset_cache,
            loads: AtomicUsize::new(0),
        });
        let supervisor = Arc::new(RecordingSupervisor::default());
        let safety = Arc::new(SafetyRuntimeStore::in_memory(
            SafetyStoreConfig::default(),
            Arc::clone(&clock) as _,
            Arc::clone(&audit) as _,
        ));
        let binding = Binding {
            id: "memory-write".into(),
            sensitivity: Sensitivity::High,
            conflict_policy: self.conflict_policy,
            reroute_target: Some(self.reroute_target.into()),
            exact_paths: vec!["/memory/save".into(), self.reroute_target.into()],
            path_prefixes: Vec::new(),
            methods: vec!["POST".into(), "PUT".into()],
        };
        let config = DispatchGateConfig {
            policy_timeout: Duration::from_millis(50),
            shadow_mode: self.shadow,
            enforce_blocking_conditions: true,
            exempt_routes: vec![
                ExemptRoute::exact("GET", "/health"),
                ExemptRoute::prefix("GET", "/status"),
            ],
            supervisor_entity: "dispatch-gate".into(),
        };
        let policy = self
            .policy
            .unwrap_or_else(|| {
                Arc::new(RuleBasedPolicyEvaluator::new(Duration::from_millis(250))) as _
            });
        let gate = DispatchGate::new(
            config,
            vec![binding],
            Arc::clone(&provider) as _,
            policy,
            Arc::clone(&supervisor) as _,
            Arc::clone(&safety),
        )
        .with_audit(Arc::clone(&audit) as _)
        .with_clock(Arc::clone(&clock) as _);
        Harness {
            gate,
            provider,
            supervisor,
            safety,
            audit,
            clock,
        }
    }
}

fn request(method: Method, path: &'static str, body: &str) -> DispatchRequest {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    DispatchRequest::new(
        method,
        Uri::from_static(path),
        headers,
        Bytes::from(body.to_string()),
    )
}

fn with_version(mut req: DispatchRequest, version: &str) -> DispatchRequest {
    req.headers.insert(
        MEMORY_VERSION_HEADER,
        HeaderValue::from_str(version).unwrap(),
    );
    req
}

fn forwarded(outcome: GateOutcome) -> DispatchContext {
    match outcome {
        GateOutcome::Forward(ctx) => ctx,
        GateOutcome::Reject(e) => panic!("expected forward, got {e:?}"),
    }
}

fn rejected(outcome: GateOutcome) -> GateError {
    match outcome {
        GateOutcome::Reject(e) => e,
        GateOutcome::Forward(ctx) => panic!("expected reject, got {ctx:?}"),
    }
}

// =============================================================================
// Exemption and admission
// =============================================================================

#[tokio::test]
async fn exempt_routes_never_load_a_snapshot() {
    let h = builder().build();
    for path in ["/health", "/status/workers"] {
        let ctx = forwarded(
            h.gate
                .evaluate(&mut request(Method::GET, path, ""))
                .await,
        );
        assert_eq!(ctx.decision, GateDecision::Allow);
        assert_eq!(ctx.binding_id, dgate_core::binding::EXEMPT_BINDING_ID);
        assert!(ctx.memory_version.is_none());
    }
    assert_eq!(h.provider.loads.load(Ordering::SeqCst), 0);
    assert!(h.supervisor.calls().is_empty());
    assert_eq!(h.audit.events_named("dispatch_decision").len(), 2);
}

#[tokio::test]
async fn active_blocking_condition_rejects_without_loading() {
    let h = builder().build();
    h.safety.activate_unsafe_condition(ActivateCondition::new(
        UnsafeConditionCode::PatternIntegrityFailure,
        "baseline mismatch",
    ));

    let err = rejected(
        h.gate
            .evaluate(&mut request(Method::POST, "/memory/save", "{}"))
            .await,
    );
    assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    let GateError::Unsafe { payload } = err else {
        panic!("expected unsafe");
    };
    assert_eq!(payload.conditions, vec!["PATTERN_INTEGRITY_FAILURE"]);
    assert_eq!(h.provider.loads.load(Ordering::SeqCst), 0);

    let ctx = forwarded(h.gate.evaluate(&mut request(Method::GET, "/health", "")).await);
    assert_eq!(ctx.decision, GateDecision::Allow);
}

#[tokio::test]
async fn exempt_admission_needs_only_method_and_path() {
    let h = builder().build();
    let ctx = h.gate.exempt("get", "/status/live").unwrap();
    assert_eq!(ctx.decision, GateDecision::Allow);
    assert_eq!(ctx.binding_id, "exempt-readonly");
    assert!(h.gate.exempt("POST", "/health").is_none());
    assert!(h.audit.contains("dispatch_decision"));
    assert_eq!(h.provider.loads.load(Ordering::SeqCst), 0);
}

#[test]
fn rejections_report_block_in_the_decision_header() {
    assert_eq!(GateDecision::Allow.header_value(), "allow");
    assert_eq!(GateDecision::Reroute.header_value(), "reroute");
    assert_eq!(GateDecision::Block.header_value(), "block");
    assert_eq!(GateDecision::Unsafe.header_value(), "block");
    assert_eq!(GateDecision::Failsafe.header_value(), "block");
}

#[tokio::test]
async fn advisory_conditions_do_not_block() {
    let h = builder().build();
    h.safety.activate_unsafe_condition(
        ActivateCondition::new(UnsafeConditionCode::WorkerRestartThreshold, "flapping")
            .blocking(false),
    );
    let ctx = forwarded(
        h.gate
            .evaluate(&mut request(Method::POST, "/memory/save", "{}"))
            .await,
    );
    assert_eq!(ctx.decision, GateDecision::Allow);
}

// =============================================================================
// Allow path
// =============================================================================

#[tokio::test]
async fn allow_remembers_trusted_snapshot_and_heals_route_state() {
    let h = builder().build();
    let before = h.provider.inner.current();

    let mut req = request(Method::POST, "/memory/save", r#"{"message":"hi"}"#);
    let original = req.clone();
    let ctx = forwarded(h.gate.evaluate(&mut req).await);

    assert_eq!(req, original);
    assert_eq!(ctx.decision, GateDecision::Allow);
    assert_eq!(ctx.binding_id, "memory-write");
    assert_eq!(ctx.memory_version.as_deref(), Some(before.version_id.as_str()));
    assert_eq!(ctx.loaded_from, Some(LoadedFrom::Current));
    assert!(!ctx.shadow);

    let after = h.provider.inner.current();
    assert_eq!(
        after.routes["POST /memory/save"].expected_route,
        "POST /memory/save"
    );
    assert_eq!(after.routes["POST /memory/save"].updated_by, GATE_ACTOR);
    assert_eq!(
        h.supervisor.calls(),
        vec!["begin", "heartbeat", "complete"]
    );
}

#[tokio::test]
async fn unbound_requests_are_allowed() {
    let h = builder().build();
    let ctx = forwarded(
        h.gate
            .evaluate(&mut request(Method::POST, "/other", "{}"))
            .await,
    );
    assert_eq!(ctx.decision, GateDecision::Allow);
    assert_eq!(ctx.binding_id, dgate_core::binding::UNBOUND_BINDING_ID);
}

// =============================================================================
// Timeout and load failures
// =============================================================================

#[tokio::test]
async fn timeout_without_cache_is_unsafe_to_proceed() {
    let h = builder().slow(Duration::from_millis(500)).build();

    let err = rejected(
        h.gate
            .evaluate(&mut request(Method::POST, "/memory/save", "{}"))
            .await,
    );
    assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    let GateError::Timeout { timeout_ms, payload } = err else {
        panic!("expected timeout");
    };
    assert_eq!(timeout_ms, 50);
    assert_eq!(payload.error, "UNSAFE_TO_PROCEED");
    assert!(
        payload
            .conditions
            .contains(&"POLICY_ENGINE_TIMEOUT_NO_FALLBACK".to_string())
    );
    assert_eq!(payload.quarantine_ids.len(), 1);

    let quarantines = h.safety.active_quarantines(Some(QuarantineKind::Policy));
    assert_eq!(quarantines.len(), 1);
    assert_eq!(quarantines[0].dedupe_key(), Some(POLICY_TIMEOUT_DEDUPE_KEY));
    assert_eq!(
        h.supervisor.calls(),
        vec!["begin", "heartbeat", "fail:timeout"]
    );
}

#[tokio::test]
async fn timeout_with_cache_continues_degraded() {
    let h = builder().slow(Duration::from_millis(500)).cached().build();

    let ctx = forwarded(
        h.gate
            .evaluate(&mut request(Method::POST, "/memory/save", "{}"))
            .await,
    );
    assert_eq!(ctx.decision, GateDecision::Allow);
    assert_eq!(ctx.loaded_from, Some(LoadedFrom::Cache));
    assert!(h.audit.contains("dispatch_snapshot_degraded"));
    assert!(h.safety.active_unsafe_conditions(None).is_empty());
}

#[tokio::test]
async fn load_failure_without_cache_is_failsafe() {
    let h = builder().failing().build();
    let err = rejected(
        h.gate
            .evaluate(&mut request(Method::POST, "/memory/save", "{}"))
            .await,
    );
    let GateError::Internal { body } = err else {
        panic!("expected internal failsafe");
    };
    assert_eq!(body.failsafe_reason, "snapshot_load_failed");
    assert_eq!(body.code, DISPATCH_FAILSAFE);
    assert!(h.safety.active_unsafe_conditions(None).is_empty());
}

// =============================================================================
// Stale version protocol
// =============================================================================

#[tokio::test]
async fn stale_version_rolls_back_to_trusted_snapshot() {
    let h = builder().build();

    let first = forwarded(
        h.gate
            .evaluate(&mut request(Method::POST, "/memory/save", "{}"))
            .await,
    );
    let trusted_version = first.memory_version.unwrap();

    h.clock.advance(10_000);
    h.provider.inner.publish(|_| {});

    let mut req = with_version(
        request(Method::POST, "/memory/save", "{}"),
        &trusted_version,
    );
    let ctx = forwarded(h.gate.evaluate(&mut req).await);
    assert_eq!(ctx.decision, GateDecision::Allow);
    assert_eq!(ctx.loaded_from, Some(LoadedFrom::Trusted));
    assert_eq!(ctx.memory_version.as_deref(), Some(trusted_version.as_str()));
    assert!(h.audit.contains("dispatch_snapshot_rollback"));
    assert!(h.safety.active_unsafe_conditions(None).is_empty());
    // initial load, forced refresh, rollback
    assert_eq!(
        h.supervisor
            .calls()
            .iter()
            .filter(|c| *c == "heartbeat")
            .count(),
        1 + 3
    );
}

#[tokio::test]
async fn stale_version_without_trusted_snapshot_is_unsafe() {
    let h = builder().build();
    h.clock.advance(10_000);
    h.provider.inner.publish(|_| {});

    let mut req = with_version(request(Method::POST, "/memory/save", "{}"), "1000-aaaaaaaa");
    let before = req.clone();
    let err = rejected(h.gate.evaluate(&mut req).await);
    assert_eq!(req, before);

    let GateError::Unsafe { payload } = err else {
        panic!("expected unsafe");
    };
    assert_eq!(payload.conditions, vec!["MEMORY_VERSION_MISMATCH"]);
    let quarantines = h.safety.active_quarantines(Some(QuarantineKind::Memory));
    assert_eq!(quarantines.len(), 1);
    assert!(!quarantines[0].auto_recoverable);

    // The blocking condition now gates every mutating request.
    let err = rejected(
        h.gate
            .evaluate(&mut request(Method::POST, "/memory/save", "{}"))
            .await,
    );
    assert_eq!(err.kind(), "unsafe");
}

#[tokio::test]
async fn version_still_stale_after_rollback_is_unsafe() {
    let h = builder().build();
    forwarded(
        h.gate
            .evaluate(&mut request(Method::POST, "/memory/save", "{}"))
            .await,
    );
    h.clock.advance(10_000);
    h.provider.inner.publish(|_| {});

    // Older than the trusted snapshot too, so rolling back cannot help.
    let mut req = with_version(request(Method::POST, "/memory/save", "{}"), "1-aaaaaaaa");
    let err = rejected(h.gate.evaluate(&mut req).await);

    assert!(h.audit.contains("dispatch_snapshot_rollback"));
    let GateError::Unsafe { payload } = err else {
        panic!("expected unsafe");
    };
    assert_eq!(payload.conditions, vec!["MEMORY_VERSION_MISMATCH"]);
    let quarantines = h.safety.active_quarantines(Some(QuarantineKind::Memory));
    assert_eq!(quarantines.len(), 1);
    assert!(!quarantines[0].auto_recoverable);
    assert!(h.safety.has_unsafe_blocking_conditions());
}

#[tokio::test]
async fn malformed_version_is_a_conflict() {
    let h = builder().build();
    let mut req = with_version(request(Method::POST, "/memory/save", "{}"), "v-next");
    let err = rejected(h.gate.evaluate(&mut req).await);
    let GateError::Conflict { body } = err else {
        panic!("expected conflict");
    };
    assert_eq!(body.conflict_reason, "malformed_version");
    // one initial load plus exactly one forced refresh
    assert_eq!(h.provider.loads.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Block and reroute
// =============================================================================

#[tokio::test]
async fn route_conflict_blocks_with_409() {
    let h = builder()
        .route("PUT /memory/save", "POST /memory/save")
        .build();
    let mut req = request(Method::PUT, "/memory/save", r#"{"message":"hi"}"#);
    let before = req.clone();
    let err = rejected(h.gate.evaluate(&mut req).await);

    assert_eq!(req, before);
    assert_eq!(err.status_code(), StatusCode::CONFLICT);
    let GateError::Conflict { body } = err else {
        panic!("expected conflict");
    };
    assert_eq!(body.route_attempted, "PUT /memory/save");
    assert_eq!(body.binding_id, "memory-write");
    assert_eq!(body.conflict_reason, "route_conflict");
    assert!(body.memory_version.is_some());

    let events = h.audit.events_named("dispatch_decision");
    let last = events.last().unwrap();
    assert_eq!(last.field("decision").unwrap(), "block");
    assert_eq!(last.field("conflict_reason").unwrap(), "route_conflict");
}

#[tokio::test]
async fn route_conflict_reroutes_to_target() {
    let h = builder()
        .conflict_policy(ConflictPolicy::Reroute)
        .route("PUT /memory/save", "POST /ask")
        .build();
    let mut req = request(
        Method::PUT,
        "/memory/save",
        r#"{"userInput":"store the plan","domain":"memory"}"#,
    );
    let ctx = forwarded(h.gate.evaluate(&mut req).await);

    assert_eq!(ctx.decision, GateDecision::Reroute);
    assert_eq!(ctx.rerouted_from.as_deref(), Some("PUT /memory/save"));
    assert_eq!(req.method, Method::POST);
    assert_eq!(req.uri, "/ask");
    let body: ReroutedBody = serde_json::from_slice(&req.body).unwrap();
    assert_eq!(body.message, "store the plan");
    assert_eq!(body.dispatch_reroute.conflict_reason, "route_conflict");
    assert_eq!(body.dispatch_reroute.prompt_field.as_deref(), Some("userInput"));
}

#[tokio::test]
async fn failed_reroute_restores_the_request_exactly() {
    let h = builder()
        .conflict_policy(ConflictPolicy::Reroute)
        .reroute_target("/bad path")
        .route("PUT /memory/save", "POST /ask")
        .build();
    let mut req = request(Method::PUT, "/memory/save", r#"{"message":"hi"}"#);
    let before = req.clone();

    let err = rejected(h.gate.evaluate(&mut req).await);
    assert_eq!(req, before);
    assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    let GateError::Execution { source, body } = err else {
        panic!("expected execution failure");
    };
    assert_eq!(source, RerouteError::InvalidTarget("/bad path".into()));
    assert_eq!(body.failsafe_reason, "reroute_target_invalid");
    assert_eq!(
        h.supervisor.calls().last().map(String::as_str),
        Some("fail:execution")
    );
}

#[tokio::test]
async fn reroute_without_prompt_is_failsafe() {
    let h = builder()
        .conflict_policy(ConflictPolicy::Reroute)
        .route("PUT /memory/save", "POST /ask")
        .build();
    let mut req = request(Method::PUT, "/memory/save", r#"{"domain":"memory"}"#);
    let before = req.clone();
    let err = rejected(h.gate.evaluate(&mut req).await);
    assert_eq!(req, before);
    assert_eq!(err.reason(), Some("reroute_prompt_empty"));
}

// =============================================================================
// Shadow mode and failsafe
// =============================================================================

#[tokio::test]
async fn shadow_mode_forwards_with_would_have_decision() {
    let h = builder()
        .conflict_policy(ConflictPolicy::Reroute)
        .route("PUT /memory/save", "POST /ask")
        .shadow()
        .build();
    let mut req = request(Method::PUT, "/memory/save", r#"{"message":"hi"}"#);
    let before = req.clone();
    let ctx = forwarded(h.gate.evaluate(&mut req).await);

    assert_eq!(req, before);
    assert!(ctx.shadow);
    assert_eq!(ctx.decision, GateDecision::Reroute);
    assert_eq!(ctx.conflict_reason.as_deref(), Some("route_conflict"));
}

#[tokio::test]
async fn shadow_mode_never_raises_conditions() {
    let h = builder().slow(Duration::from_millis(500)).shadow().build();
    let ctx = forwarded(
        h.gate
            .evaluate(&mut request(Method::POST, "/memory/save", "{}"))
            .await,
    );
    assert!(ctx.shadow);
    assert_eq!(ctx.decision, GateDecision::Unsafe);
    assert!(h.safety.active_unsafe_conditions(None).is_empty());
    assert!(h.safety.active_quarantines(None).is_empty());
}

#[tokio::test]
async fn panic_inside_evaluation_is_failsafe() {
    let h = builder().policy(Arc::new(PanickingPolicy)).build();
    let mut req = request(Method::POST, "/memory/save", "{}");
    let before = req.clone();
    let err = rejected(h.gate.evaluate(&mut req).await);
    assert_eq!(req, before);
    assert_eq!(err.kind(), "internal");
    assert_eq!(err.reason(), Some("gate_panicked"));
    assert_eq!(
        h.supervisor.calls().last().map(String::as_str),
        Some("fail:internal")
    );
}
