//! End-to-end tests for the gate middleware and operator routes, driven
//! in-process through the axum router.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::{Extension, Json, Router};
use dgate_core::audit::MemoryAuditSink;
use dgate_core::binding::{Binding, ConflictPolicy, ExemptRoute, Sensitivity};
use dgate_core::clock::{ManualClock, VersionClock};
use dgate_core::safety::{
    ActivateCondition, SafetyRuntimeStore, SafetyStoreConfig, UnsafeConditionCode,
};
use dgate_daemon::dispatch::{
    CycleSupervisor, DispatchContext, DispatchGate, DispatchGateConfig, InMemorySnapshotProvider,
    MEMORY_BASELINE_TS_HEADER, RouteState, RuleBasedPolicyEvaluator,
};
use dgate_daemon::http::{
    self, BINDING_HEADER, DECISION_HEADER, MEMORY_VERSION_RESPONSE_HEADER, SHADOW_HEADER,
    SHADOW_OUTCOME_HEADER,
};
use dgate_daemon::state::{DaemonStateHandle, SharedState};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

// =============================================================================
// Test Helpers
// =============================================================================

struct Daemon {
    app: Router,
    state: SharedState,
    provider: Arc<InMemorySnapshotProvider>,
    audit: Arc<MemoryAuditSink>,
}

fn route(expected: &str) -> RouteState {
    RouteState {
        expected_route: expected.into(),
        updated_by: "seed".into(),
        updated_at_ms: 0,
    }
}

fn daemon() -> Daemon {
    daemon_with(false, None)
}

/// Builds a daemon, optionally in shadow mode and backed by `state_file`.
fn daemon_with(shadow_mode: bool, state_file: Option<&Path>) -> Daemon {
    let clock = ManualClock::new(100_000);
    let audit = Arc::new(MemoryAuditSink::new());
    let versions = Arc::new(VersionClock::new(Arc::clone(&clock) as _));

    let mut routes = BTreeMap::new();
    routes.insert("PUT /memory/save".to_string(), route("POST /memory/save"));
    routes.insert("PUT /notes/save".to_string(), route("POST /ask"));
    let provider = Arc::new(InMemorySnapshotProvider::with_routes(versions, routes));

    let safety = Arc::new(match state_file {
        Some(path) => SafetyRuntimeStore::open(
            path,
            SafetyStoreConfig::default(),
            Arc::clone(&clock) as _,
            Arc::clone(&audit) as _,
        )
        .unwrap(),
        None => SafetyRuntimeStore::in_memory(
            SafetyStoreConfig::default(),
            Arc::clone(&clock) as _,
            Arc::clone(&audit) as _,
        ),
    });
    let supervisor = Arc::new(CycleSupervisor::new(
        Arc::clone(&safety),
        dgate_core::config::SupervisorConfig::default(),
        Arc::clone(&clock) as _,
        Arc::clone(&audit) as _,
    ));

    let bindings = vec![
        Binding {
            id: "memory-write".into(),
            sensitivity: Sensitivity::High,
            conflict_policy: ConflictPolicy::Block,
            reroute_target: None,
            exact_paths: vec!["/memory/save".into()],
            path_prefixes: Vec::new(),
            methods: vec!["POST".into(), "PUT".into()],
        },
        Binding {
            id: "notes-write".into(),
            sensitivity: Sensitivity::High,
            conflict_policy: ConflictPolicy::Reroute,
            reroute_target: Some("/ask".into()),
            exact_paths: vec!["/notes/save".into(), "/ask".into()],
            path_prefixes: Vec::new(),
            methods: vec!["POST".into(), "PUT".into()],
        },
    ];
    let config = DispatchGateConfig {
        policy_timeout: Duration::from_millis(200),
        shadow_mode,
        enforce_blocking_conditions: true,
        exempt_routes: vec![ExemptRoute::exact("GET", "/ping")],
        supervisor_entity: "dispatch-gate".into(),
    };
    let gate = DispatchGate::new(
        config,
        bindings,
        Arc::clone(&provider) as _,
        Arc::new(RuleBasedPolicyEvaluator::new(Duration::from_millis(250))),
        supervisor,
        Arc::clone(&safety),
    )
    .with_audit(Arc::clone(&audit) as _)
    .with_clock(clock);

    let state: SharedState = Arc::new(DaemonStateHandle::new(gate, 64 * 1024));
    let app = http::router(Arc::clone(&state), downstream());
    Daemon {
        app,
        state,
        provider,
        audit,
    }
}

fn downstream() -> Router {
    Router::new()
        .route("/memory/save", post(save).put(save))
        .route("/notes/save", post(save).put(save))
        .route("/ask", post(ask))
        .route("/ping", axum::routing::get(|| async { "pong" }))
}

async fn save(Extension(ctx): Extension<DispatchContext>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::CREATED,
        Json(json!({ "handler": "save", "decision": ctx.decision.as_str() })),
    )
}

async fn ask(Extension(ctx): Extension<DispatchContext>, Json(body): Json<Value>) -> Json<Value> {
    Json(json!({
        "handler": "ask",
        "message": body["message"],
        "originalRoute": body["dispatchReroute"]["originalRoute"],
        "reroutedFrom": ctx.rerouted_from,
    }))
}

impl Daemon {
    async fn send(&self, req: Request<Body>) -> Response {
        self.app.clone().oneshot(req).await.unwrap()
    }

    async fn call(&self, method: Method, path: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = self.send(req).await;
        let status = response.status();
        (status, json_body(response).await)
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let response = self.send(req).await;
        let status = response.status();
        (status, json_body(response).await)
    }

    /// Sends a write whose baseline predates every snapshot.
    async fn stale_write(&self) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/memory/save")
            .header("content-type", "application/json")
            .header(MEMORY_BASELINE_TS_HEADER, "1")
            .body(Body::from(r#"{"message":"old"}"#))
            .unwrap();
        let response = self.send(req).await;
        let status = response.status();
        (status, json_body(response).await)
    }
}

async fn json_body(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(
        String::from_utf8_lossy(&bytes).into_owned(),
    ))
}

// =============================================================================
// Forwarding
// =============================================================================

#[tokio::test]
async fn allowed_requests_carry_dispatch_headers() {
    let d = daemon();
    let decided_against = d.provider.current().version_id.clone();
    let req = Request::builder()
        .method(Method::POST)
        .uri("/memory/save")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"message":"hi"}"#))
        .unwrap();
    let response = d.send(req).await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let headers = response.headers();
    assert_eq!(headers[DECISION_HEADER], "allow");
    assert_eq!(headers[BINDING_HEADER], "memory-write");
    assert_eq!(
        headers[MEMORY_VERSION_RESPONSE_HEADER],
        decided_against.as_str()
    );
    assert!(headers.get(SHADOW_HEADER).is_none());
    assert!(headers.get(SHADOW_OUTCOME_HEADER).is_none());

    // Allowing an unseen route records its state in a new snapshot.
    let healed = d.provider.current();
    assert_ne!(healed.version_id, decided_against);
    assert_eq!(
        healed.routes["POST /memory/save"].expected_route,
        "POST /memory/save"
    );
}

#[tokio::test]
async fn exempt_routes_pass_through() {
    let d = daemon();
    let (status, body) = d.get("/ping").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "pong");
}

#[tokio::test]
async fn exempt_routes_skip_the_body_limit() {
    let d = daemon();
    let req = Request::builder()
        .method(Method::GET)
        .uri("/ping")
        .body(Body::from("x".repeat(128 * 1024)))
        .unwrap();
    let response = d.send(req).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[DECISION_HEADER], "allow");
    assert_eq!(response.headers()[BINDING_HEADER], "exempt-readonly");
    assert_eq!(json_body(response).await, "pong");
}

#[tokio::test]
async fn route_conflict_returns_409_body() {
    let d = daemon();
    let (status, body) = d
        .call(Method::PUT, "/memory/save", json!({ "message": "hi" }))
        .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Memory route conflict");
    assert_eq!(body["code"], "MEMORY_ROUTE_CONFLICT");
    assert_eq!(body["route_attempted"], "PUT /memory/save");
    assert_eq!(body["binding_id"], "memory-write");
    assert_eq!(body["conflict_reason"], "route_conflict");
    assert!(body["memory_version"].is_string());
    assert!(d.audit.contains("dispatch_decision"));
}

#[tokio::test]
async fn reroute_reaches_the_target_handler() {
    let d = daemon();
    let req = Request::builder()
        .method(Method::PUT)
        .uri("/notes/save")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"prompt":"summarize the notes"}"#))
        .unwrap();
    let response = d.send(req).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[DECISION_HEADER], "reroute");
    assert_eq!(response.headers()[BINDING_HEADER], "notes-write");
    let body = json_body(response).await;
    assert_eq!(body["handler"], "ask");
    assert_eq!(body["message"], "summarize the notes");
    assert_eq!(body["originalRoute"], "PUT /notes/save");
    assert_eq!(body["reroutedFrom"], "PUT /notes/save");
}

#[tokio::test]
async fn oversized_bodies_are_failsafe() {
    let d = daemon();
    let big = "x".repeat(128 * 1024);
    let (status, body) = d
        .call(Method::POST, "/memory/save", json!({ "message": big }))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "DISPATCH_FAILSAFE");
    assert_eq!(body["failsafe_reason"], "request_body_unreadable");
}

#[tokio::test]
async fn shadow_mode_reports_unsafe_as_block() {
    let d = daemon_with(true, None);
    d.state.safety().activate_unsafe_condition(ActivateCondition::new(
        UnsafeConditionCode::MemoryVersionMismatch,
        "stale baseline",
    ));

    let (status, body) = d
        .call(Method::POST, "/memory/save", json!({ "message": "hi" }))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["handler"], "save");

    let req = Request::builder()
        .method(Method::POST)
        .uri("/memory/save")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"message":"again"}"#))
        .unwrap();
    let response = d.send(req).await;
    let headers = response.headers();
    assert_eq!(headers[DECISION_HEADER], "block");
    assert_eq!(headers[SHADOW_OUTCOME_HEADER], "unsafe");
    assert_eq!(headers[SHADOW_HEADER], "true");
    assert_eq!(headers[BINDING_HEADER], "memory-write");
}

#[tokio::test]
async fn shadow_mode_reports_the_real_outcome_of_allowed_requests() {
    let d = daemon_with(true, None);
    let req = Request::builder()
        .method(Method::POST)
        .uri("/memory/save")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"message":"hi"}"#))
        .unwrap();
    let response = d.send(req).await;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()[DECISION_HEADER], "allow");
    assert_eq!(response.headers()[SHADOW_OUTCOME_HEADER], "allow");
}

// =============================================================================
// Safety state and operator routes
// =============================================================================

#[tokio::test]
async fn version_mismatch_blocks_until_released() {
    let d = daemon();

    let (status, body) = d.stale_write().await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "UNSAFE_TO_PROCEED");
    assert_eq!(body["conditions"], json!(["MEMORY_VERSION_MISMATCH"]));
    let quarantine_id = body["quarantineIds"][0].as_str().unwrap().to_string();

    // Every gated write is now refused, even fresh ones.
    let (status, _) = d
        .call(Method::POST, "/memory/save", json!({ "message": "new" }))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, payload) = d.get("/safety/unsafe").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(payload["quarantineIds"], json!([quarantine_id.clone()]));

    let (status, outcome) = d
        .call(
            Method::POST,
            &format!("/safety/quarantines/{quarantine_id}/release"),
            json!({ "actor": "ops", "releaseNote": "baseline verified" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["released"], true);

    let (status, _) = d.get("/safety/unsafe").await;
    assert_eq!(status, StatusCode::OK);
    assert!(!d.state.safety().has_unsafe_blocking_conditions());

    let (status, _) = d
        .call(Method::POST, "/memory/save", json!({ "message": "new" }))
        .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn operator_routes_bypass_the_gate() {
    let d = daemon();
    d.stale_write().await;

    let (status, health) = d.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");

    let (status, snapshot) = d.get("/safety").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["quarantines"].as_array().unwrap().len(), 1);
    assert_eq!(snapshot["quarantines"][0]["kind"], "memory");
}

#[tokio::test]
async fn operator_actions_require_an_actor() {
    let d = daemon();
    let (_, body) = d.stale_write().await;
    let quarantine_id = body["quarantineIds"][0].as_str().unwrap().to_string();

    let (status, body) = d
        .call(
            Method::POST,
            &format!("/safety/quarantines/{quarantine_id}/release"),
            json!({ "actor": "  " }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "actor must not be empty");
    assert!(d.state.safety().has_unsafe_blocking_conditions());

    let (status, _) = d
        .call(
            Method::POST,
            "/safety/conditions/missing/clear",
            json!({ "actor": "" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn clearing_an_unknown_condition_reports_false() {
    let d = daemon();
    let (status, body) = d
        .call(
            Method::POST,
            "/safety/conditions/nope/clear",
            json!({ "actor": "ops" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleared"], false);
}

#[tokio::test]
async fn quarantine_survives_a_daemon_restart() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("safety-state.json");

    let first = daemon_with(false, Some(&state_file));
    let (status, _) = first.stale_write().await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    first.state.safety().flush().await;
    assert!(state_file.exists());

    let restarted = daemon_with(false, Some(&state_file));
    assert!(restarted.state.safety().has_unsafe_blocking_conditions());
    let (status, body) = restarted
        .call(Method::POST, "/memory/save", json!({ "message": "new" }))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["conditions"], json!(["MEMORY_VERSION_MISMATCH"]));
}
