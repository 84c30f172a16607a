//! HTTP surface: the gate middleware and the operator routes.
//!
//! [`router`] mounts the operator routes directly and everything else
//! behind [`dispatch_gate`]. The gate wraps the downstream router as a
//! service, so a reroute's rewritten URI is what the downstream router
//! matches on.
//!
//! Forwarded responses carry:
//!
//! - `x-dispatch-memory-version`: memory version the decision used
//! - `x-dispatch-decision`: `allow`, `block` or `reroute`
//! - `x-dispatch-binding`: binding id
//! - `x-dispatch-shadow: true` when the decision was not enforced
//! - `x-dispatch-shadow-outcome`: in shadow mode, the outcome that would
//!   have been enforced (`allow`, `block`, `reroute`, `unsafe`, `failsafe`)
//!
//! A rejection forwarded by shadow mode is reported as `block` in
//! `x-dispatch-decision`. Exempt routes are admitted before the body is
//! read, so the body limit does not apply to them.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{Next, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dgate_core::safety::{ReleaseOptions, ReleaseOutcome, SafetyRuntimeSnapshot};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tower::Layer;

use crate::dispatch::{DispatchContext, DispatchRequest, GateOutcome};
use crate::state::SharedState;

/// Response header carrying the memory version.
pub const MEMORY_VERSION_RESPONSE_HEADER: &str = "x-dispatch-memory-version";

/// Response header carrying the decision.
pub const DECISION_HEADER: &str = "x-dispatch-decision";

/// Response header carrying the binding id.
pub const BINDING_HEADER: &str = "x-dispatch-binding";

/// Response header present when the decision was computed in shadow mode.
pub const SHADOW_HEADER: &str = "x-dispatch-shadow";

/// Response header carrying the unenforced outcome in shadow mode.
pub const SHADOW_OUTCOME_HEADER: &str = "x-dispatch-shadow-outcome";

/// Builds the daemon router: operator routes plus `downstream` behind the
/// gate.
pub fn router(state: SharedState, downstream: Router) -> Router {
    let gated = from_fn_with_state(Arc::clone(&state), dispatch_gate).layer(downstream);
    Router::new()
        .route("/health", get(health))
        .route("/safety", get(safety_snapshot))
        .route("/safety/unsafe", get(unsafe_payload))
        .route("/safety/quarantines/{id}/release", post(release_quarantine))
        .route("/safety/conditions/{id}/clear", post(clear_condition))
        .fallback_service(gated)
        .with_state(state)
}

// =============================================================================
// Gate middleware
// =============================================================================

/// Runs every request through the dispatch gate.
///
/// Rejections are answered here. Forwarded requests get the (possibly
/// rerouted) method, URI, headers and body, plus a [`DispatchContext`]
/// extension; their responses are annotated with the dispatch headers.
/// Exempt routes are forwarded with their body unread.
pub async fn dispatch_gate(
    State(state): State<SharedState>,
    mut req: Request,
    next: Next,
) -> Response {
    if let Some(ctx) = state
        .gate()
        .exempt(req.method().as_str(), req.uri().path())
    {
        req.extensions_mut().insert(ctx.clone());
        let mut response = next.run(req).await;
        annotate(response.headers_mut(), &ctx);
        return response;
    }

    let (mut parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, state.max_body_bytes()).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(
                method = %parts.method,
                path = parts.uri.path(),
                error = %e,
                "request body unreadable"
            );
            return state
                .gate()
                .reject_unreadable_body(parts.method.as_str(), parts.uri.path())
                .into_response();
        },
    };

    let mut dispatch = DispatchRequest::new(
        parts.method.clone(),
        parts.uri.clone(),
        std::mem::take(&mut parts.headers),
        bytes,
    );
    let ctx = match state.gate().evaluate(&mut dispatch).await {
        GateOutcome::Forward(ctx) => ctx,
        GateOutcome::Reject(error) => return error.into_response(),
    };

    parts.method = dispatch.method;
    parts.uri = dispatch.uri;
    parts.headers = dispatch.headers;
    parts.extensions.insert(ctx.clone());

    let mut response = next
        .run(Request::from_parts(parts, Body::from(dispatch.body)))
        .await;
    annotate(response.headers_mut(), &ctx);
    response
}

fn annotate(headers: &mut HeaderMap, ctx: &DispatchContext) {
    if let Some(value) = ctx
        .memory_version
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
    {
        headers.insert(MEMORY_VERSION_RESPONSE_HEADER, value);
    }
    headers.insert(
        DECISION_HEADER,
        HeaderValue::from_static(ctx.decision.header_value()),
    );
    if let Ok(value) = HeaderValue::from_str(&ctx.binding_id) {
        headers.insert(BINDING_HEADER, value);
    }
    if ctx.shadow {
        headers.insert(SHADOW_HEADER, HeaderValue::from_static("true"));
        headers.insert(
            SHADOW_OUTCOME_HEADER,
            HeaderValue::from_static(ctx.decision.as_str()),
        );
    }
}

// =============================================================================
// Operator routes
// =============================================================================

/// Errors returned by the operator routes.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// The request named no actor.
    #[error("actor must not be empty")]
    MissingActor,
}

impl OperatorError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingActor => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for OperatorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Body of `POST /safety/conditions/{id}/clear`.
#[derive(Debug, Deserialize)]
struct ClearRequest {
    actor: String,
    #[serde(default)]
    note: Option<String>,
}

async fn health(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptimeSecs": state.uptime_secs(),
    }))
}

async fn safety_snapshot(State(state): State<SharedState>) -> Json<SafetyRuntimeSnapshot> {
    Json(state.safety().snapshot())
}

async fn unsafe_payload(State(state): State<SharedState>) -> Response {
    let safety = state.safety();
    let status = if safety.has_unsafe_blocking_conditions() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(safety.unsafe_to_proceed_payload())).into_response()
}

async fn release_quarantine(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(options): Json<ReleaseOptions>,
) -> Result<Json<ReleaseOutcome>, OperatorError> {
    if options.actor.trim().is_empty() {
        return Err(OperatorError::MissingActor);
    }
    let outcome = state.safety().release_quarantine(&id, &options);
    tracing::info!(
        quarantine_id = %id,
        actor = %options.actor,
        released = outcome.released,
        "operator quarantine release"
    );
    Ok(Json(outcome))
}

async fn clear_condition(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(request): Json<ClearRequest>,
) -> Result<Json<Value>, OperatorError> {
    if request.actor.trim().is_empty() {
        return Err(OperatorError::MissingActor);
    }
    let cleared =
        state
            .safety()
            .clear_unsafe_condition(&id, &request.actor, request.note.as_deref());
    tracing::info!(
        condition_id = %id,
        actor = %request.actor,
        cleared,
        "operator condition clear"
    );
    Ok(Json(json!({ "cleared": cleared })))
}
