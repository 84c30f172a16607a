//! Guarded request rewriting for reroute decisions.
//!
//! A reroute is the riskiest action the gate takes: it changes what the
//! downstream handler sees. It therefore runs in two phases:
//!
//! 1. [`check_preconditions`] confirms the binding, the snapshot, the memory
//!    version and the target before anything is touched.
//! 2. [`apply_reroute`] captures a [`RequestSnapshot`], rewrites the request
//!    to `POST <target>`, and restores the snapshot exactly if any step
//!    fails or panics.
//!
//! # Invariants
//!
//! - [INV-RR001] On `Err`, the request's method, URI, body and body headers
//!   equal their values before the call.

use std::panic::{AssertUnwindSafe, catch_unwind};

use axum::http::{HeaderValue, Method, Uri, header};
use bytes::Bytes;
use dgate_core::binding::Binding;
use dgate_core::clock::parse_version_ts;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::request::{DispatchRequest, RequestSnapshot};
use super::snapshot::SnapshotLoad;

/// Why a reroute could not be performed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RerouteError {
    /// No binding matched the request.
    #[error("no binding for rerouted request")]
    MissingBinding,

    /// No snapshot was loaded.
    #[error("snapshot not loaded")]
    SnapshotUnavailable,

    /// The snapshot's memory version does not parse as a timestamp.
    #[error("memory version '{0}' is not a timestamp")]
    UnparseableMemoryVersion(String),

    /// The binding has no reroute target.
    #[error("binding '{0}' has no reroute target")]
    MissingTarget(String),

    /// The reroute target is not one of the binding's exact paths.
    #[error("reroute target '{0}' is not registered on the binding")]
    UnregisteredTarget(String),

    /// The reroute target is not a valid request target.
    #[error("reroute target '{0}' is not a valid URI")]
    InvalidTarget(String),

    /// The rewritten body could not be produced.
    #[error("failed to encode rerouted body: {0}")]
    Encode(String),

    /// The rewritten body carries no prompt.
    #[error("rerouted body has an empty message")]
    EmptyPrompt,

    /// The rewrite panicked.
    #[error("reroute rewrite panicked")]
    Panicked,
}

impl RerouteError {
    /// Stable reason string reported in failsafe bodies.
    #[must_use]
    pub const fn failsafe_reason(&self) -> &'static str {
        match self {
            Self::MissingBinding => "reroute_binding_missing",
            Self::SnapshotUnavailable => "reroute_snapshot_unavailable",
            Self::UnparseableMemoryVersion(_) => "reroute_memory_version_unparseable",
            Self::MissingTarget(_) => "reroute_target_missing",
            Self::UnregisteredTarget(_) => "reroute_target_unregistered",
            Self::InvalidTarget(_) => "reroute_target_invalid",
            Self::Encode(_) => "reroute_body_encode_failed",
            Self::EmptyPrompt => "reroute_prompt_empty",
            Self::Panicked => "reroute_panicked",
        }
    }

    /// `true` for precondition failures (nothing was mutated).
    #[must_use]
    pub const fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::MissingBinding
                | Self::SnapshotUnavailable
                | Self::UnparseableMemoryVersion(_)
                | Self::MissingTarget(_)
                | Self::UnregisteredTarget(_)
        )
    }
}

/// Where a rerouted request came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RerouteProvenance {
    /// `"<METHOD> <path>"` of the original request.
    pub original_route: String,
    /// Original path and query.
    pub original_uri: String,
    /// Body field the prompt was taken from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_field: Option<String>,
    /// Binding that requested the reroute.
    pub binding_id: String,
    /// Validation reason that triggered it.
    pub conflict_reason: String,
    /// Memory version the decision was made against.
    pub memory_version: String,
    /// RFC 3339 decision time.
    pub rerouted_at: String,
}

/// Body sent to the reroute target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReroutedBody {
    /// Best available free-text prompt from the original body.
    pub message: String,
    /// Provenance of the reroute.
    pub dispatch_reroute: RerouteProvenance,
}

/// Confirms every precondition of a reroute and returns the target.
pub fn check_preconditions<'b>(
    binding: Option<&'b Binding>,
    load: Option<&SnapshotLoad>,
) -> Result<&'b str, RerouteError> {
    let binding = binding.ok_or(RerouteError::MissingBinding)?;
    let load = load.ok_or(RerouteError::SnapshotUnavailable)?;
    if parse_version_ts(&load.memory_version).is_none() {
        return Err(RerouteError::UnparseableMemoryVersion(
            load.memory_version.clone(),
        ));
    }
    let target = binding
        .reroute_target
        .as_deref()
        .ok_or_else(|| RerouteError::MissingTarget(binding.id.clone()))?;
    if !binding.has_exact_path(target) {
        return Err(RerouteError::UnregisteredTarget(target.to_string()));
    }
    Ok(target)
}

/// Rewrites `req` to `POST <target>` carrying the best prompt plus
/// `provenance`. On any failure the request is restored exactly.
pub fn apply_reroute(
    req: &mut DispatchRequest,
    target: &str,
    provenance: RerouteProvenance,
) -> Result<(), RerouteError> {
    let snapshot = RequestSnapshot::capture(req);
    let outcome = catch_unwind(AssertUnwindSafe(|| rewrite(req, target, provenance)));
    let error = match outcome {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => e,
        Err(_) => RerouteError::Panicked,
    };
    snapshot.restore(req);
    tracing::warn!(
        target_path = target,
        reason = error.failsafe_reason(),
        "reroute rewrite failed, request restored"
    );
    Err(error)
}

fn rewrite(
    req: &mut DispatchRequest,
    target: &str,
    mut provenance: RerouteProvenance,
) -> Result<(), RerouteError> {
    let original = req.parsed_body();
    let (prompt_field, message) = original
        .as_ref()
        .and_then(|b| b.best_prompt())
        .map_or((None, String::new()), |(field, value)| {
            (Some(field.to_string()), value.trim().to_string())
        });
    provenance.prompt_field = prompt_field;

    req.method = Method::POST;

    let body = serde_json::to_vec(&ReroutedBody {
        message,
        dispatch_reroute: provenance,
    })
    .map_err(|e| RerouteError::Encode(e.to_string()))?;
    let length = body.len();
    req.body = Bytes::from(body);
    req.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    req.headers
        .insert(header::CONTENT_LENGTH, HeaderValue::from(length));

    req.uri = target
        .parse::<Uri>()
        .map_err(|_| RerouteError::InvalidTarget(target.to_string()))?;

    let written: ReroutedBody =
        serde_json::from_slice(&req.body).map_err(|e| RerouteError::Encode(e.to_string()))?;
    if written.message.is_empty() {
        return Err(RerouteError::EmptyPrompt);
    }
    Ok(())
}
