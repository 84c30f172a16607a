//! Gate rejections and their HTTP bodies.
//!
//! Every failure mode the gate can hit is a [`GateError`] variant. None of
//! them propagate past the middleware: each converts into a `409` or `503`
//! JSON response via [`IntoResponse`].

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dgate_core::safety::UnsafeToProceedPayload;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::reroute::RerouteError;

/// `code` of the 409 conflict body.
pub const MEMORY_ROUTE_CONFLICT: &str = "MEMORY_ROUTE_CONFLICT";

/// `code` of the 503 failsafe body.
pub const DISPATCH_FAILSAFE: &str = "DISPATCH_FAILSAFE";

const CONFLICT_ERROR: &str = "Memory route conflict";
const FAILSAFE_ERROR: &str = "Dispatch failsafe triggered";

/// Body of a `409` conflict response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictBody {
    /// Always `"Memory route conflict"`.
    pub error: String,
    /// Always [`MEMORY_ROUTE_CONFLICT`].
    pub code: String,
    /// `"<METHOD> <path>"` of the rejected request.
    pub route_attempted: String,
    /// Memory version the decision was made against.
    pub memory_version: Option<String>,
    /// Binding that blocked the request.
    pub binding_id: String,
    /// Validation reason.
    pub conflict_reason: String,
    /// RFC 3339 decision time.
    pub timestamp: String,
}

impl ConflictBody {
    /// Builds a conflict body.
    #[must_use]
    pub fn new(
        route_attempted: &str,
        memory_version: Option<&str>,
        binding_id: &str,
        conflict_reason: &str,
        timestamp: String,
    ) -> Self {
        Self {
            error: CONFLICT_ERROR.to_string(),
            code: MEMORY_ROUTE_CONFLICT.to_string(),
            route_attempted: route_attempted.to_string(),
            memory_version: memory_version.map(str::to_string),
            binding_id: binding_id.to_string(),
            conflict_reason: conflict_reason.to_string(),
            timestamp,
        }
    }
}

/// Body of a `503` failsafe response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailsafeBody {
    /// Always `"Dispatch failsafe triggered"`.
    pub error: String,
    /// Always [`DISPATCH_FAILSAFE`].
    pub code: String,
    /// `"<METHOD> <path>"` of the rejected request.
    pub route_attempted: String,
    /// Memory version, when a snapshot was loaded.
    pub memory_version: Option<String>,
    /// Binding the request resolved to.
    pub binding_id: String,
    /// Stable machine-readable reason.
    pub failsafe_reason: String,
    /// RFC 3339 decision time.
    pub timestamp: String,
}

impl FailsafeBody {
    /// Builds a failsafe body.
    #[must_use]
    pub fn new(
        route_attempted: &str,
        memory_version: Option<&str>,
        binding_id: &str,
        failsafe_reason: &str,
        timestamp: String,
    ) -> Self {
        Self {
            error: FAILSAFE_ERROR.to_string(),
            code: DISPATCH_FAILSAFE.to_string(),
            route_attempted: route_attempted.to_string(),
            memory_version: memory_version.map(str::to_string),
            binding_id: binding_id.to_string(),
            failsafe_reason: failsafe_reason.to_string(),
            timestamp,
        }
    }
}

/// Everything that makes the gate refuse a request.
#[derive(Debug, Error)]
pub enum GateError {
    /// The snapshot load exceeded the policy timeout with no cache to fall
    /// back on.
    #[error("snapshot load timed out after {timeout_ms}ms with no cached snapshot")]
    Timeout {
        /// Configured budget.
        timeout_ms: u64,
        /// Unsafe-to-proceed payload returned to the client.
        payload: UnsafeToProceedPayload,
    },

    /// A blocking unsafe condition is active, or a version mismatch could
    /// not be reconciled.
    #[error("unsafe to proceed: {}", payload.conditions.join(","))]
    Unsafe {
        /// Unsafe-to-proceed payload returned to the client.
        payload: UnsafeToProceedPayload,
    },

    /// The policy blocked a conflicting request.
    #[error("memory route conflict: {}", body.conflict_reason)]
    Conflict {
        /// Conflict body returned to the client.
        body: ConflictBody,
    },

    /// The reroute rewrite failed and the request was restored.
    #[error("reroute failed: {source}")]
    Execution {
        /// Underlying rewrite error.
        source: RerouteError,
        /// Failsafe body returned to the client.
        body: FailsafeBody,
    },

    /// A reroute precondition did not hold.
    #[error("dispatch configuration error: {}", body.failsafe_reason)]
    Config {
        /// Failsafe body returned to the client.
        body: FailsafeBody,
    },

    /// Anything else, including panics inside the gate.
    #[error("dispatch failsafe: {}", body.failsafe_reason)]
    Internal {
        /// Failsafe body returned to the client.
        body: FailsafeBody,
    },
}

impl GateError {
    /// HTTP status for this error: `409` for conflicts, `503` otherwise.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Timeout { .. }
            | Self::Unsafe { .. }
            | Self::Execution { .. }
            | Self::Config { .. }
            | Self::Internal { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Taxonomy name, used in audit events.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Unsafe { .. } => "unsafe",
            Self::Conflict { .. } => "conflict",
            Self::Execution { .. } => "execution",
            Self::Config { .. } => "config",
            Self::Internal { .. } => "internal",
        }
    }

    /// Reason reported with the rejection, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Timeout { .. } | Self::Unsafe { .. } => None,
            Self::Conflict { body } => Some(&body.conflict_reason),
            Self::Execution { body, .. } | Self::Config { body } | Self::Internal { body } => {
                Some(&body.failsafe_reason)
            },
        }
    }

    /// Memory version reported with the rejection, if any.
    #[must_use]
    pub fn memory_version(&self) -> Option<&str> {
        match self {
            Self::Timeout { .. } | Self::Unsafe { .. } => None,
            Self::Conflict { body } => body.memory_version.as_deref(),
            Self::Execution { body, .. } | Self::Config { body } | Self::Internal { body } => {
                body.memory_version.as_deref()
            },
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            Self::Timeout { payload, .. } | Self::Unsafe { payload } => {
                (status, Json(payload)).into_response()
            },
            Self::Conflict { body } => (status, Json(body)).into_response(),
            Self::Execution { body, .. } | Self::Config { body } | Self::Internal { body } => {
                (status, Json(body)).into_response()
            },
        }
    }
}
