//! Binding resolution, snapshot validation and action selection.
//!
//! The [`PolicyEvaluator`] trait is the seam for product policy. The gate
//! only depends on its contract; [`RuleBasedPolicyEvaluator`] is the
//! reference rule table.
//!
//! # Stale-version rule
//!
//! The client baseline is the `x-memory-baseline-ts` value when present,
//! otherwise the timestamp parsed from `x-memory-version`. An attempt is
//! `stale_version` iff a baseline exists and
//! `baseline + stale_tolerance < snapshot.monotonic_ts_ms`.

use std::time::Duration;

use dgate_core::binding::{Binding, ConflictPolicy, Sensitivity};
use dgate_core::clock::parse_version_ts;
use dgate_core::config::PolicyConfig;
use serde::{Deserialize, Serialize};

use super::attempt::DispatchAttempt;
use super::snapshot::DispatchMemorySnapshot;

/// Why a validation passed or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationReason {
    /// Consistent with the snapshot.
    Ok,
    /// The client's baseline predates the snapshot beyond tolerance.
    StaleVersion,
    /// The client's memory version header is not parseable.
    MalformedVersion,
    /// The snapshot expects a different route for this attempt.
    RouteConflict,
}

impl ValidationReason {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::StaleVersion => "stale_version",
            Self::MalformedVersion => "malformed_version",
            Self::RouteConflict => "route_conflict",
        }
    }
}

/// Verdict of [`PolicyEvaluator::validate_against_snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    /// Whether the attempt may proceed as-is.
    pub valid: bool,
    /// Reason for the verdict.
    pub reason: ValidationReason,
    /// The snapshot lacks (or has outdated) state for this route and should
    /// be healed after an allow.
    pub requires_snapshot_update: bool,
    /// Route the snapshot expects for this attempt.
    pub expected_route: Option<String>,
}

impl ValidationResult {
    /// A passing verdict.
    #[must_use]
    pub const fn valid() -> Self {
        Self {
            valid: true,
            reason: ValidationReason::Ok,
            requires_snapshot_update: false,
            expected_route: None,
        }
    }

    /// A failing verdict.
    #[must_use]
    pub const fn invalid(reason: ValidationReason) -> Self {
        Self {
            valid: false,
            reason,
            requires_snapshot_update: false,
            expected_route: None,
        }
    }
}

/// Final action for a validated attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchAction {
    /// Forward unchanged.
    Allow,
    /// Reject with 409.
    Block,
    /// Rewrite to the binding's reroute target.
    Reroute,
}

impl DispatchAction {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
            Self::Reroute => "reroute",
        }
    }
}

/// Product policy consumed by the gate.
pub trait PolicyEvaluator: Send + Sync {
    /// Selects the binding for `attempt`, if any.
    fn resolve_binding<'b>(
        &self,
        attempt: &DispatchAttempt,
        bindings: &'b [Binding],
    ) -> Option<&'b Binding>;

    /// Checks `attempt` against `snapshot` given the client's view.
    fn validate_against_snapshot(
        &self,
        binding: Option<&Binding>,
        attempt: &DispatchAttempt,
        snapshot: &DispatchMemorySnapshot,
        client_version: Option<&str>,
        expected_baseline_ts_ms: Option<u64>,
    ) -> ValidationResult;

    /// Maps a verdict onto an action.
    fn decide_action(
        &self,
        validation: &ValidationResult,
        sensitivity: Sensitivity,
        conflict_policy: ConflictPolicy,
    ) -> DispatchAction;
}

/// Reference evaluator: first matching binding wins, timestamp-ordered
/// staleness with a tolerance window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleBasedPolicyEvaluator {
    stale_tolerance: Duration,
}

impl RuleBasedPolicyEvaluator {
    /// Creates an evaluator.
    #[must_use]
    pub const fn new(stale_tolerance: Duration) -> Self {
        Self { stale_tolerance }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn tolerance_ms(&self) -> u64 {
        self.stale_tolerance.as_millis() as u64
    }
}

impl From<&PolicyConfig> for RuleBasedPolicyEvaluator {
    fn from(config: &PolicyConfig) -> Self {
        Self::new(config.stale_tolerance)
    }
}

impl PolicyEvaluator for RuleBasedPolicyEvaluator {
    fn resolve_binding<'b>(
        &self,
        attempt: &DispatchAttempt,
        bindings: &'b [Binding],
    ) -> Option<&'b Binding> {
        bindings
            .iter()
            .find(|b| b.covers_method(&attempt.method) && b.covers_path(&attempt.path))
    }

    fn validate_against_snapshot(
        &self,
        binding: Option<&Binding>,
        attempt: &DispatchAttempt,
        snapshot: &DispatchMemorySnapshot,
        client_version: Option<&str>,
        expected_baseline_ts_ms: Option<u64>,
    ) -> ValidationResult {
        if binding.is_none() {
            return ValidationResult::valid();
        }

        let parsed_version = match client_version {
            Some(version) => match parse_version_ts(version) {
                Some(ts) => Some(ts),
                None => return ValidationResult::invalid(ValidationReason::MalformedVersion),
            },
            None => None,
        };
        let baseline = expected_baseline_ts_ms.or(parsed_version);
        if let Some(baseline) = baseline {
            if baseline.saturating_add(self.tolerance_ms()) < snapshot.monotonic_ts_ms {
                return ValidationResult::invalid(ValidationReason::StaleVersion);
            }
        }

        match snapshot.routes.get(&attempt.route_attempted) {
            Some(state) if state.expected_route != attempt.route_attempted => ValidationResult {
                expected_route: Some(state.expected_route.clone()),
                ..ValidationResult::invalid(ValidationReason::RouteConflict)
            },
            Some(_) => ValidationResult::valid(),
            None => ValidationResult {
                requires_snapshot_update: true,
                expected_route: Some(attempt.route_attempted.clone()),
                ..ValidationResult::valid()
            },
        }
    }

    fn decide_action(
        &self,
        validation: &ValidationResult,
        sensitivity: Sensitivity,
        conflict_policy: ConflictPolicy,
    ) -> DispatchAction {
        if validation.valid {
            return DispatchAction::Allow;
        }
        match conflict_policy {
            ConflictPolicy::Block => DispatchAction::Block,
            ConflictPolicy::Reroute => DispatchAction::Reroute,
            ConflictPolicy::Allow if sensitivity == Sensitivity::High => DispatchAction::Block,
            ConflictPolicy::Allow => DispatchAction::Allow,
        }
    }
}
