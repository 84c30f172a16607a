//! Dispatch consistency gate: admission control for mutating requests
//! against a shared, versioned route-memory snapshot.
//!
//! The [`DispatchGate`] decides per request whether to allow it, block it
//! as conflicting, reroute it to an alternate handler, or declare the
//! system unsafe to proceed. It depends on three collaborator seams, each
//! a trait so tests can substitute fakes:
//!
//! - [`SnapshotProvider`]: current, cached and trusted snapshots
//! - [`PolicyEvaluator`]: binding resolution, validation and action choice
//! - [`InterpreterSupervisor`]: liveness cycles around each evaluation
//!
//! and on the [`SafetyRuntimeStore`](dgate_core::safety::SafetyRuntimeStore)
//! for quarantines and unsafe conditions.
//!
//! # Outcomes
//!
//! ```text
//! exempt-allow   exempt route, no snapshot loaded
//! shadow-allow   shadow mode, decision logged but not enforced
//! allow          forwarded unchanged (x-dispatch-decision: allow)
//! block          409 MEMORY_ROUTE_CONFLICT
//! reroute        forwarded as POST <reroute_target>
//! failsafe       503 DISPATCH_FAILSAFE or 503 UNSAFE_TO_PROCEED
//! ```
//!
//! # Invariants
//!
//! - Exempt routes never load a snapshot.
//! - A timed-out snapshot load with no cache never proceeds on empty state.
//! - A validation failure triggers at most one forced refresh.
//! - A rejected request is never mutated; a failed reroute is restored
//!   exactly.
//! - Every branch emits one `dispatch_decision` audit event.

mod attempt;
mod gate;
pub mod policy;
mod request;
pub mod reroute;
mod response;
pub mod snapshot;
pub mod supervisor;

#[cfg(test)]
mod tests;

pub use attempt::{DispatchAttempt, MAX_INTENT_HINT_CHARS, normalize_path};
pub use gate::{
    DispatchContext, DispatchGate, DispatchGateConfig, GATE_ACTOR, GateDecision, GateOutcome,
    MEMORY_MISMATCH_DEDUPE_KEY, POLICY_TIMEOUT_DEDUPE_KEY,
};
pub use policy::{
    DispatchAction, PolicyEvaluator, RuleBasedPolicyEvaluator, ValidationReason,
    ValidationResult,
};
pub use request::{
    DispatchRequest, DispatchRequestBody, MEMORY_BASELINE_TS_HEADER, MEMORY_VERSION_HEADER,
    RequestSnapshot,
};
pub use reroute::{RerouteError, RerouteProvenance, ReroutedBody};
pub use response::{ConflictBody, DISPATCH_FAILSAFE, FailsafeBody, GateError, MEMORY_ROUTE_CONFLICT};
pub use snapshot::{
    DispatchMemorySnapshot, InMemorySnapshotProvider, LoadedFrom, RouteState, SnapshotError,
    SnapshotLoad, SnapshotProvider,
};
pub use supervisor::{CycleId, CycleSupervisor, InterpreterSupervisor};
