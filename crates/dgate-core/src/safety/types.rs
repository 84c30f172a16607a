//! Safety runtime records, counters and the persisted aggregate.
//!
//! Field names serialize in camelCase so the persisted document and the
//! operator API share one schema.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata key holding a quarantine's dedupe class.
pub const DEDUPE_KEY_FIELD: &str = "dedupeKey";

/// Error string carried by the unsafe-to-proceed payload.
pub const UNSAFE_TO_PROCEED: &str = "UNSAFE_TO_PROCEED";

/// Closed set of unsafe condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnsafeConditionCode {
    /// A client or snapshot memory version could not be reconciled.
    MemoryVersionMismatch,
    /// A trusted integrity baseline did not match.
    PatternIntegrityFailure,
    /// The policy interpreter stopped heartbeating.
    InterpreterHeartbeatLoss,
    /// A policy evaluation timed out with no cached snapshot to fall back on.
    PolicyEngineTimeoutNoFallback,
    /// A worker failed more often than its restart threshold allows.
    WorkerRestartThreshold,
    /// The safety supervisor itself failed.
    SafetySupervisorFailure,
}

impl UnsafeConditionCode {
    /// Returns the wire name of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MemoryVersionMismatch => "MEMORY_VERSION_MISMATCH",
            Self::PatternIntegrityFailure => "PATTERN_INTEGRITY_FAILURE",
            Self::InterpreterHeartbeatLoss => "INTERPRETER_HEARTBEAT_LOSS",
            Self::PolicyEngineTimeoutNoFallback => "POLICY_ENGINE_TIMEOUT_NO_FALLBACK",
            Self::WorkerRestartThreshold => "WORKER_RESTART_THRESHOLD",
            Self::SafetySupervisorFailure => "SAFETY_SUPERVISOR_FAILURE",
        }
    }
}

impl fmt::Display for UnsafeConditionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted, possibly-blocking unsafe condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsafeConditionRecord {
    /// Unique id.
    pub condition_id: String,
    /// Condition code.
    pub code: UnsafeConditionCode,
    /// Human-readable description.
    pub message: String,
    /// Whether the condition blocks mutating traffic.
    pub blocking: bool,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// Monotonic creation timestamp.
    pub monotonic_ts_ms: u64,
    /// Quarantine this condition is tied to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine_id: Option<String>,
    /// Free-form context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    /// RFC 3339 clear time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleared_at: Option<String>,
    /// Actor that cleared the condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleared_by: Option<String>,
    /// Note left by the clearing actor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clear_note: Option<String>,
}

impl UnsafeConditionRecord {
    /// Returns `true` until the condition is cleared.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.cleared_at.is_none()
    }
}

/// Class of subsystem isolated by a quarantine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuarantineKind {
    /// Integrity baseline violation.
    Integrity,
    /// Worker or interpreter failure.
    Worker,
    /// Policy evaluation failure.
    Policy,
    /// Memory snapshot inconsistency.
    Memory,
    /// Anything else.
    Generic,
}

impl fmt::Display for QuarantineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Integrity => "integrity",
            Self::Worker => "worker",
            Self::Policy => "policy",
            Self::Memory => "memory",
            Self::Generic => "generic",
        })
    }
}

/// A persisted quarantine record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyQuarantineRecord {
    /// Unique id.
    pub quarantine_id: String,
    /// Isolated subsystem class.
    pub kind: QuarantineKind,
    /// Why the quarantine exists.
    pub reason: String,
    /// Whether the quarantine stems from an integrity failure.
    pub integrity_failure: bool,
    /// Whether recovery policies may release it automatically.
    pub auto_recoverable: bool,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// Monotonic creation timestamp.
    pub monotonic_ts_ms: u64,
    /// Earliest monotonic time at which auto-recovery may release it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until_ms: Option<u64>,
    /// Free-form context, including the dedupe key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    /// RFC 3339 release time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<String>,
    /// Actor that released the quarantine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_by: Option<String>,
    /// Note left by the releasing actor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_note: Option<String>,
}

impl SafetyQuarantineRecord {
    /// Returns `true` until the quarantine is released.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.released_at.is_none()
    }

    /// Returns the dedupe key stored in metadata, if any.
    #[must_use]
    pub fn dedupe_key(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(DEDUPE_KEY_FIELD))
            .and_then(Value::as_str)
    }

    /// Returns `true` once the cooldown (if any) has elapsed at `now_ms`.
    #[must_use]
    pub fn cooldown_elapsed(&self, now_ms: u64) -> bool {
        self.cooldown_until_ms.is_none_or(|until| now_ms >= until)
    }
}

/// Sliding-window failure counter for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerFailureCounter {
    /// Failures in the current window.
    pub count: u64,
    /// Monotonic start of the current window.
    pub window_started_ms: u64,
    /// Monotonic time of the latest failure.
    pub last_failure_ms: u64,
}

/// Aggregate safety counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SafetyCounters {
    /// Lock collisions observed.
    pub duplicate_suppressions: u64,
    /// Quarantines created.
    pub quarantine_activations: u64,
    /// Worker failure windows by entity key.
    pub worker_failures: BTreeMap<String, WorkerFailureCounter>,
    /// Heartbeat misses by entity key.
    pub heartbeat_misses: BTreeMap<String, u64>,
    /// Healthy cycles by entity key.
    pub healthy_cycles: BTreeMap<String, u64>,
}

impl SafetyCounters {
    /// Returns `true` if any counter map already tracks `key`.
    #[must_use]
    pub fn tracks(&self, key: &str) -> bool {
        self.worker_failures.contains_key(key)
            || self.heartbeat_misses.contains_key(key)
            || self.healthy_cycles.contains_key(key)
    }

    /// Number of distinct entity keys across the three counter maps.
    #[must_use]
    pub fn distinct_entity_keys(&self) -> usize {
        self.worker_failures.len() + self.keys_outside_worker_failures().count()
    }

    /// Returns `true` if at least `cap` distinct entity keys are tracked.
    /// Counting stops at the cap and allocates nothing.
    #[must_use]
    pub fn at_entity_key_cap(&self, cap: usize) -> bool {
        let tracked = self.worker_failures.len();
        tracked >= cap || self.keys_outside_worker_failures().nth(cap - tracked - 1).is_some()
    }

    /// Keys of the heartbeat and healthy-cycle maps not already counted by
    /// an earlier map.
    fn keys_outside_worker_failures(&self) -> impl Iterator<Item = &String> {
        let misses = self
            .heartbeat_misses
            .keys()
            .filter(move |k| !self.worker_failures.contains_key(*k));
        let healthy = self.healthy_cycles.keys().filter(move |k| {
            !self.worker_failures.contains_key(*k) && !self.heartbeat_misses.contains_key(*k)
        });
        misses.chain(healthy)
    }
}

/// The persisted aggregate root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyRuntimeSnapshot {
    /// RFC 3339 time of the last mutation.
    pub updated_at: String,
    /// Condition history, append-only.
    pub conditions: Vec<UnsafeConditionRecord>,
    /// Quarantine history, append-only.
    pub quarantines: Vec<SafetyQuarantineRecord>,
    /// Aggregate counters.
    pub counters: SafetyCounters,
    /// Integrity baselines by id.
    pub trusted_hashes: BTreeMap<String, String>,
}

/// Body of the 503 unsafe-to-proceed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsafeToProceedPayload {
    /// Always [`UNSAFE_TO_PROCEED`].
    pub error: String,
    /// Sorted, deduplicated codes of active blocking conditions.
    pub conditions: Vec<String>,
    /// Sorted ids of active quarantines.
    pub quarantine_ids: Vec<String>,
    /// RFC 3339 build time.
    pub timestamp: String,
}

/// Input to [`activate_unsafe_condition`](super::SafetyRuntimeStore::activate_unsafe_condition).
#[derive(Debug, Clone)]
pub struct ActivateCondition {
    /// Condition code.
    pub code: UnsafeConditionCode,
    /// Human-readable description.
    pub message: String,
    /// Whether the condition blocks mutating traffic.
    pub blocking: bool,
    /// Quarantine to tie the condition to.
    pub quarantine_id: Option<String>,
    /// Free-form context.
    pub metadata: Option<Map<String, Value>>,
}

impl ActivateCondition {
    /// A blocking condition with no quarantine or metadata.
    #[must_use]
    pub fn new(code: UnsafeConditionCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            blocking: true,
            quarantine_id: None,
            metadata: None,
        }
    }

    /// Sets the blocking flag.
    #[must_use]
    pub const fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Ties the condition to a quarantine.
    #[must_use]
    pub fn quarantine(mut self, quarantine_id: impl Into<String>) -> Self {
        self.quarantine_id = Some(quarantine_id.into());
        self
    }

    /// Attaches metadata.
    #[must_use]
    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Input to [`register_quarantine`](super::SafetyRuntimeStore::register_quarantine).
#[derive(Debug, Clone)]
pub struct RegisterQuarantine {
    /// Isolated subsystem class.
    pub kind: QuarantineKind,
    /// Why the quarantine exists.
    pub reason: String,
    /// Whether the quarantine stems from an integrity failure.
    pub integrity_failure: bool,
    /// Whether recovery policies may release it automatically.
    pub auto_recoverable: bool,
    /// Cooldown before auto-recovery may release it.
    pub cooldown_ms: Option<u64>,
    /// At most one active quarantine exists per dedupe key.
    pub dedupe_key: Option<String>,
    /// Free-form context.
    pub metadata: Option<Map<String, Value>>,
}

impl RegisterQuarantine {
    /// An auto-recoverable, non-integrity quarantine.
    #[must_use]
    pub fn new(kind: QuarantineKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            integrity_failure: false,
            auto_recoverable: true,
            cooldown_ms: None,
            dedupe_key: None,
            metadata: None,
        }
    }

    /// Marks the quarantine as an integrity failure.
    #[must_use]
    pub const fn integrity_failure(mut self, integrity_failure: bool) -> Self {
        self.integrity_failure = integrity_failure;
        self
    }

    /// Sets whether auto-recovery may release it.
    #[must_use]
    pub const fn auto_recoverable(mut self, auto_recoverable: bool) -> Self {
        self.auto_recoverable = auto_recoverable;
        self
    }

    /// Sets the cooldown.
    #[must_use]
    pub const fn cooldown_ms(mut self, cooldown_ms: u64) -> Self {
        self.cooldown_ms = Some(cooldown_ms);
        self
    }

    /// Sets the dedupe key.
    #[must_use]
    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// Attaches metadata.
    #[must_use]
    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Options for [`release_quarantine`](super::SafetyRuntimeStore::release_quarantine).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseOptions {
    /// Releasing actor.
    pub actor: String,
    /// Note recorded on the quarantine and its cleared conditions.
    #[serde(default)]
    pub release_note: Option<String>,
    /// Refuse to release anything but integrity quarantines.
    #[serde(default)]
    pub integrity_only: bool,
}

/// Why a release was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseRejection {
    /// No quarantine with that id exists.
    NotFound,
    /// The quarantine was already released.
    AlreadyReleased,
    /// `integrity_only` was set and the quarantine is not an integrity failure.
    NotIntegrity,
}

/// Result of a release attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseOutcome {
    /// Whether the quarantine was released.
    pub released: bool,
    /// Why not, when it was not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReleaseRejection>,
}

impl ReleaseOutcome {
    pub(crate) const fn released() -> Self {
        Self {
            released: true,
            reason: None,
        }
    }

    pub(crate) const fn rejected(reason: ReleaseRejection) -> Self {
        Self {
            released: false,
            reason: Some(reason),
        }
    }
}

/// Running count for a thresholded counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureTally {
    /// Current count.
    pub count: u64,
    /// Whether `count` reached the threshold.
    pub exceeded: bool,
}

impl FailureTally {
    /// The value returned when a key is refused by the cardinality cap.
    pub const REFUSED: Self = Self {
        count: 0,
        exceeded: false,
    };
}
