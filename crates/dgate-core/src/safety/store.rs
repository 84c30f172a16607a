//! The safety runtime store.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};
use thiserror::Error;

use super::keys::normalize_entity_key;
use super::persist::{PersistHandle, load_snapshot};
use super::types::{
    ActivateCondition, DEDUPE_KEY_FIELD, FailureTally, QuarantineKind, RegisterQuarantine,
    ReleaseOptions, ReleaseOutcome, ReleaseRejection, SafetyQuarantineRecord,
    SafetyRuntimeSnapshot, UNSAFE_TO_PROCEED, UnsafeConditionCode, UnsafeConditionRecord,
    UnsafeToProceedPayload, WorkerFailureCounter,
};
use crate::audit::{AuditEmitter, AuditEvent};
use crate::clock::{Clock, rfc3339_ms};
use crate::config::{DEFAULT_MAX_ENTITY_KEYS, SafetyConfig};

/// Errors from opening a persistent store.
#[derive(Debug, Error)]
pub enum SafetyStoreError {
    /// Persistence needs a tokio runtime to host the writer task.
    #[error("a tokio runtime is required for safety state persistence")]
    NoRuntime,
}

/// Store limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyStoreConfig {
    /// Cap on distinct entity keys across the counter maps.
    pub max_entity_keys: usize,
    /// Quiet period before a scheduled write is flushed.
    pub persist_debounce: std::time::Duration,
}

impl Default for SafetyStoreConfig {
    fn default() -> Self {
        Self {
            max_entity_keys: DEFAULT_MAX_ENTITY_KEYS,
            persist_debounce: std::time::Duration::from_millis(100),
        }
    }
}

impl From<&SafetyConfig> for SafetyStoreConfig {
    fn from(config: &SafetyConfig) -> Self {
        Self {
            max_entity_keys: config.max_entity_keys,
            persist_debounce: config.persist_debounce,
        }
    }
}

/// The single authoritative record of unsafe conditions, quarantines,
/// failure counters and trusted hashes.
///
/// Every method takes `&self`; the in-memory snapshot sits behind a mutex
/// held only for the duration of one record mutation, never across an
/// await. Each mutation schedules a debounced write (see
/// [`persist`](super::persist)); reads return deep clones.
pub struct SafetyRuntimeStore {
    state: Arc<Mutex<SafetyRuntimeSnapshot>>,
    config: SafetyStoreConfig,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditEmitter>,
    persistence: Option<PersistHandle>,
}

impl std::fmt::Debug for SafetyRuntimeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyRuntimeStore")
            .field("config", &self.config)
            .field("path", &self.persistence.as_ref().map(|p| &p.shared.path))
            .finish_non_exhaustive()
    }
}

impl SafetyRuntimeStore {
    /// Creates an empty, memory-only store.
    #[must_use]
    pub fn in_memory(
        config: SafetyStoreConfig,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditEmitter>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(SafetyRuntimeSnapshot::default())),
            config,
            clock,
            audit,
            persistence: None,
        }
    }

    /// Opens a store backed by `path`, loading it defensively and spawning
    /// the background writer on the current tokio runtime.
    pub fn open(
        path: impl Into<PathBuf>,
        config: SafetyStoreConfig,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditEmitter>,
    ) -> Result<Self, SafetyStoreError> {
        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| SafetyStoreError::NoRuntime)?;
        let path = path.into();
        let loaded = load_snapshot(&path);
        tracing::info!(
            path = %path.display(),
            conditions = loaded.conditions.len(),
            quarantines = loaded.quarantines.len(),
            "safety runtime state loaded"
        );
        let state = Arc::new(Mutex::new(loaded));
        let persistence = PersistHandle::spawn(
            &handle,
            path,
            config.persist_debounce,
            Arc::clone(&state),
            Arc::clone(&audit),
        );
        Ok(Self {
            state,
            config,
            clock,
            audit,
            persistence: Some(persistence),
        })
    }

    /// Path of the backing file, if persistent.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.persistence.as_ref().map(|p| p.shared.path.as_path())
    }

    /// Number of completed disk writes.
    #[must_use]
    pub fn persisted_writes(&self) -> u64 {
        self.persistence
            .as_ref()
            .map_or(0, |p| p.shared.writes.load(Ordering::SeqCst))
    }

    /// Writes any pending mutation now and waits for it.
    pub async fn flush(&self) {
        if let Some(persistence) = &self.persistence {
            persistence.flush().await;
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Returns a deep clone of the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> SafetyRuntimeSnapshot {
        self.lock().clone()
    }

    /// Returns uncleared conditions, optionally filtered by code.
    #[must_use]
    pub fn active_unsafe_conditions(
        &self,
        code: Option<UnsafeConditionCode>,
    ) -> Vec<UnsafeConditionRecord> {
        self.lock()
            .conditions
            .iter()
            .filter(|c| c.is_active() && code.is_none_or(|code| c.code == code))
            .cloned()
            .collect()
    }

    /// Returns unreleased quarantines, optionally filtered by kind.
    #[must_use]
    pub fn active_quarantines(&self, kind: Option<QuarantineKind>) -> Vec<SafetyQuarantineRecord> {
        self.lock()
            .quarantines
            .iter()
            .filter(|q| q.is_active() && kind.is_none_or(|kind| q.kind == kind))
            .cloned()
            .collect()
    }

    /// Returns `true` iff any active condition is blocking.
    #[must_use]
    pub fn has_unsafe_blocking_conditions(&self) -> bool {
        self.lock()
            .conditions
            .iter()
            .any(|c| c.is_active() && c.blocking)
    }

    /// Builds the 503 payload from active blocking conditions and active
    /// quarantines. Codes and ids are sorted and deduplicated.
    #[must_use]
    pub fn unsafe_to_proceed_payload(&self) -> UnsafeToProceedPayload {
        let state = self.lock();
        let conditions: BTreeSet<&'static str> = state
            .conditions
            .iter()
            .filter(|c| c.is_active() && c.blocking)
            .map(|c| c.code.as_str())
            .collect();
        let quarantine_ids: BTreeSet<&str> = state
            .quarantines
            .iter()
            .filter(|q| q.is_active())
            .map(|q| q.quarantine_id.as_str())
            .collect();
        UnsafeToProceedPayload {
            error: UNSAFE_TO_PROCEED.to_string(),
            conditions: conditions.into_iter().map(str::to_string).collect(),
            quarantine_ids: quarantine_ids.into_iter().map(str::to_string).collect(),
            timestamp: rfc3339_ms(self.clock.now_ms()),
        }
    }

    /// Returns the integrity baseline for `id`.
    #[must_use]
    pub fn trusted_hash(&self, id: &str) -> Option<String> {
        self.lock().trusted_hashes.get(id).cloned()
    }

    // =========================================================================
    // Conditions
    // =========================================================================

    /// Activates a condition, or returns the active one with the same
    /// `(code, quarantine_id)` unchanged.
    pub fn activate_unsafe_condition(&self, input: ActivateCondition) -> UnsafeConditionRecord {
        let record = {
            let mut state = self.lock();
            if let Some(existing) = state.conditions.iter().find(|c| {
                c.is_active() && c.code == input.code && c.quarantine_id == input.quarantine_id
            }) {
                return existing.clone();
            }
            let now_ms = self.clock.now_ms();
            let record = UnsafeConditionRecord {
                condition_id: format!("cond-{}", uuid::Uuid::new_v4()),
                code: input.code,
                message: input.message,
                blocking: input.blocking,
                created_at: rfc3339_ms(now_ms),
                monotonic_ts_ms: self.clock.monotonic_ms(),
                quarantine_id: input.quarantine_id,
                metadata: input.metadata,
                cleared_at: None,
                cleared_by: None,
                clear_note: None,
            };
            state.conditions.push(record.clone());
            state.updated_at = rfc3339_ms(now_ms);
            record
        };
        self.schedule_persist();
        self.audit.emit(
            AuditEvent::warn("unsafe_condition_activated")
                .with("conditionId", &record.condition_id)
                .with("code", record.code)
                .with("blocking", record.blocking)
                .with("quarantineId", &record.quarantine_id)
                .with("message", &record.message),
        );
        record
    }

    /// Clears one condition. Returns `false` if it is missing or already
    /// cleared.
    pub fn clear_unsafe_condition(&self, condition_id: &str, actor: &str, note: Option<&str>) -> bool {
        let cleared = {
            let mut state = self.lock();
            let now = rfc3339_ms(self.clock.now_ms());
            let Some(record) = state
                .conditions
                .iter_mut()
                .find(|c| c.condition_id == condition_id)
            else {
                return false;
            };
            if !record.is_active() {
                return false;
            }
            mark_cleared(record, &now, actor, note);
            let code = record.code;
            state.updated_at = now;
            code
        };
        self.schedule_persist();
        self.audit.emit(
            AuditEvent::info("unsafe_condition_cleared")
                .with("conditionId", condition_id)
                .with("code", cleared)
                .with("actor", actor),
        );
        true
    }

    /// Clears every active condition tied to `quarantine_id`. Returns how
    /// many were cleared.
    pub fn clear_unsafe_conditions_by_quarantine(
        &self,
        quarantine_id: &str,
        actor: &str,
        note: Option<&str>,
    ) -> usize {
        let cleared = {
            let mut state = self.lock();
            let now = rfc3339_ms(self.clock.now_ms());
            let mut cleared = 0;
            for record in state
                .conditions
                .iter_mut()
                .filter(|c| c.is_active() && c.quarantine_id.as_deref() == Some(quarantine_id))
            {
                mark_cleared(record, &now, actor, note);
                cleared += 1;
            }
            if cleared > 0 {
                state.updated_at = now;
            }
            cleared
        };
        if cleared > 0 {
            self.schedule_persist();
            self.audit.emit(
                AuditEvent::info("unsafe_conditions_cleared_by_quarantine")
                    .with("quarantineId", quarantine_id)
                    .with("cleared", cleared)
                    .with("actor", actor),
            );
        }
        cleared
    }

    // =========================================================================
    // Quarantines
    // =========================================================================

    /// Registers a quarantine, or returns the active one sharing its dedupe
    /// key unchanged.
    pub fn register_quarantine(&self, input: RegisterQuarantine) -> SafetyQuarantineRecord {
        let record = {
            let mut state = self.lock();
            if let Some(key) = input.dedupe_key.as_deref() {
                if let Some(existing) = state
                    .quarantines
                    .iter()
                    .find(|q| q.is_active() && q.dedupe_key() == Some(key))
                {
                    return existing.clone();
                }
            }

            let now_ms = self.clock.now_ms();
            let monotonic_ts_ms = self.clock.monotonic_ms();
            let mut metadata = input.metadata;
            if let Some(key) = input.dedupe_key {
                metadata
                    .get_or_insert_with(Map::new)
                    .insert(DEDUPE_KEY_FIELD.to_string(), Value::String(key));
            }
            let record = SafetyQuarantineRecord {
                quarantine_id: format!("q-{}", uuid::Uuid::new_v4()),
                kind: input.kind,
                reason: input.reason,
                integrity_failure: input.integrity_failure,
                auto_recoverable: input.auto_recoverable,
                created_at: rfc3339_ms(now_ms),
                monotonic_ts_ms,
                cooldown_until_ms: input
                    .cooldown_ms
                    .map(|ms| monotonic_ts_ms.saturating_add(ms)),
                metadata,
                released_at: None,
                released_by: None,
                release_note: None,
            };
            state.quarantines.push(record.clone());
            state.counters.quarantine_activations += 1;
            state.updated_at = rfc3339_ms(now_ms);
            record
        };
        self.schedule_persist();
        self.audit.emit(
            AuditEvent::warn("quarantine_registered")
                .with("quarantineId", &record.quarantine_id)
                .with("kind", record.kind)
                .with("reason", &record.reason)
                .with("integrityFailure", record.integrity_failure)
                .with("dedupeKey", record.dedupe_key()),
        );
        record
    }

    /// Releases a quarantine and clears its linked conditions.
    pub fn release_quarantine(&self, quarantine_id: &str, options: &ReleaseOptions) -> ReleaseOutcome {
        {
            let mut state = self.lock();
            let Some(record) = state
                .quarantines
                .iter_mut()
                .find(|q| q.quarantine_id == quarantine_id)
            else {
                return ReleaseOutcome::rejected(ReleaseRejection::NotFound);
            };
            if !record.is_active() {
                return ReleaseOutcome::rejected(ReleaseRejection::AlreadyReleased);
            }
            if options.integrity_only && !record.integrity_failure {
                return ReleaseOutcome::rejected(ReleaseRejection::NotIntegrity);
            }
            let now = rfc3339_ms(self.clock.now_ms());
            record.released_at = Some(now.clone());
            record.released_by = Some(options.actor.clone());
            record.release_note.clone_from(&options.release_note);
            state.updated_at = now;
        }
        self.schedule_persist();
        self.audit.emit(
            AuditEvent::info("quarantine_released")
                .with("quarantineId", quarantine_id)
                .with("actor", &options.actor)
                .with("integrityOnly", options.integrity_only),
        );
        self.clear_unsafe_conditions_by_quarantine(
            quarantine_id,
            &options.actor,
            options.release_note.as_deref(),
        );
        ReleaseOutcome::released()
    }

    // =========================================================================
    // Counters
    // =========================================================================

    /// Counts a lock collision and returns the running total.
    pub fn record_duplicate_suppression(&self, lock_key: &str) -> u64 {
        let total = {
            let mut state = self.lock();
            state.counters.duplicate_suppressions += 1;
            state.updated_at = rfc3339_ms(self.clock.now_ms());
            state.counters.duplicate_suppressions
        };
        self.schedule_persist();
        self.audit.emit(
            AuditEvent::debug("duplicate_suppressed")
                .with("lockKey", normalize_entity_key(lock_key))
                .with("total", total),
        );
        total
    }

    /// Records a worker failure in a sliding window.
    ///
    /// A failure later than `window_started_ms + window_ms` restarts the
    /// window at 1. Keys refused by the cardinality cap yield
    /// [`FailureTally::REFUSED`].
    pub fn increment_worker_failure(&self, worker_id: &str, threshold: u64, window_ms: u64) -> FailureTally {
        let Some(key) = normalize_entity_key(worker_id) else {
            return FailureTally::REFUSED;
        };
        let tally = {
            let mut state = self.lock();
            if !self.admit_key(&state, &key) {
                drop(state);
                self.audit_key_refused(&key, "workerFailures");
                return FailureTally::REFUSED;
            }
            let now = self.clock.monotonic_ms();
            let counter = state
                .counters
                .worker_failures
                .entry(key.clone())
                .and_modify(|c| {
                    if now > c.window_started_ms.saturating_add(window_ms) {
                        c.count = 1;
                        c.window_started_ms = now;
                    } else {
                        c.count += 1;
                    }
                    c.last_failure_ms = now;
                })
                .or_insert(WorkerFailureCounter {
                    count: 1,
                    window_started_ms: now,
                    last_failure_ms: now,
                });
            let count = counter.count;
            state.updated_at = rfc3339_ms(self.clock.now_ms());
            FailureTally {
                count,
                exceeded: count >= threshold,
            }
        };
        self.schedule_persist();
        if tally.exceeded {
            self.audit.emit(
                AuditEvent::warn("worker_failure_threshold_exceeded")
                    .with("entity", &key)
                    .with("count", tally.count)
                    .with("threshold", threshold),
            );
        }
        tally
    }

    /// Clears failure and heartbeat-miss counters for an entity and seeds
    /// its healthy-cycle count at zero.
    pub fn reset_failure_signals(&self, entity_id: &str) {
        let Some(key) = normalize_entity_key(entity_id) else {
            return;
        };
        {
            let mut state = self.lock();
            if !self.admit_key(&state, &key) {
                drop(state);
                self.audit_key_refused(&key, "healthyCycles");
                return;
            }
            state.counters.worker_failures.remove(&key);
            state.counters.heartbeat_misses.remove(&key);
            state.counters.healthy_cycles.insert(key.clone(), 0);
            state.updated_at = rfc3339_ms(self.clock.now_ms());
        }
        self.schedule_persist();
        self.audit
            .emit(AuditEvent::info("failure_signals_reset").with("entity", &key));
    }

    /// Counts a heartbeat miss and resets the entity's healthy cycles.
    pub fn increment_heartbeat_miss(&self, entity_id: &str, threshold: u64) -> FailureTally {
        let Some(key) = normalize_entity_key(entity_id) else {
            return FailureTally::REFUSED;
        };
        let tally = {
            let mut state = self.lock();
            if !self.admit_key(&state, &key) {
                drop(state);
                self.audit_key_refused(&key, "heartbeatMisses");
                return FailureTally::REFUSED;
            }
            let misses = state.counters.heartbeat_misses.entry(key.clone()).or_insert(0);
            *misses += 1;
            let count = *misses;
            state.counters.healthy_cycles.insert(key.clone(), 0);
            state.updated_at = rfc3339_ms(self.clock.now_ms());
            FailureTally {
                count,
                exceeded: count >= threshold,
            }
        };
        self.schedule_persist();
        self.audit.emit(
            AuditEvent::warn("heartbeat_missed")
                .with("entity", &key)
                .with("count", tally.count)
                .with("exceeded", tally.exceeded),
        );
        tally
    }

    /// Counts a healthy cycle and returns the running total (0 if the key
    /// is refused by the cardinality cap).
    pub fn increment_healthy_cycle(&self, entity_id: &str) -> u64 {
        let Some(key) = normalize_entity_key(entity_id) else {
            return 0;
        };
        let count = {
            let mut state = self.lock();
            if !self.admit_key(&state, &key) {
                drop(state);
                self.audit_key_refused(&key, "healthyCycles");
                return 0;
            }
            let cycles = state.counters.healthy_cycles.entry(key).or_insert(0);
            *cycles += 1;
            let count = *cycles;
            state.updated_at = rfc3339_ms(self.clock.now_ms());
            count
        };
        self.schedule_persist();
        count
    }

    // =========================================================================
    // Trusted hashes
    // =========================================================================

    /// Stores an integrity baseline. Empty hashes are ignored.
    pub fn set_trusted_hash(&self, id: &str, hash: &str) {
        let hash = hash.trim();
        if hash.is_empty() {
            return;
        }
        {
            let mut state = self.lock();
            state.trusted_hashes.insert(id.to_string(), hash.to_string());
            state.updated_at = rfc3339_ms(self.clock.now_ms());
        }
        self.schedule_persist();
    }

    // =========================================================================
    // Test support
    // =========================================================================

    /// Wipes in-memory state and deletes the backing file. Delete errors
    /// are swallowed and writes scheduled before the reset are discarded.
    pub fn reset_for_tests(&self) {
        *self.lock() = SafetyRuntimeSnapshot::default();
        if let Some(persistence) = &self.persistence {
            persistence.reset();
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn lock(&self) -> MutexGuard<'_, SafetyRuntimeSnapshot> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Admits `key` if already tracked or if the distinct-key count is
    /// below the cap.
    fn admit_key(&self, state: &SafetyRuntimeSnapshot, key: &str) -> bool {
        state.counters.tracks(key) || !state.counters.at_entity_key_cap(self.config.max_entity_keys)
    }

    /// Audits a key refused by the cap. Call with the state lock released.
    fn audit_key_refused(&self, key: &str, counter: &str) {
        self.audit.emit(
            AuditEvent::warn("entity_key_cap_reached")
                .with("entity", key)
                .with("counter", counter)
                .with("maxEntityKeys", self.config.max_entity_keys),
        );
    }

    fn schedule_persist(&self) {
        if let Some(persistence) = &self.persistence {
            persistence.schedule(self.audit.as_ref());
        }
    }
}

fn mark_cleared(record: &mut UnsafeConditionRecord, now: &str, actor: &str, note: Option<&str>) {
    record.cleared_at = Some(now.to_string());
    record.cleared_by = Some(actor.to_string());
    record.clear_note = note.map(str::to_string);
}
