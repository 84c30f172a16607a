//! Liveness supervision for policy evaluation cycles.
//!
//! The gate brackets every evaluation with [`InterpreterSupervisor`] calls:
//! `begin_cycle`, a `heartbeat` at each snapshot load, then exactly one of
//! `complete_cycle` or `fail_cycle`. The supervisor is independent of the
//! gate's decision logic.
//!
//! [`CycleSupervisor`] is the reference implementation. It turns cycle
//! outcomes into safety store signals:
//!
//! ```text
//! complete_cycle ── increment_healthy_cycle ──► ≥ recovery_healthy_cycles?
//!                                                  └─► release auto-recoverable
//!                                                      worker quarantines,
//!                                                      reset_failure_signals
//! fail_cycle ────── increment_worker_failure ──► exceeded?
//!                                                  └─► worker quarantine +
//!                                                      WORKER_RESTART_THRESHOLD
//! sweep_stalled ─── increment_heartbeat_miss ──► exceeded?
//!                                                  └─► worker quarantine +
//!                                                      INTERPRETER_HEARTBEAT_LOSS
//! ```
//!
//! Conditions raised here are advisory (non-blocking) so that traffic keeps
//! flowing and healthy cycles can accumulate toward auto-recovery.
//!
//! # Resource Limits
//!
//! - In-flight cycles are capped at [`MAX_IN_FLIGHT_CYCLES`]; cycles begun
//!   past the cap are not tracked for heartbeats.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use dgate_core::audit::{AuditEmitter, AuditEvent};
use dgate_core::clock::Clock;
use dgate_core::config::SupervisorConfig;
use dgate_core::safety::{
    ActivateCondition, QuarantineKind, RegisterQuarantine, ReleaseOptions, SafetyRuntimeStore,
    UnsafeConditionCode,
};
use serde_json::{Map, Value};

/// Maximum number of tracked in-flight cycles.
pub const MAX_IN_FLIGHT_CYCLES: usize = 4096;

/// Actor recorded on releases performed by auto-recovery.
pub const AUTO_RECOVERY_ACTOR: &str = "supervisor:auto-recovery";

/// Metadata key naming the entity a worker quarantine belongs to.
pub const ENTITY_METADATA_FIELD: &str = "entity";

/// Opaque cycle identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CycleId(String);

impl CycleId {
    /// Creates a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(format!("cycle-{}", uuid::Uuid::new_v4()))
    }

    /// Borrow as `&str`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CycleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Liveness tracking for policy evaluation work.
///
/// Calls are synchronous and must not block.
pub trait InterpreterSupervisor: Send + Sync {
    /// Starts a cycle for `entity_id`. `label` describes the work.
    fn begin_cycle(&self, entity_id: &str, label: &str) -> CycleId;

    /// Signals progress.
    fn heartbeat(&self, cycle: &CycleId);

    /// Ends a cycle successfully.
    fn complete_cycle(&self, cycle: &CycleId);

    /// Ends a cycle with a failure.
    fn fail_cycle(&self, cycle: &CycleId, reason: &str);
}

#[derive(Debug, Clone)]
struct InFlightCycle {
    entity_id: String,
    label: String,
    started_ms: u64,
    last_heartbeat_ms: u64,
    misses: u64,
}

/// Supervisor backed by the safety runtime store.
pub struct CycleSupervisor {
    store: Arc<SafetyRuntimeStore>,
    config: SupervisorConfig,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditEmitter>,
    cycles: Mutex<HashMap<CycleId, InFlightCycle>>,
}

impl fmt::Debug for CycleSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CycleSupervisor")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl CycleSupervisor {
    /// Creates a supervisor.
    #[must_use]
    pub fn new(
        store: Arc<SafetyRuntimeStore>,
        config: SupervisorConfig,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditEmitter>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            audit,
            cycles: Mutex::new(HashMap::new()),
        }
    }

    /// Number of tracked in-flight cycles.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    /// Counts a heartbeat miss for every cycle silent for longer than the
    /// heartbeat timeout. Returns the number of stalled cycles.
    ///
    /// A cycle that reaches the miss threshold is quarantined and dropped
    /// from tracking.
    pub fn sweep_stalled(&self) -> usize {
        let now = self.clock.monotonic_ms();
        let timeout_ms = duration_ms(self.config.heartbeat_timeout);
        let stalled: Vec<(CycleId, InFlightCycle)> = {
            let mut cycles = self.lock();
            cycles
                .iter_mut()
                .filter(|(_, c)| now.saturating_sub(c.last_heartbeat_ms) > timeout_ms)
                .map(|(id, c)| {
                    c.last_heartbeat_ms = now;
                    c.misses += 1;
                    (id.clone(), c.clone())
                })
                .collect()
        };

        for (id, cycle) in &stalled {
            let tally = self
                .store
                .increment_heartbeat_miss(&cycle.entity_id, self.config.heartbeat_miss_threshold);
            tracing::warn!(
                cycle = %id,
                entity = %cycle.entity_id,
                label = %cycle.label,
                stalled_ms = now.saturating_sub(cycle.started_ms),
                misses = tally.count,
                "evaluation cycle missed heartbeat"
            );
            if tally.exceeded {
                self.quarantine_entity(
                    &cycle.entity_id,
                    UnsafeConditionCode::InterpreterHeartbeatLoss,
                    &format!("{} heartbeat misses", tally.count),
                );
            }
            if cycle.misses >= self.config.heartbeat_miss_threshold {
                self.lock().remove(id);
            }
        }
        stalled.len()
    }

    fn quarantine_entity(&self, entity_id: &str, code: UnsafeConditionCode, detail: &str) {
        let mut metadata = Map::new();
        metadata.insert(ENTITY_METADATA_FIELD.into(), Value::from(entity_id));
        metadata.insert("code".into(), Value::from(code.as_str()));
        let quarantine = self.store.register_quarantine(
            RegisterQuarantine::new(QuarantineKind::Worker, format!("{code}: {detail}"))
                .auto_recoverable(true)
                .cooldown_ms(duration_ms(self.config.failure_window))
                .dedupe_key(format!("worker:{entity_id}"))
                .metadata(metadata),
        );
        self.store.activate_unsafe_condition(
            ActivateCondition::new(code, format!("{entity_id}: {detail}"))
                .blocking(false)
                .quarantine(quarantine.quarantine_id),
        );
    }

    fn recover(&self, entity_id: &str, healthy_cycles: u64) {
        let now = self.clock.monotonic_ms();
        let eligible: Vec<String> = self
            .store
            .active_quarantines(Some(QuarantineKind::Worker))
            .into_iter()
            .filter(|q| {
                q.auto_recoverable
                    && q.cooldown_elapsed(now)
                    && q.metadata
                        .as_ref()
                        .and_then(|m| m.get(ENTITY_METADATA_FIELD))
                        .and_then(Value::as_str)
                        == Some(entity_id)
            })
            .map(|q| q.quarantine_id)
            .collect();

        let options = ReleaseOptions {
            actor: AUTO_RECOVERY_ACTOR.to_string(),
            release_note: Some(format!("{healthy_cycles} consecutive healthy cycles")),
            integrity_only: false,
        };
        let released = eligible
            .iter()
            .filter(|id| self.store.release_quarantine(id, &options).released)
            .count();
        self.store.reset_failure_signals(entity_id);
        if released > 0 {
            self.audit.emit(
                AuditEvent::info("supervisor_auto_recovery")
                    .with("entity", entity_id)
                    .with("released", released)
                    .with("healthyCycles", healthy_cycles),
            );
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CycleId, InFlightCycle>> {
        self.cycles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl InterpreterSupervisor for CycleSupervisor {
    fn begin_cycle(&self, entity_id: &str, label: &str) -> CycleId {
        let id = CycleId::new();
        let now = self.clock.monotonic_ms();
        let mut cycles = self.lock();
        if cycles.len() >= MAX_IN_FLIGHT_CYCLES {
            tracing::warn!(
                entity = entity_id,
                limit = MAX_IN_FLIGHT_CYCLES,
                "in-flight cycle limit reached, cycle not tracked"
            );
            return id;
        }
        cycles.insert(
            id.clone(),
            InFlightCycle {
                entity_id: entity_id.to_string(),
                label: label.to_string(),
                started_ms: now,
                last_heartbeat_ms: now,
                misses: 0,
            },
        );
        id
    }

    fn heartbeat(&self, cycle: &CycleId) {
        let now = self.clock.monotonic_ms();
        if let Some(c) = self.lock().get_mut(cycle) {
            c.last_heartbeat_ms = now;
        }
    }

    fn complete_cycle(&self, cycle: &CycleId) {
        let Some(c) = self.lock().remove(cycle) else {
            tracing::debug!(cycle = %cycle, "completed untracked cycle");
            return;
        };
        let healthy = self.store.increment_healthy_cycle(&c.entity_id);
        if healthy >= self.config.recovery_healthy_cycles {
            self.recover(&c.entity_id, healthy);
        }
    }

    fn fail_cycle(&self, cycle: &CycleId, reason: &str) {
        let Some(c) = self.lock().remove(cycle) else {
            tracing::debug!(cycle = %cycle, reason, "failed untracked cycle");
            return;
        };
        let tally = self.store.increment_worker_failure(
            &c.entity_id,
            self.config.worker_failure_threshold,
            duration_ms(self.config.failure_window),
        );
        tracing::warn!(
            cycle = %cycle,
            entity = %c.entity_id,
            reason,
            failures = tally.count,
            "evaluation cycle failed"
        );
        if tally.exceeded {
            self.quarantine_entity(
                &c.entity_id,
                UnsafeConditionCode::WorkerRestartThreshold,
                &format!("{} failures in window, last: {reason}", tally.count),
            );
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn duration_ms(d: std::time::Duration) -> u64 {
    d.as_millis() as u64
}
