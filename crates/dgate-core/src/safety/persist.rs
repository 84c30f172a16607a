//! Debounced, coalescing persistence for the safety runtime snapshot.
//!
//! Mutations never touch the disk. They send a [`PersistCommand::Schedule`]
//! over a bounded channel to a background writer task; the writer waits for
//! a quiet period of `debounce` after the latest schedule (capped at
//! [`MAX_COALESCE_FACTOR`] × `debounce` from the first one) and then writes
//! the whole document once.
//!
//! # Durability
//!
//! Writes go to a sibling temp file that is renamed over the target, so a
//! crash mid-write leaves the previous document intact. Loading is
//! defensive: see [`load_snapshot`].
//!
//! # Invariants
//!
//! - [INV-SP001] Persistence failures are reported to the audit emitter and
//!   never propagate to the mutating caller.
//! - [INV-SP002] A write scheduled before a reset is discarded.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::types::{
    SafetyCounters, SafetyQuarantineRecord, SafetyRuntimeSnapshot, UnsafeConditionRecord,
    WorkerFailureCounter,
};
use crate::audit::{AuditEmitter, AuditEvent};

/// Capacity of the writer command queue.
pub const PERSIST_QUEUE_CAPACITY: usize = 64;

/// Upper bound on coalescing, in multiples of the debounce interval.
pub const MAX_COALESCE_FACTOR: u32 = 10;

/// Commands accepted by the writer task.
#[derive(Debug)]
pub(crate) enum PersistCommand {
    /// A mutation happened under `generation`.
    Schedule { generation: u64 },
    /// Write now if anything is pending, then acknowledge.
    Flush(oneshot::Sender<()>),
}

/// Shared between the store and its writer task.
#[derive(Debug)]
pub(crate) struct PersistShared {
    pub(crate) path: PathBuf,
    pub(crate) generation: AtomicU64,
    pub(crate) writes: AtomicU64,
}

/// Store-side handle to the writer task.
#[derive(Debug)]
pub(crate) struct PersistHandle {
    pub(crate) shared: Arc<PersistShared>,
    tx: mpsc::Sender<PersistCommand>,
}

impl PersistHandle {
    /// Spawns the writer on the current tokio runtime.
    pub(crate) fn spawn(
        handle: &tokio::runtime::Handle,
        path: PathBuf,
        debounce: Duration,
        state: Arc<Mutex<SafetyRuntimeSnapshot>>,
        audit: Arc<dyn AuditEmitter>,
    ) -> Self {
        let shared = Arc::new(PersistShared {
            path,
            generation: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        });
        let (tx, rx) = mpsc::channel(PERSIST_QUEUE_CAPACITY);
        let writer = Writer {
            shared: Arc::clone(&shared),
            state,
            audit,
            debounce,
        };
        handle.spawn(writer.run(rx));
        Self { shared, tx }
    }

    /// Schedules a write. Never blocks.
    pub(crate) fn schedule(&self, audit: &dyn AuditEmitter) {
        let generation = self.shared.generation.load(Ordering::SeqCst);
        match self.tx.try_send(PersistCommand::Schedule { generation }) {
            // A full queue already holds a pending schedule that will cover
            // this mutation.
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {},
            Err(mpsc::error::TrySendError::Closed(_)) => {
                audit.emit(
                    AuditEvent::error("safety_state_writer_closed")
                        .with("path", self.shared.path.display().to_string()),
                );
            },
        }
    }

    /// Forces any pending write and waits for it.
    pub(crate) async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PersistCommand::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Discards pending writes and deletes the backing file.
    pub(crate) fn reset(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = std::fs::remove_file(&self.shared.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    path = %self.shared.path.display(),
                    error = %e,
                    "ignoring safety state delete failure during reset"
                );
            }
        }
    }
}

struct Writer {
    shared: Arc<PersistShared>,
    state: Arc<Mutex<SafetyRuntimeSnapshot>>,
    audit: Arc<dyn AuditEmitter>,
    debounce: Duration,
}

impl Writer {
    async fn run(self, mut rx: mpsc::Receiver<PersistCommand>) {
        // (first schedule time, newest scheduled generation)
        let mut pending: Option<(Instant, u64)> = None;
        let cap = self.debounce * MAX_COALESCE_FACTOR;

        loop {
            let command = match pending {
                Some((first, _)) => {
                    let remaining = cap.saturating_sub(first.elapsed());
                    let wait = self.debounce.min(remaining);
                    match tokio::time::timeout(wait, rx.recv()).await {
                        Ok(Some(command)) => command,
                        Ok(None) => {
                            self.write_pending(pending.take()).await;
                            break;
                        },
                        Err(_) => {
                            self.write_pending(pending.take()).await;
                            continue;
                        },
                    }
                },
                None => match rx.recv().await {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                PersistCommand::Schedule { generation } => {
                    pending = Some(match pending {
                        Some((first, newest)) => (first, newest.max(generation)),
                        None => (Instant::now(), generation),
                    });
                },
                PersistCommand::Flush(ack) => {
                    self.write_pending(pending.take()).await;
                    let _ = ack.send(());
                },
            }
        }
    }

    async fn write_pending(&self, pending: Option<(Instant, u64)>) {
        let Some((_, generation)) = pending else {
            return;
        };
        if generation < self.shared.generation.load(Ordering::SeqCst) {
            tracing::debug!("discarding safety state write scheduled before reset");
            return;
        }
        let snapshot = {
            let guard = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.clone()
        };
        match write_atomically(&self.shared.path, &snapshot).await {
            Ok(()) => {
                self.shared.writes.fetch_add(1, Ordering::SeqCst);
                tracing::trace!(path = %self.shared.path.display(), "safety state persisted");
            },
            Err(e) => {
                self.audit.emit(
                    AuditEvent::error("safety_state_persist_failed")
                        .with("path", self.shared.path.display().to_string())
                        .with("error", e.to_string()),
                );
            },
        }
    }
}

async fn write_atomically(path: &Path, snapshot: &SafetyRuntimeSnapshot) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(snapshot).map_err(io::Error::other)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Loads a snapshot from disk, degrading to defaults instead of failing.
///
/// A missing file, unreadable file, or malformed JSON yields an empty
/// snapshot. Within a well-formed document, each section is salvaged
/// independently: records that do not match the schema are skipped and
/// counter entries with non-integer values are dropped.
#[must_use]
pub fn load_snapshot(path: &Path) -> SafetyRuntimeSnapshot {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return SafetyRuntimeSnapshot::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "unreadable safety state, using defaults");
            return SafetyRuntimeSnapshot::default();
        },
    };
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(value) => salvage_snapshot(&value),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "malformed safety state, using defaults");
            SafetyRuntimeSnapshot::default()
        },
    }
}

/// Builds a snapshot from arbitrary JSON, keeping whatever is well-typed.
#[must_use]
pub fn salvage_snapshot(value: &Value) -> SafetyRuntimeSnapshot {
    let Some(root) = value.as_object() else {
        return SafetyRuntimeSnapshot::default();
    };

    let counters = root.get("counters").and_then(Value::as_object);
    SafetyRuntimeSnapshot {
        updated_at: root
            .get("updatedAt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        conditions: salvage_records::<UnsafeConditionRecord>(root.get("conditions")),
        quarantines: salvage_records::<SafetyQuarantineRecord>(root.get("quarantines")),
        counters: SafetyCounters {
            duplicate_suppressions: counters
                .and_then(|c| c.get("duplicateSuppressions"))
                .and_then(Value::as_u64)
                .unwrap_or(0),
            quarantine_activations: counters
                .and_then(|c| c.get("quarantineActivations"))
                .and_then(Value::as_u64)
                .unwrap_or(0),
            worker_failures: counters
                .and_then(|c| c.get("workerFailures"))
                .and_then(Value::as_object)
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| {
                            serde_json::from_value::<WorkerFailureCounter>(v.clone())
                                .ok()
                                .map(|c| (k.clone(), c))
                        })
                        .collect()
                })
                .unwrap_or_default(),
            heartbeat_misses: salvage_u64_map(counters.and_then(|c| c.get("heartbeatMisses"))),
            healthy_cycles: salvage_u64_map(counters.and_then(|c| c.get("healthyCycles"))),
        },
        trusted_hashes: root
            .get("trustedHashes")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| {
                        v.as_str()
                            .filter(|h| !h.is_empty())
                            .map(|h| (k.clone(), h.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn salvage_records<T: DeserializeOwned>(value: Option<&Value>) -> Vec<T> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn salvage_u64_map(value: Option<&Value>) -> std::collections::BTreeMap<String, u64> {
    value
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_u64().map(|n| (k.clone(), n)))
                .collect()
        })
        .unwrap_or_default()
}
