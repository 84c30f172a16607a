//! Shared daemon state.
//!
//! Provides thread-safe shared state for the gate middleware and the
//! operator routes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dgate_core::safety::SafetyRuntimeStore;

use crate::dispatch::DispatchGate;

/// Shared daemon state.
pub type SharedState = Arc<DaemonStateHandle>;

/// Handle to daemon state.
pub struct DaemonStateHandle {
    /// The dispatch gate.
    gate: DispatchGate,
    /// The safety store the gate reports into.
    safety: Arc<SafetyRuntimeStore>,
    /// Largest request body the gate will buffer.
    max_body_bytes: usize,
    /// Shutdown flag (atomic for lock-free checking).
    shutdown: AtomicBool,
    /// Time when the daemon started.
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for DaemonStateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonStateHandle")
            .field("gate", &self.gate)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl DaemonStateHandle {
    /// Create a new daemon state handle.
    #[must_use]
    pub fn new(gate: DispatchGate, max_body_bytes: usize) -> Self {
        let safety = Arc::clone(gate.safety());
        Self {
            gate,
            safety,
            max_body_bytes,
            shutdown: AtomicBool::new(false),
            started_at: Utc::now(),
        }
    }

    /// The dispatch gate.
    #[must_use]
    pub const fn gate(&self) -> &DispatchGate {
        &self.gate
    }

    /// The safety runtime store.
    #[must_use]
    pub const fn safety(&self) -> &Arc<SafetyRuntimeStore> {
        &self.safety
    }

    /// Largest request body the gate will buffer.
    #[must_use]
    pub const fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Check if shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Get the daemon start time.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Get daemon uptime in seconds.
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // max(0) ensures non-negative
    pub fn uptime_secs(&self) -> u64 {
        let now = Utc::now();
        (now - self.started_at).num_seconds().max(0) as u64
    }
}
