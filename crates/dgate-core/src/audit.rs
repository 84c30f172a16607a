//! Safety audit event emission.
//!
//! Every safety-relevant transition (condition activation, quarantine
//! registration, gate decision, persistence failure) is described by an
//! [`AuditEvent`] and handed to an [`AuditEmitter`]. Emission is
//! fire-and-forget: implementations must not block the caller and must not
//! surface errors.
//!
//! # Contracts
//!
//! - [CTR-AU001] `emit` never panics and never returns an error.
//! - [CTR-AU002] [`MemoryAuditSink`] retains at most its configured capacity;
//!   the oldest events are dropped first.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tracing target used for audit events.
pub const AUDIT_TARGET: &str = "dgate::audit";

/// Default capacity for [`MemoryAuditSink`].
pub const DEFAULT_AUDIT_SINK_CAPACITY: usize = 4096;

/// Severity of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal transition.
    Info,
    /// Degraded or safety-relevant transition.
    Warn,
    /// Failure that needs operator attention.
    Error,
}

/// A structured, append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Stable event name, e.g. `unsafe_condition_activated`.
    pub event: String,
    /// Severity.
    pub level: AuditLevel,
    /// Structured event fields.
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl AuditEvent {
    /// Creates an event with the given level and no fields.
    #[must_use]
    pub fn new(level: AuditLevel, event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            level,
            fields: Map::new(),
        }
    }

    /// Creates a debug-level event.
    #[must_use]
    pub fn debug(event: impl Into<String>) -> Self {
        Self::new(AuditLevel::Debug, event)
    }

    /// Creates an info-level event.
    #[must_use]
    pub fn info(event: impl Into<String>) -> Self {
        Self::new(AuditLevel::Info, event)
    }

    /// Creates a warn-level event.
    #[must_use]
    pub fn warn(event: impl Into<String>) -> Self {
        Self::new(AuditLevel::Warn, event)
    }

    /// Creates an error-level event.
    #[must_use]
    pub fn error(event: impl Into<String>) -> Self {
        Self::new(AuditLevel::Error, event)
    }

    /// Adds a field. Values that fail to serialize are recorded as `null`.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        self.fields.insert(
            key.to_string(),
            serde_json::to_value(value).unwrap_or(Value::Null),
        );
        self
    }

    /// Returns a field by name.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.event)?;
        if !self.fields.is_empty() {
            write!(f, " {}", Value::Object(self.fields.clone()))?;
        }
        Ok(())
    }
}

/// Sink for audit events.
pub trait AuditEmitter: Send + Sync + fmt::Debug {
    /// Emits an event. Must not block and must not fail.
    fn emit(&self, event: AuditEvent);
}

/// Emits audit events as structured `tracing` events under
/// [`AUDIT_TARGET`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditEmitter;

impl AuditEmitter for TracingAuditEmitter {
    fn emit(&self, event: AuditEvent) {
        let fields = Value::Object(event.fields);
        match event.level {
            AuditLevel::Debug => {
                tracing::debug!(target: AUDIT_TARGET, event = %event.event, fields = %fields);
            },
            AuditLevel::Info => {
                tracing::info!(target: AUDIT_TARGET, event = %event.event, fields = %fields);
            },
            AuditLevel::Warn => {
                tracing::warn!(target: AUDIT_TARGET, event = %event.event, fields = %fields);
            },
            AuditLevel::Error => {
                tracing::error!(target: AUDIT_TARGET, event = %event.event, fields = %fields);
            },
        }
    }
}

/// Bounded in-memory audit sink.
///
/// Records every event it receives and forwards it to `tracing` as well, so
/// tests can assert on the causal trail while logs stay intact.
#[derive(Debug)]
pub struct MemoryAuditSink {
    events: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
}

impl MemoryAuditSink {
    /// Creates a sink with [`DEFAULT_AUDIT_SINK_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_SINK_CAPACITY)
    }

    /// Creates a sink retaining at most `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Returns a copy of the retained events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.lock().iter().cloned().collect()
    }

    /// Returns the retained events with the given name.
    #[must_use]
    pub fn events_named(&self, name: &str) -> Vec<AuditEvent> {
        self.lock()
            .iter()
            .filter(|e| e.event == name)
            .cloned()
            .collect()
    }

    /// Returns `true` if an event with the given name was recorded.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.lock().iter().any(|e| e.event == name)
    }

    /// Drops all retained events.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AuditEvent>> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditEmitter for MemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        TracingAuditEmitter.emit(event.clone());
        let mut events = self.lock();
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}
