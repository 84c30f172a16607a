//! dgate-core - safety runtime state and shared primitives for the dispatch
//! consistency gate.
//!
//! # Modules
//!
//! - [`audit`]: structured, non-blocking safety audit events
//! - [`binding`]: dispatch bindings and exempt routes
//! - [`clock`]: wall/monotonic clocks and the version clock
//! - [`config`]: TOML configuration for the daemon
//! - [`safety`]: the safety runtime state store

pub mod audit;
pub mod binding;
pub mod clock;
pub mod config;
pub mod safety;

pub use audit::{AuditEmitter, AuditEvent, AuditLevel, MemoryAuditSink, TracingAuditEmitter};
pub use clock::{Clock, ManualClock, SystemClock, VersionClock};
pub use safety::SafetyRuntimeStore;
