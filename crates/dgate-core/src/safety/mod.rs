//! Safety runtime state: unsafe conditions, quarantines, failure counters
//! and trusted hashes, persisted as one JSON document.
//!
//! # Overview
//!
//! [`SafetyRuntimeStore`] is the single authoritative record the dispatch
//! gate consults when it must decide whether the system is safe to proceed.
//! It provides:
//!
//! - **Idempotent activation**: at most one active condition per
//!   `(code, quarantine_id)` and one active quarantine per dedupe key.
//! - **Append-only history**: clearing and releasing set fields, never
//!   delete records.
//! - **Bounded cardinality**: entity keys are normalized (long ids hashed)
//!   and the distinct-key count across the counter maps is capped.
//! - **Decoupled persistence**: a background writer coalesces bursts of
//!   mutations into one atomic write.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │            SafetyRuntimeStore             │
//! │                                           │
//! │  Arc<Mutex<SafetyRuntimeSnapshot>> ◄──┐   │
//! │     conditions / quarantines /        │   │
//! │     counters / trusted hashes         │   │
//! │                │ schedule()           │   │
//! │  ┌─────────────▼────────────────────┐ │   │
//! │  │  writer task (bounded mpsc)      │─┘   │
//! │  │  debounce → clone → tmp + rename │     │
//! │  └──────────────────────────────────┘     │
//! └───────────────────────────────────────────┘
//! ```
//!
//! # Security
//!
//! - Counter maps bounded by `max_entity_keys`; refusals are audited.
//! - Startup tolerates a corrupt or missing document.
//! - Empty trusted hashes never overwrite a baseline.

pub mod keys;
pub mod persist;
mod store;
pub mod types;


pub use keys::{MAX_ENTITY_KEY_LENGTH, normalize_entity_key};
pub use store::{SafetyRuntimeStore, SafetyStoreConfig, SafetyStoreError};
pub use types::{
    ActivateCondition, FailureTally, QuarantineKind, RegisterQuarantine, ReleaseOptions,
    ReleaseOutcome, ReleaseRejection, SafetyCounters, SafetyQuarantineRecord,
    SafetyRuntimeSnapshot, UNSAFE_TO_PROCEED, UnsafeConditionCode, UnsafeConditionRecord,
    UnsafeToProceedPayload, WorkerFailureCounter,
};
