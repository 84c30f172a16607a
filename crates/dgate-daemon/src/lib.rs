//! dgate-daemon - dispatch consistency gate daemon library
//!
//! This library provides the admission-control middleware that sits in
//! front of handlers mutating a shared, versioned route-memory snapshot,
//! together with the reference collaborators the daemon binary runs with.
//!
//! # Runtime Requirements
//!
//! The gate spawns each snapshot load as its own task so a timed-out load
//! can finish in the background. It therefore needs a tokio runtime; the
//! `dgate-daemon` binary builds a multi-threaded one.
//!
//! # Modules
//!
//! - [`dispatch`]: the gate state machine and its collaborator seams
//! - [`http`]: axum middleware and operator routes
//! - [`state`]: shared daemon state

pub mod dispatch;
pub mod http;
pub mod state;
