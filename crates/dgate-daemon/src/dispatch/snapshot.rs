//! Versioned route-memory snapshots and the provider seam.
//!
//! The gate never owns snapshot storage. It consumes a [`SnapshotProvider`],
//! which returns the current snapshot, keeps a last-known-good cache, and
//! retains a *trusted* snapshot (the one last associated with an `allow`)
//! for rollback.
//!
//! [`InMemorySnapshotProvider`] is the reference provider used by the
//! daemon binary and tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dgate_core::clock::VersionClock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Recorded ownership of one route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteState {
    /// Route that is expected to serve requests for this key.
    pub expected_route: String,
    /// Actor that last wrote this entry.
    pub updated_by: String,
    /// Monotonic write time.
    pub updated_at_ms: u64,
}

/// A versioned view of shared route memory.
///
/// Snapshots are ordered by `monotonic_ts_ms`; `version_id` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMemorySnapshot {
    /// Unique version id, `"<monotonic_ms>-<suffix>"`.
    pub version_id: String,
    /// Monotonic creation time.
    pub monotonic_ts_ms: u64,
    /// Route state keyed by `route_attempted`.
    #[serde(default)]
    pub routes: BTreeMap<String, RouteState>,
}

/// Where a loaded snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadedFrom {
    /// Regular load.
    Current,
    /// Forced refresh.
    Refresh,
    /// Last-known-good cache.
    Cache,
    /// Rollback to the trusted snapshot.
    Trusted,
}

impl LoadedFrom {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Refresh => "refresh",
            Self::Cache => "cache",
            Self::Trusted => "trusted",
        }
    }
}

/// Result of a snapshot load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotLoad {
    /// The snapshot.
    pub snapshot: Arc<DispatchMemorySnapshot>,
    /// Memory version reported to clients.
    pub memory_version: String,
    /// Origin of the load.
    pub loaded_from: LoadedFrom,
}

impl SnapshotLoad {
    /// Wraps a snapshot, using its version id as the memory version.
    #[must_use]
    pub fn new(snapshot: Arc<DispatchMemorySnapshot>, loaded_from: LoadedFrom) -> Self {
        Self {
            memory_version: snapshot.version_id.clone(),
            snapshot,
            loaded_from,
        }
    }

    /// Same snapshot, different origin.
    #[must_use]
    pub fn with_origin(&self, loaded_from: LoadedFrom) -> Self {
        Self {
            loaded_from,
            ..self.clone()
        }
    }
}

/// Snapshot provider errors.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The backing store could not produce a snapshot.
    #[error("snapshot unavailable: {0}")]
    Unavailable(String),

    /// A write to the backing store failed.
    #[error("snapshot storage error: {0}")]
    Storage(String),
}

/// Source of versioned route-memory snapshots.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Loads the current snapshot, bypassing any provider-side cache when
    /// `force_refresh` is set.
    async fn get_snapshot(&self, force_refresh: bool) -> Result<SnapshotLoad, SnapshotError>;

    /// Returns the last successfully loaded snapshot without I/O.
    fn cached_snapshot(&self) -> Option<SnapshotLoad>;

    /// Makes the trusted snapshot current again. `Ok(None)` when no trusted
    /// snapshot exists.
    async fn rollback_to_trusted_snapshot(
        &self,
        updated_by: &str,
    ) -> Result<Option<SnapshotLoad>, SnapshotError>;

    /// Retains `load` as the rollback target.
    async fn remember_trusted_snapshot(&self, load: &SnapshotLoad) -> Result<(), SnapshotError>;

    /// Records that `route_attempted` is served by `expected_route`.
    async fn upsert_route_state(
        &self,
        route_attempted: &str,
        expected_route: &str,
        updated_by: &str,
    ) -> Result<(), SnapshotError>;
}

// =============================================================================
// InMemorySnapshotProvider
// =============================================================================

#[derive(Debug)]
struct ProviderState {
    current: Arc<DispatchMemorySnapshot>,
    cached: Option<SnapshotLoad>,
    trusted: Option<Arc<DispatchMemorySnapshot>>,
}

/// Process-local snapshot provider.
///
/// Every write produces a new snapshot with a fresh version from the
/// [`VersionClock`], so versions are strictly ordered.
#[derive(Debug)]
pub struct InMemorySnapshotProvider {
    versions: Arc<VersionClock>,
    state: Mutex<ProviderState>,
}

impl InMemorySnapshotProvider {
    /// Creates a provider holding an empty snapshot.
    #[must_use]
    pub fn new(versions: Arc<VersionClock>) -> Self {
        Self::with_routes(versions, BTreeMap::new())
    }

    /// Creates a provider whose first snapshot holds `routes`.
    #[must_use]
    pub fn with_routes(versions: Arc<VersionClock>, routes: BTreeMap<String, RouteState>) -> Self {
        let current = Arc::new(next_snapshot(&versions, routes));
        Self {
            versions,
            state: Mutex::new(ProviderState {
                current,
                cached: None,
                trusted: None,
            }),
        }
    }

    /// The current snapshot.
    #[must_use]
    pub fn current(&self) -> Arc<DispatchMemorySnapshot> {
        Arc::clone(&self.lock().current)
    }

    /// Applies `update` to a copy of the current routes and publishes the
    /// result as a new version.
    pub fn publish<F>(&self, update: F) -> Arc<DispatchMemorySnapshot>
    where
        F: FnOnce(&mut BTreeMap<String, RouteState>),
    {
        let mut state = self.lock();
        let mut routes = state.current.routes.clone();
        update(&mut routes);
        let next = Arc::new(next_snapshot(&self.versions, routes));
        state.current = Arc::clone(&next);
        next
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProviderState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn next_snapshot(
    versions: &VersionClock,
    routes: BTreeMap<String, RouteState>,
) -> DispatchMemorySnapshot {
    let (version_id, monotonic_ts_ms) = versions.next_version();
    DispatchMemorySnapshot {
        version_id,
        monotonic_ts_ms,
        routes,
    }
}

#[async_trait]
impl SnapshotProvider for InMemorySnapshotProvider {
    async fn get_snapshot(&self, force_refresh: bool) -> Result<SnapshotLoad, SnapshotError> {
        let mut state = self.lock();
        let origin = if force_refresh {
            LoadedFrom::Refresh
        } else {
            LoadedFrom::Current
        };
        let load = SnapshotLoad::new(Arc::clone(&state.current), origin);
        state.cached = Some(load.with_origin(LoadedFrom::Cache));
        Ok(load)
    }

    fn cached_snapshot(&self) -> Option<SnapshotLoad> {
        self.lock().cached.clone()
    }

    async fn rollback_to_trusted_snapshot(
        &self,
        updated_by: &str,
    ) -> Result<Option<SnapshotLoad>, SnapshotError> {
        let mut state = self.lock();
        let Some(trusted) = state.trusted.clone() else {
            return Ok(None);
        };
        tracing::info!(
            from = %state.current.version_id,
            to = %trusted.version_id,
            updated_by,
            "rolling back to trusted snapshot"
        );
        state.current = Arc::clone(&trusted);
        let load = SnapshotLoad::new(trusted, LoadedFrom::Trusted);
        state.cached = Some(load.with_origin(LoadedFrom::Cache));
        Ok(Some(load))
    }

    async fn remember_trusted_snapshot(&self, load: &SnapshotLoad) -> Result<(), SnapshotError> {
        self.lock().trusted = Some(Arc::clone(&load.snapshot));
        Ok(())
    }

    async fn upsert_route_state(
        &self,
        route_attempted: &str,
        expected_route: &str,
        updated_by: &str,
    ) -> Result<(), SnapshotError> {
        let updated_at_ms = self.versions.next_ts();
        self.publish(|routes| {
            routes.insert(
                route_attempted.to_string(),
                RouteState {
                    expected_route: expected_route.to_string(),
                    updated_by: updated_by.to_string(),
                    updated_at_ms,
                },
            );
        });
        Ok(())
    }
}
