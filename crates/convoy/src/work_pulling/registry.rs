// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service-discovery seam for the work-pulling router.
//!
//! The router subscribes to a service key and periodically receives full
//! snapshots of the current worker-endpoint set. Snapshots are eventually
//! consistent: duplicate notifications and missed terminations are expected
//! and absorbed by the router's diffing plus the per-worker resend logic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::delivery::ConsumerEndpoint;

/// Opaque identifier of a worker endpoint, as provided by discovery.
pub type WorkerId = String;

/// Opaque service-discovery key a router subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey(pub String);

impl ServiceKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One worker as seen by discovery: identity plus its transport endpoint.
pub struct WorkerEndpoint<A> {
    pub id: WorkerId,
    pub endpoint: Arc<dyn ConsumerEndpoint<A> + Sync>,
}

impl<A> Clone for WorkerEndpoint<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            endpoint: Arc::clone(&self.endpoint),
        }
    }
}

/// Snapshot-based registry of live worker endpoints.
///
/// Implementations wrap whatever discovery backend is in use; the router only
/// needs "the current set for this key". Snapshots may repeat, lag, or miss a
/// termination entirely.
pub trait ServiceRegistry<A>: Send {
    fn snapshot(&self, key: &ServiceKey) -> Vec<WorkerEndpoint<A>>;
}

// ============================================================================
// STATIC REGISTRY
// ============================================================================

/// Process-local registry with an explicitly managed worker set.
///
/// Useful for fixed fleets and for tests; clones share the same state, so a
/// test can mutate the fleet while a router keeps polling.
pub struct StaticRegistry<A> {
    entries: Arc<Mutex<HashMap<ServiceKey, Vec<WorkerEndpoint<A>>>>>,
}

impl<A> Clone for StaticRegistry<A> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<A> Default for StaticRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> StaticRegistry<A> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ServiceKey, Vec<WorkerEndpoint<A>>>> {
        match self.entries.lock() {
            Ok(lock) => lock,
            Err(e) => {
                log::debug!("[registry] entries lock poisoned, recovering");
                e.into_inner()
            }
        }
    }

    /// Add or replace a worker under `key`.
    pub fn register(&self, key: &ServiceKey, worker: WorkerEndpoint<A>) {
        let mut entries = self.lock();
        let workers = entries.entry(key.clone()).or_default();
        workers.retain(|w| w.id != worker.id);
        workers.push(worker);
    }

    /// Remove a worker from `key`.
    pub fn deregister(&self, key: &ServiceKey, worker_id: &str) {
        let mut entries = self.lock();
        if let Some(workers) = entries.get_mut(key) {
            workers.retain(|w| w.id != worker_id);
        }
    }
}

impl<A: Send> ServiceRegistry<A> for StaticRegistry<A> {
    fn snapshot(&self, key: &ServiceKey) -> Vec<WorkerEndpoint<A>> {
        self.lock().get(key).cloned().unwrap_or_default()
    }
}

// ============================================================================
// TESTS
// ============================================================================
