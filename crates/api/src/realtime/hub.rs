//! Per-process connection registry
//!
//! Maps `(role, entity id)` to the set of live connections for that entity.
//! Every operation is synchronous and non-blocking: sends only enqueue onto
//! each connection's bounded outbound queue, so a slow client never holds the
//! registry lock or delays delivery to anyone else.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use courier_shared::{EntityId, Role};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::connection::Connection;
use super::envelope::Envelope;
use super::queue::EnqueueOutcome;

type EntityKey = (Role, EntityId);
type Sessions = HashMap<Uuid, Arc<Connection>>;

/// Snapshot of registry occupancy for health reporting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub riders_online: usize,
    pub merchants_online: usize,
    pub platform_online: usize,
    /// Messages lost to outbound overflow since startup
    pub dropped_messages: u64,
}

struct HubInner {
    registry: RwLock<HashMap<EntityKey, Sessions>>,
    tasks: TaskTracker,
    dropped: AtomicU64,
    shutting_down: AtomicBool,
}

/// Registry of live connections shared by every request handler
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry: RwLock::new(HashMap::new()),
                tasks: TaskTracker::new(),
                dropped: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<EntityKey, Sessions>> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<EntityKey, Sessions>> {
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection under its identity.
    ///
    /// Registering the same connection twice is a no-op. A connection that
    /// already started closing, or any connection once the hub is shutting
    /// down, is closed instead of being added.
    pub fn register(&self, conn: &Arc<Connection>) {
        let identity = conn.identity();
        let key = (identity.role, identity.entity_id);
        let mut registry = self.write();

        // Checked under the lock: shutdown sets the flag before draining
        if self.inner.shutting_down.load(Ordering::Acquire) {
            drop(registry);
            tracing::debug!(session_id = %conn.session_id(), "Hub shutting down, refusing registration");
            conn.close();
            return;
        }

        if !conn.activate() {
            tracing::debug!(session_id = %conn.session_id(), "Connection closed before registration");
            return;
        }

        let sessions = registry.entry(key).or_default();
        if sessions.insert(conn.session_id(), Arc::clone(conn)).is_none() {
            let entity_connections = sessions.len();
            let total_connections: usize = registry.values().map(HashMap::len).sum();
            tracing::info!(
                session_id = %conn.session_id(),
                role = %identity.role,
                entity_id = %identity.entity_id,
                entity_connections,
                total_connections,
                "Realtime connection registered"
            );
        }
    }

    /// Remove a connection; returns false if it was not registered
    pub fn unregister(&self, conn: &Connection) -> bool {
        let identity = conn.identity();
        let key = (identity.role, identity.entity_id);
        let mut registry = self.write();

        let Some(sessions) = registry.get_mut(&key) else {
            return false;
        };
        if sessions.remove(&conn.session_id()).is_none() {
            return false;
        }
        if sessions.is_empty() {
            registry.remove(&key);
        }

        let remaining_connections: usize = registry.values().map(HashMap::len).sum();
        tracing::info!(
            session_id = %conn.session_id(),
            role = %identity.role,
            entity_id = %identity.entity_id,
            remaining_connections,
            "Realtime connection unregistered"
        );
        true
    }

    /// Live connections for one entity
    pub fn connections_for(&self, role: Role, entity_id: EntityId) -> Vec<Arc<Connection>> {
        self.read()
            .get(&(role, entity_id))
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_online(&self, role: Role, entity_id: EntityId) -> bool {
        self.read()
            .get(&(role, entity_id))
            .is_some_and(|sessions| !sessions.is_empty())
    }

    /// Queue `envelope` on every connection of one entity.
    ///
    /// Returns true when the entity had at least one open connection to
    /// attempt; a message lost to that connection's overflow policy still
    /// counts as attempted.
    pub fn send_to(&self, role: Role, entity_id: EntityId, envelope: Envelope) -> bool {
        self.send_shared(role, entity_id, Arc::new(envelope))
    }

    pub(crate) fn send_shared(&self, role: Role, entity_id: EntityId, envelope: Arc<Envelope>) -> bool {
        // Snapshot under the read lock, enqueue without it
        let targets = self.connections_for(role, entity_id);

        let mut attempted = false;
        for conn in targets {
            let outcome = conn.enqueue(Arc::clone(&envelope));
            match outcome {
                EnqueueOutcome::Queued => attempted = true,
                EnqueueOutcome::DroppedOldest
                | EnqueueOutcome::DroppedNewest
                | EnqueueOutcome::Overflowed => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    attempted = true;
                }
                EnqueueOutcome::Closed => {}
            }
        }

        if attempted {
            tracing::debug!(
                role = %role,
                entity_id = %entity_id,
                envelope_type = envelope.kind(),
                "Envelope queued for local delivery"
            );
        }
        attempted
    }

    /// Queue `envelope` for every online entity of `role`; returns how many entities were reached
    pub fn broadcast(&self, role: Role, envelope: Envelope) -> usize {
        let envelope = Arc::new(envelope);
        self.online_entities(role)
            .into_iter()
            .filter(|entity_id| self.send_shared(role, *entity_id, Arc::clone(&envelope)))
            .count()
    }

    /// Entities of `role` with at least one live connection
    pub fn online_entities(&self, role: Role) -> Vec<EntityId> {
        self.read()
            .keys()
            .filter(|(r, _)| *r == role)
            .map(|(_, entity_id)| *entity_id)
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.read().values().map(HashMap::len).sum()
    }

    pub fn stats(&self) -> HubStats {
        let registry = self.read();
        let online = |role: Role| registry.keys().filter(|(r, _)| *r == role).count();

        HubStats {
            connections: registry.values().map(HashMap::len).sum(),
            riders_online: online(Role::Rider),
            merchants_online: online(Role::Merchant),
            platform_online: online(Role::Platform),
            dropped_messages: self.inner.dropped.load(Ordering::Relaxed),
        }
    }

    /// Spawn a connection task that shutdown waits for
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.tasks.spawn(future)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Close every connection and wait up to `grace` for their tasks to flush and exit
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutting_down.store(true, Ordering::Release);

        let closing: Vec<Arc<Connection>> = self
            .write()
            .drain()
            .flat_map(|(_, sessions)| sessions.into_values())
            .collect();

        tracing::info!(connections = closing.len(), "Closing realtime connections");
        for conn in &closing {
            conn.close();
        }

        self.inner.tasks.close();
        if tokio::time::timeout(grace, self.inner.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining_tasks = self.inner.tasks.len(),
                grace = ?grace,
                "Realtime connections still running after grace period"
            );
        }
    }
}
