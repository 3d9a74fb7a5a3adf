//! Session registry for tracking all connected trackers

use super::connection::{SessionHandle, SessionInfo};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracker_shared::DeviceIdentity;

struct SessionEntry {
    handle: SessionHandle,
    last_activity: Instant,
}

impl SessionEntry {
    fn info(&self, identity: &DeviceIdentity, now: Instant) -> SessionInfo {
        SessionInfo {
            identity: identity.clone(),
            connection_id: self.handle.connection_id,
            addr: self.handle.addr,
            connected_at: self.handle.connected_at,
            idle: now.saturating_duration_since(self.last_activity),
        }
    }
}

/// Manages all live tracker sessions
///
/// At most one session per identity. Every operation takes the lock, so
/// snapshots are consistent with concurrent upserts and sweeps.
pub struct SessionRegistry {
    /// Map of identity -> session
    sessions: RwLock<HashMap<DeviceIdentity, SessionEntry>>,
    next_connection_id: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(0),
        }
    }

    /// Allocate an id for a newly accepted connection
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Bind `identity` to `handle`, returning the session it superseded
    pub async fn upsert(
        &self,
        identity: DeviceIdentity,
        handle: SessionHandle,
    ) -> Option<SessionHandle> {
        let entry = SessionEntry {
            handle,
            last_activity: Instant::now(),
        };
        let mut sessions = self.sessions.write().await;
        sessions.insert(identity, entry).map(|old| old.handle)
    }

    /// Refresh last activity; false if the identity has no session
    pub async fn touch(&self, identity: &DeviceIdentity) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(identity) {
            Some(entry) => {
                entry.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Unregister a session unconditionally
    pub async fn remove(&self, identity: &DeviceIdentity) -> Option<SessionHandle> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(identity).map(|e| e.handle)
    }

    /// Unregister only if the session still belongs to `connection_id`
    ///
    /// A connection superseded by a re-dial must not evict its successor.
    pub async fn release(&self, identity: &DeviceIdentity, connection_id: u64) -> bool {
        let mut sessions = self.sessions.write().await;
        let owned = sessions
            .get(identity)
            .is_some_and(|e| e.handle.connection_id == connection_id);
        if owned {
            sessions.remove(identity);
        }
        owned
    }

    /// Get a session handle for a specific tracker
    pub async fn get(&self, identity: &DeviceIdentity) -> Option<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions.get(identity).map(|e| e.handle.clone())
    }

    /// Every live handle, for broadcast
    pub async fn handles(&self) -> Vec<(DeviceIdentity, SessionHandle)> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .map(|(id, e)| (id.clone(), e.handle.clone()))
            .collect()
    }

    /// Consistent snapshot of all live sessions
    pub async fn list_active(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let now = Instant::now();
        let mut active: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, entry)| entry.info(id, now))
            .collect();
        active.sort_by(|a, b| a.identity.cmp(&b.identity));
        active
    }

    /// Evict every session idle for at least `max_idle` and return them
    pub async fn sweep(&self, max_idle: Duration) -> Vec<SessionInfo> {
        let mut sessions = self.sessions.write().await;
        let now = Instant::now();

        let idle: Vec<DeviceIdentity> = sessions
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_activity) >= max_idle)
            .map(|(id, _)| id.clone())
            .collect();

        idle.iter()
            .filter_map(|id| sessions.remove(id).map(|entry| entry.info(id, now)))
            .collect()
    }

    /// Get the number of connected trackers
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
