//! Per-shard connection index: user buckets plus an O(1) membership view.
//!
//! Owned exclusively by the shard's command loop, so it needs no internal
//! locking. All operations are silent no-ops on missing keys.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::conn::{ConnState, WebConn};

#[derive(Default)]
pub struct ConnectionIndex {
    /// Connections bucketed by owning user.
    by_user: HashMap<String, Vec<Arc<WebConn>>>,
    /// All connections by connection id.
    all: HashMap<String, Arc<WebConn>>,
}

impl ConnectionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert into both views. Re-adding a known connection id is a no-op.
    pub fn add(&mut self, conn: Arc<WebConn>) {
        if self.all.contains_key(conn.id()) {
            return;
        }
        self.all.insert(conn.id().to_string(), conn.clone());
        self.by_user
            .entry(conn.user_id().to_string())
            .or_default()
            .push(conn);
    }

    /// Remove from both views. Drops the user bucket when it empties.
    /// Returns the removed connection, if it was present.
    pub fn remove(&mut self, conn_id: &str) -> Option<Arc<WebConn>> {
        let conn = self.all.remove(conn_id)?;
        if let Some(bucket) = self.by_user.get_mut(conn.user_id()) {
            bucket.retain(|c| c.id() != conn_id);
            if bucket.is_empty() {
                self.by_user.remove(conn.user_id());
            }
        }
        Some(conn)
    }

    /// Snapshot of a user's current connections (copy, not a live view).
    pub fn for_user(&self, user_id: &str) -> Vec<Arc<WebConn>> {
        self.by_user.get(user_id).cloned().unwrap_or_default()
    }

    /// O(1) membership test by connection id.
    pub fn has(&self, conn_id: &str) -> bool {
        self.all.contains_key(conn_id)
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// Iterate all connections (broadcast evaluation).
    pub fn iter(&self) -> impl Iterator<Item = &Arc<WebConn>> {
        self.all.values()
    }

    /// Remove one of a user's connections only if it is marked `Inactive`.
    /// Used to reap a stale duplicate without disturbing live ones.
    pub fn remove_inactive_by_connection_id(
        &mut self,
        user_id: &str,
        conn_id: &str,
    ) -> Option<Arc<WebConn>> {
        let conn = self.all.get(conn_id)?;
        if conn.user_id() != user_id || conn.state() != ConnState::Inactive {
            return None;
        }
        self.remove(conn_id)
    }

    /// Sweep out every connection idle longer than `window`. Returns the
    /// removed connections so the owner can close them.
    pub fn remove_inactive_connections(&mut self, window: Duration) -> Vec<Arc<WebConn>> {
        let stale: Vec<String> = self
            .all
            .values()
            .filter(|c| c.idle_for() > window)
            .map(|c| c.id().to_string())
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for conn_id in stale {
            if let Some(conn) = self.remove(&conn_id) {
                conn.mark_inactive();
                removed.push(conn);
            }
        }
        removed
    }

    /// Remove everything (shard shutdown). Returns all connections.
    pub fn drain(&mut self) -> Vec<Arc<WebConn>> {
        self.by_user.clear();
        self.all.drain().map(|(_, c)| c).collect()
    }
}
