//! Fixed-size pool of hub shards with deterministic per-user routing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::broadcast::Broadcast;
use super::conn::WebConn;
use super::shard::{Hub, HubConfig};

/// The process-scoped fan-out engine. Created once at server start and
/// threaded explicitly into anything that registers connections or submits
/// events.
pub struct HubPool {
    shards: Vec<Hub>,
}

impl HubPool {
    /// Spawn `shard_count` shards. At least one shard is always created.
    pub fn spawn(shard_count: usize, config: HubConfig) -> Self {
        let shard_count = shard_count.max(1);
        let shards = (0..shard_count)
            .map(|i| Hub::spawn(i, config.clone()))
            .collect();
        tracing::info!(shards = shard_count, "hub pool started");
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Deterministic shard index for a user. Stable for the process
    /// lifetime, so all of a user's connections land on the same shard.
    pub fn shard_for_user(&self, user_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn shard(&self, user_id: &str) -> &Hub {
        &self.shards[self.shard_for_user(user_id)]
    }

    pub async fn register(&self, conn: Arc<WebConn>) {
        self.shard(conn.user_id()).register(conn).await;
    }

    pub async fn unregister(&self, user_id: &str, conn_id: &str) {
        self.shard(user_id).unregister(conn_id).await;
    }

    /// Submit a broadcast to every shard; each shard filters locally. The
    /// target user's shard isn't known in advance for omit-set or
    /// everyone broadcasts, so all shards always see the message.
    pub async fn broadcast_to_all(&self, broadcast: Broadcast) {
        let broadcast = Arc::new(broadcast);
        for shard in &self.shards {
            shard.broadcast(broadcast.clone()).await;
        }
    }

    pub async fn invalidate_user(&self, user_id: &str) {
        self.shard(user_id).invalidate_user(user_id).await;
    }

    pub async fn update_activity(&self, user_id: &str, session_id: &str, at: DateTime<Utc>) {
        self.shard(user_id)
            .update_activity(user_id, session_id, at)
            .await;
    }

    /// Snapshot of a user's connection ids on their shard.
    pub async fn connections_for_user(&self, user_id: &str) -> Vec<String> {
        self.shard(user_id).connections_for_user(user_id).await
    }

    /// Total connections across all shards.
    pub async fn connection_count(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.connection_count().await;
        }
        total
    }

    /// Stop every shard. Idempotent and safe under concurrent callers;
    /// each shard's own stop flag dedupes the shutdown.
    pub async fn stop_all(&self) {
        for shard in &self.shards {
            shard.stop().await;
        }
        tracing::info!("hub pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_is_stable_for_repeated_calls() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let pool = HubPool::spawn(4, HubConfig::default());

        for user in ["usr_a", "usr_b", "usr_c", "usr_d", "usr_e"] {
            let first = pool.shard_for_user(user);
            for _ in 0..10 {
                assert_eq!(pool.shard_for_user(user), first);
            }
            assert!(first < 4);
        }
    }

    #[test]
    fn zero_shards_clamps_to_one() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let pool = HubPool::spawn(0, HubConfig::default());
        assert_eq!(pool.shard_count(), 1);
        assert_eq!(pool.shard_for_user("usr_anyone"), 0);
    }

    #[test]
    fn different_users_spread_across_shards() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let pool = HubPool::spawn(8, HubConfig::default());

        let mut seen = std::collections::HashSet::new();
        for i in 0..200 {
            seen.insert(pool.shard_for_user(&format!("usr_{i}")));
        }
        // A degenerate hash would put everyone on one shard.
        assert!(seen.len() > 1);
    }
}
