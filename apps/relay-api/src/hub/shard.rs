//! One hub shard: a single task owning a connection index, fed by a FIFO
//! command queue. All index mutation happens on that task, so the index
//! itself needs no locks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};

use super::broadcast::Broadcast;
use super::conn::{DeliveryError, WebConn};
use super::index::ConnectionIndex;

/// Tuning for a shard.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the shard's command queue. Producers awaiting `send` on a
    /// full queue is the backpressure point for event submitters.
    pub queue_capacity: usize,
    /// Connections with no user activity for longer than this are reaped.
    pub inactivity_window: Duration,
    /// How often the inactivity sweep runs.
    pub sweep_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            inactivity_window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Commands processed in strict submission order by the shard task.
enum HubCommand {
    Register(Arc<WebConn>),
    Unregister { conn_id: String },
    Broadcast(Arc<Broadcast>),
    InvalidateUser { user_id: String },
    UpdateActivity {
        user_id: String,
        session_id: String,
        at: DateTime<Utc>,
    },
    ForUser {
        user_id: String,
        reply: oneshot::Sender<Vec<String>>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    Stop,
}

/// Handle to one shard. Cheap to clone; all methods enqueue commands and
/// never touch the index directly.
#[derive(Clone)]
pub struct Hub {
    shard_id: usize,
    tx: mpsc::Sender<HubCommand>,
    stopping: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
}

impl Hub {
    /// Spawn the shard task and return its handle.
    pub fn spawn(shard_id: usize, config: HubConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (done_tx, done) = watch::channel(false);

        let worker = HubWorker {
            shard_id,
            config,
            index: ConnectionIndex::new(),
        };
        tokio::spawn(worker.run(rx, done_tx));

        Self {
            shard_id,
            tx,
            stopping: Arc::new(AtomicBool::new(false)),
            done,
        }
    }

    pub fn shard_id(&self) -> usize {
        self.shard_id
    }

    /// Enqueue a registration. FIFO: processed before any broadcast
    /// submitted after this call returns.
    pub async fn register(&self, conn: Arc<WebConn>) {
        self.submit(HubCommand::Register(conn)).await;
    }

    pub async fn unregister(&self, conn_id: &str) {
        self.submit(HubCommand::Unregister {
            conn_id: conn_id.to_string(),
        })
        .await;
    }

    /// Enqueue a broadcast for evaluation against every connection in this
    /// shard's index.
    pub async fn broadcast(&self, broadcast: Arc<Broadcast>) {
        self.submit(HubCommand::Broadcast(broadcast)).await;
    }

    /// Force every connection of a user to refresh its cached session
    /// snapshot, without disconnecting anyone.
    pub async fn invalidate_user(&self, user_id: &str) {
        self.submit(HubCommand::InvalidateUser {
            user_id: user_id.to_string(),
        })
        .await;
    }

    pub async fn update_activity(&self, user_id: &str, session_id: &str, at: DateTime<Utc>) {
        self.submit(HubCommand::UpdateActivity {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            at,
        })
        .await;
    }

    /// Snapshot of a user's connection ids, observed through the command
    /// queue (so it reflects every command submitted before it).
    pub async fn connections_for_user(&self, user_id: &str) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::ForUser {
            user_id: user_id.to_string(),
            reply,
        })
        .await;
        rx.await.unwrap_or_default()
    }

    /// Total connections currently registered on this shard.
    pub async fn connection_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::Count { reply }).await;
        rx.await.unwrap_or(0)
    }

    /// Stop the shard: drain queued commands, close every registered
    /// connection, halt the loop. Idempotent; concurrent callers all wait
    /// for completion. Calls to other methods after this never block, they
    /// fail fast on the closed queue and are discarded.
    pub async fn stop(&self) {
        if !self.stopping.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(HubCommand::Stop).await;
        }
        let mut done = self.done.clone();
        while !*done.borrow() {
            // Err means the worker dropped the sender after finishing.
            if done.changed().await.is_err() {
                break;
            }
        }
    }

    /// Send a command; once the shard has shut down the queue is closed and
    /// the command is silently dropped.
    async fn submit(&self, cmd: HubCommand) {
        let _ = self.tx.send(cmd).await;
    }
}

/// The task-owned side of a shard.
struct HubWorker {
    shard_id: usize,
    config: HubConfig,
    index: ConnectionIndex,
}

impl HubWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>, done_tx: watch::Sender<bool>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.tick().await; // First tick fires immediately; skip it.

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(HubCommand::Stop) | None => break,
                        Some(cmd) => self.apply(cmd),
                    }
                }
                _ = sweep.tick() => self.sweep(),
            }
        }

        // Drain: apply already-queued lifecycle commands so their
        // connections are closed cleanly, but start no further broadcasts.
        rx.close();
        while let Some(cmd) = rx.recv().await {
            match cmd {
                HubCommand::Register(_)
                | HubCommand::Unregister { .. }
                | HubCommand::UpdateActivity { .. } => self.apply(cmd),
                HubCommand::ForUser { reply, .. } => {
                    let _ = reply.send(Vec::new());
                }
                HubCommand::Count { reply } => {
                    let _ = reply.send(0);
                }
                HubCommand::Broadcast(_) | HubCommand::InvalidateUser { .. } | HubCommand::Stop => {}
            }
        }

        let conns = self.index.drain();
        for conn in &conns {
            conn.close();
        }
        tracing::info!(
            shard = self.shard_id,
            closed = conns.len(),
            "hub shard stopped"
        );
        let _ = done_tx.send(true);
    }

    fn apply(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register(conn) => self.register(conn),
            HubCommand::Unregister { conn_id } => {
                if let Some(conn) = self.index.remove(&conn_id) {
                    conn.close();
                    tracing::debug!(shard = self.shard_id, conn_id = %conn_id, "connection unregistered");
                }
            }
            HubCommand::Broadcast(broadcast) => self.deliver(&broadcast),
            HubCommand::InvalidateUser { user_id } => {
                for conn in self.index.for_user(&user_id) {
                    // Session lookups go through the provider; never await
                    // it on the shard loop.
                    tokio::spawn(async move { conn.refresh_session().await });
                }
            }
            HubCommand::UpdateActivity {
                user_id,
                session_id,
                at,
            } => {
                for conn in self.index.for_user(&user_id) {
                    if conn.session_id() == session_id {
                        conn.touch();
                        tracing::trace!(
                            shard = self.shard_id,
                            conn_id = %conn.id(),
                            at = %at,
                            "activity updated"
                        );
                    }
                }
            }
            HubCommand::ForUser { user_id, reply } => {
                let ids = self
                    .index
                    .for_user(&user_id)
                    .iter()
                    .map(|c| c.id().to_string())
                    .collect();
                let _ = reply.send(ids);
            }
            HubCommand::Count { reply } => {
                let _ = reply.send(self.index.len());
            }
            HubCommand::Stop => unreachable!("handled in run loop"),
        }
    }

    fn register(&mut self, conn: Arc<WebConn>) {
        // A reconnect for the same session reaps the stale duplicate it
        // replaces, if that one has already gone inactive.
        for prev in self.index.for_user(conn.user_id()) {
            if prev.id() != conn.id() && prev.session_id() == conn.session_id() {
                if let Some(stale) = self
                    .index
                    .remove_inactive_by_connection_id(conn.user_id(), prev.id())
                {
                    stale.close();
                    tracing::debug!(
                        shard = self.shard_id,
                        conn_id = %stale.id(),
                        "reaped stale duplicate connection"
                    );
                }
            }
        }

        conn.mark_active();
        tracing::debug!(
            shard = self.shard_id,
            conn_id = %conn.id(),
            user_id = %conn.user_id(),
            "connection registered"
        );
        self.index.add(conn);
    }

    /// Evaluate one broadcast against every connection in the index. A
    /// failure on one connection tears that connection down and never
    /// affects the rest.
    fn deliver(&mut self, broadcast: &Broadcast) {
        let mut torn_down: Vec<String> = Vec::new();

        for conn in self.index.iter() {
            if conn.is_closed() {
                torn_down.push(conn.id().to_string());
                continue;
            }
            if !broadcast.matches(conn) {
                continue;
            }
            match conn.send(broadcast.payload.clone()) {
                Ok(()) => {}
                Err(DeliveryError::QueueFull) => {
                    tracing::warn!(
                        shard = self.shard_id,
                        conn_id = %conn.id(),
                        event = %broadcast.payload.name,
                        "outbound queue full, dropping connection"
                    );
                    conn.close();
                    torn_down.push(conn.id().to_string());
                }
                Err(DeliveryError::Closed) => {
                    torn_down.push(conn.id().to_string());
                }
            }
        }

        for conn_id in torn_down {
            if let Some(conn) = self.index.remove(&conn_id) {
                conn.close();
            }
        }
    }

    fn sweep(&mut self) {
        let removed = self
            .index
            .remove_inactive_connections(self.config.inactivity_window);
        for conn in removed {
            conn.close();
            tracing::info!(
                shard = self.shard_id,
                conn_id = %conn.id(),
                user_id = %conn.user_id(),
                "reaped inactive connection"
            );
        }
    }
}
