//! Per-connection state: outbound queue, activity tracking, lifecycle.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::Notify;

use relay_common::id::{prefix, prefixed_ulid};

use crate::session::{SessionProvider, SessionSnapshot};

use super::broadcast::EventPayload;

/// Connection lifecycle. `Closed` is terminal, a fresh connection must be
/// created for a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Created, not yet registered with a shard.
    Connecting = 0,
    /// Registered and delivering events.
    Active = 1,
    /// Socket still open but no user activity within the configured window.
    /// Candidate for reaping.
    Inactive = 2,
    /// Torn down. Terminal.
    Closed = 3,
}

impl From<u8> for ConnState {
    fn from(v: u8) -> Self {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Active,
            2 => ConnState::Inactive,
            _ => ConnState::Closed,
        }
    }
}

/// Why a non-blocking delivery attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The outbound queue is full, the connection is slow or broken and
    /// should be torn down.
    QueueFull,
    /// The pump has already gone away.
    Closed,
}

/// One live client attached to the real-time channel.
///
/// The hub shard owns registration; the transport side (gateway) owns the
/// pump that drains the outbound queue. Everything here is safe to touch
/// from either side.
pub struct WebConn {
    id: String,
    user_id: String,
    session_id: String,
    tx: mpsc::Sender<Arc<EventPayload>>,
    state: AtomicU8,
    seq: AtomicU64,
    last_activity: Mutex<Instant>,
    session: RwLock<SessionSnapshot>,
    provider: Arc<dyn SessionProvider>,
    close_notify: Notify,
}

impl WebConn {
    /// Build a connection plus the receiving half of its outbound queue.
    /// The caller spawns the pump that drains the receiver into the
    /// transport.
    pub fn channel(
        snapshot: SessionSnapshot,
        provider: Arc<dyn SessionProvider>,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<EventPayload>>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let conn = Arc::new(Self {
            id: prefixed_ulid(prefix::CONNECTION),
            user_id: snapshot.user_id.clone(),
            session_id: snapshot.session_id.clone(),
            tx,
            state: AtomicU8::new(ConnState::Connecting as u8),
            seq: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
            session: RwLock::new(snapshot),
            provider,
            close_notify: Notify::new(),
        });
        (conn, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ConnState {
        self.state.load(Ordering::Acquire).into()
    }

    /// Transition to a new state. `Closed` can never be left.
    fn set_state(&self, next: ConnState) -> ConnState {
        let prev = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                if ConnState::from(cur) == ConnState::Closed {
                    None
                } else {
                    Some(next as u8)
                }
            });
        match prev {
            Ok(p) => p.into(),
            Err(_) => ConnState::Closed,
        }
    }

    pub fn mark_active(&self) {
        self.set_state(ConnState::Active);
    }

    pub fn mark_inactive(&self) {
        self.set_state(ConnState::Inactive);
    }

    /// Record user activity and re-activate an inactive connection.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
        if self.state() == ConnState::Inactive {
            self.mark_active();
        }
    }

    /// How long since the last recorded user activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Next dispatch sequence number for this connection's event stream.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Non-blocking enqueue onto the outbound queue. Never applies
    /// backpressure to the broadcaster.
    pub fn send(&self, event: Arc<EventPayload>) -> Result<(), DeliveryError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(DeliveryError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    /// Snapshot of the cached session/permission data.
    pub fn session(&self) -> SessionSnapshot {
        self.session.read().clone()
    }

    /// Re-resolve the cached session through the provider. A revoked session
    /// closes the connection.
    pub async fn refresh_session(&self) {
        match self.provider.load_session(&self.session_id).await {
            Ok(Some(snapshot)) => {
                *self.session.write() = snapshot;
            }
            Ok(None) => {
                tracing::info!(
                    conn_id = %self.id,
                    session_id = %self.session_id,
                    "session revoked, closing connection"
                );
                self.close();
            }
            Err(err) => {
                tracing::warn!(
                    conn_id = %self.id,
                    error = %err.message,
                    "session refresh failed, keeping cached snapshot"
                );
            }
        }
    }

    /// Idempotent teardown: marks the connection `Closed` and wakes the pump.
    /// Safe to call multiple times or concurrently.
    pub fn close(&self) {
        let prev = self.state.swap(ConnState::Closed as u8, Ordering::AcqRel);
        if ConnState::from(prev) != ConnState::Closed {
            self.close_notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnState::Closed
    }

    /// Resolves once the connection is closed. The notified future is
    /// enabled before the state check so a concurrent `close` is never
    /// missed.
    pub async fn closed(&self) {
        let notified = self.close_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

impl std::fmt::Debug for WebConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebConn")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("state", &self.state())
            .finish()
    }
}
