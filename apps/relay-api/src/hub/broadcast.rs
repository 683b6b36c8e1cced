//! Broadcast messages: an event payload plus a targeting rule.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::conn::WebConn;

/// An event pushed to connections. Opaque to the hub itself.
#[derive(Debug, Clone, Serialize)]
pub struct EventPayload {
    /// The dispatch event name (e.g. "POST_CREATED").
    pub name: String,
    /// Serialized event data.
    pub data: Value,
}

impl EventPayload {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// Who a broadcast is for. Evaluated independently per connection at
/// delivery time, never pre-resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BroadcastTarget {
    /// Every connection in every shard.
    AllUsers,
    /// All connections owned by one user.
    User { user_id: String },
    /// One specific connection.
    Connection { connection_id: String },
    /// Everyone except the listed users.
    AllExcept { omit_users: HashSet<String> },
}

/// Delivery reliability requested by the producer. The hub is at-most-once
/// best-effort either way; `Reliable` is consumed by the external cluster
/// messaging layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    #[default]
    BestEffort,
    Reliable,
}

/// An event plus its targeting rule. Submitted once to the pool, evaluated
/// by every shard, then discarded.
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub payload: Arc<EventPayload>,
    pub target: BroadcastTarget,
    pub reliability: Reliability,
}

impl Broadcast {
    pub fn new(payload: EventPayload, target: BroadcastTarget) -> Self {
        Self {
            payload: Arc::new(payload),
            target,
            reliability: Reliability::BestEffort,
        }
    }

    pub fn with_reliability(mut self, reliability: Reliability) -> Self {
        self.reliability = reliability;
        self
    }

    /// Whether this broadcast should be delivered to the given connection.
    pub fn matches(&self, conn: &WebConn) -> bool {
        match &self.target {
            BroadcastTarget::AllUsers => true,
            BroadcastTarget::User { user_id } => conn.user_id() == user_id,
            BroadcastTarget::Connection { connection_id } => conn.id() == connection_id,
            BroadcastTarget::AllExcept { omit_users } => !omit_users.contains(conn.user_id()),
        }
    }
}
