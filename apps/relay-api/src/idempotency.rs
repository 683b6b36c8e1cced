//! Short-TTL idempotency cache for create-like writes.
//!
//! Keyed by a caller-supplied token, this converts "a retry might
//! double-execute" into "a retry is rejected while the first attempt is in
//! flight, or returns the first answer afterwards".

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

/// Default lifetime for entries. Long enough to absorb client retries,
/// short enough that a token can be reused by a genuinely new request later.
pub const DEFAULT_WRITE_TTL: Duration = Duration::from_secs(60);

/// Outcome of `begin` for a token.
#[derive(Debug, Clone, PartialEq)]
pub enum Begin {
    /// No live entry for this token, the caller should perform the write.
    Proceed,
    /// Another attempt with this token is still in flight, reject the
    /// duplicate, do not wait.
    Conflict,
    /// The write already completed within the TTL, short-circuit with the
    /// cached result.
    Completed(Value),
}

#[derive(Debug, Clone)]
enum WriteState {
    Pending,
    Completed(Value),
}

#[derive(Debug, Clone)]
struct WriteEntry {
    state: WriteState,
    created_at: Instant,
    ttl: Duration,
}

impl WriteEntry {
    fn pending(ttl: Duration) -> Self {
        Self {
            state: WriteState::Pending,
            created_at: Instant::now(),
            ttl,
        }
    }

    fn expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

/// Process-wide cache of in-flight and recently-completed writes. All
/// atomicity lives in the dashmap entry API; no external locking.
pub struct IdempotencyCache {
    entries: DashMap<String, WriteEntry>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Atomically claim a token. Exactly one of two racing callers with the
    /// same token gets `Proceed`; the other gets `Conflict`.
    pub fn begin(&self, token: &str) -> Begin {
        match self.entries.entry(token.to_string()) {
            dashmap::Entry::Vacant(slot) => {
                slot.insert(WriteEntry::pending(self.ttl));
                Begin::Proceed
            }
            dashmap::Entry::Occupied(mut slot) => {
                let entry = slot.get();
                if entry.expired() {
                    // Expired entries are never returned as valid; the
                    // token is claimed anew in place.
                    slot.insert(WriteEntry::pending(self.ttl));
                    return Begin::Proceed;
                }
                match &entry.state {
                    WriteState::Pending => Begin::Conflict,
                    WriteState::Completed(result) => Begin::Completed(result.clone()),
                }
            }
        }
    }

    /// Record the result of a successful write. Restarts the TTL so
    /// late retries within the window get the cached answer.
    pub fn complete(&self, token: &str, result: Value) {
        if let Some(mut entry) = self.entries.get_mut(token) {
            *entry = WriteEntry {
                state: WriteState::Completed(result),
                created_at: Instant::now(),
                ttl: self.ttl,
            };
        }
    }

    /// Drop a failed attempt so a later retry with the same token proceeds
    /// as new.
    pub fn fail(&self, token: &str) {
        self.entries
            .remove_if(token, |_, entry| matches!(entry.state, WriteState::Pending));
    }

    /// Active sweep; expiry is also enforced passively in `begin`.
    /// Returns the number of entries removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.expired());
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new(DEFAULT_WRITE_TTL)
    }
}
