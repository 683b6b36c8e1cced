//! Cached session snapshots and the provider used to (re)resolve them.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::ApiError;

/// Permission/session data cached on a connection.
///
/// Refreshed in place on `invalidate_user` so already-connected clients pick
/// up role changes without reconnecting.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    /// Session identifier (`ses_` prefixed ULID).
    pub session_id: String,
    /// Authenticated user ID.
    pub user_id: String,
    /// Role names granted to this session.
    pub roles: Vec<String>,
    /// Client locale (e.g. `en`, `de`).
    pub locale: String,
}

/// Abstraction over session issuance/lookup, which lives outside this core.
///
/// Backed by the auth service in production and an in-memory map in tests.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Resolve a single-use connect ticket into a session snapshot.
    async fn resolve_ticket(&self, ticket: &str) -> Result<Option<SessionSnapshot>, ApiError>;

    /// Load the current snapshot for an existing session. `None` means the
    /// session was revoked and the connection should be closed.
    async fn load_session(&self, session_id: &str) -> Result<Option<SessionSnapshot>, ApiError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (for single-process deployments / tests)
// ---------------------------------------------------------------------------

pub struct MemorySessionProvider {
    by_ticket: DashMap<String, SessionSnapshot>,
    by_session: DashMap<String, SessionSnapshot>,
}

impl MemorySessionProvider {
    pub fn new() -> Self {
        Self {
            by_ticket: DashMap::new(),
            by_session: DashMap::new(),
        }
    }

    /// Register a ticket that resolves to the given snapshot.
    pub fn issue_ticket(&self, ticket: impl Into<String>, snapshot: SessionSnapshot) {
        self.by_session
            .insert(snapshot.session_id.clone(), snapshot.clone());
        self.by_ticket.insert(ticket.into(), snapshot);
    }

    /// Replace the stored snapshot for a session (simulates a role change).
    pub fn update_session(&self, snapshot: SessionSnapshot) {
        self.by_session
            .insert(snapshot.session_id.clone(), snapshot);
    }

    /// Revoke a session so `load_session` returns `None`.
    pub fn revoke_session(&self, session_id: &str) {
        self.by_session.remove(session_id);
    }
}

impl Default for MemorySessionProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionProvider for MemorySessionProvider {
    async fn resolve_ticket(&self, ticket: &str) -> Result<Option<SessionSnapshot>, ApiError> {
        // Tickets are single-use: consume on resolve.
        Ok(self.by_ticket.remove(ticket).map(|(_, snap)| snap))
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionSnapshot>, ApiError> {
        Ok(self.by_session.get(session_id).map(|s| s.clone()))
    }
}
