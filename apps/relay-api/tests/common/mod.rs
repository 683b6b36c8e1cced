//! Shared helpers for integration tests.

use std::net::SocketAddr;
use std::sync::Arc;

use relay_api::config::Config;
use relay_api::hub::HubPool;
use relay_api::idempotency::IdempotencyCache;
use relay_api::session::{MemorySessionProvider, SessionProvider, SessionSnapshot};
use relay_api::AppState;

pub fn snapshot(session_id: &str, user_id: &str) -> SessionSnapshot {
    SessionSnapshot {
        session_id: session_id.to_string(),
        user_id: user_id.to_string(),
        roles: vec!["member".to_string()],
        locale: "en".to_string(),
    }
}

pub fn test_state() -> (AppState, Arc<MemorySessionProvider>) {
    let config = Arc::new(Config::default());
    let hub = Arc::new(HubPool::spawn(config.hub_shards, config.hub_config()));
    let provider = Arc::new(MemorySessionProvider::new());
    let sessions: Arc<dyn SessionProvider> = provider.clone();
    let state = AppState {
        config: config.clone(),
        hub,
        sessions,
        idempotency: Arc::new(IdempotencyCache::new(config.idempotency_ttl)),
    };
    (state, provider)
}

/// Start an actual TCP server for WebSocket/HTTP testing. Returns the bound
/// address plus the state and the in-memory session provider for issuing
/// tickets. The server runs in the background.
pub async fn start_server() -> (SocketAddr, AppState, Arc<MemorySessionProvider>) {
    let (state, provider) = test_state();
    let app = relay_api::routes::router().with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state, provider)
}
