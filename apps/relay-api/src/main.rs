use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_api::config::Config;
use relay_api::hub::HubPool;
use relay_api::idempotency::IdempotencyCache;
use relay_api::session::{MemorySessionProvider, SessionProvider};
use relay_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing, env vars may be set externally)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env());
    let port = config.port;

    let hub = Arc::new(HubPool::spawn(config.hub_shards, config.hub_config()));

    // In-memory provider for single-process deployments. Replace with the
    // auth service client when running against a real session backend.
    let sessions: Arc<dyn SessionProvider> = Arc::new(MemorySessionProvider::new());

    let idempotency = Arc::new(IdempotencyCache::new(config.idempotency_ttl));

    let state = AppState {
        config,
        hub: hub.clone(),
        sessions,
        idempotency,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(relay_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "relay-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await
        .expect("server error");
}

async fn shutdown_signal(hub: Arc<HubPool>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received, stopping hub pool");
    hub.stop_all().await;
}
