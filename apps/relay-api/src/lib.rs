pub mod config;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod idempotency;
pub mod routes;
pub mod session;

use std::sync::Arc;

use config::Config;
use hub::HubPool;
use idempotency::IdempotencyCache;
use session::SessionProvider;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub hub: Arc<HubPool>,
    pub sessions: Arc<dyn SessionProvider>,
    pub idempotency: Arc<IdempotencyCache>,
}
