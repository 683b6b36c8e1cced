use axum::routing::get;
use axum::Router;

use crate::AppState;

mod events;
mod health;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/health", get(health::health))
        .merge(events::router())
        .merge(crate::gateway::server::router())
}
