use axum::extract::State;
use axum::Json;

use crate::AppState;

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "shards": state.hub.shard_count(),
    }))
}
