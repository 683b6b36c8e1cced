//! Event submission: the inbound interface domain components use to push
//! broadcasts into the hub, with optional idempotent-write protection.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;

use relay_common::id::{prefix, prefixed_ulid};

use crate::error::ApiError;
use crate::hub::{Broadcast, BroadcastTarget, EventPayload, Reliability};
use crate::idempotency::Begin;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/v1/events", post(publish_event))
}

#[derive(Debug, Deserialize)]
struct PublishRequest {
    event: String,
    #[serde(default)]
    data: Value,
    target: BroadcastTarget,
    #[serde(default)]
    reliability: Reliability,
    /// Client-generated idempotency token. Opaque; retries with the same
    /// token are rejected while in flight and replayed after completion.
    #[serde(default)]
    pending_id: Option<String>,
}

async fn publish_event(
    State(state): State<AppState>,
    Json(req): Json<PublishRequest>,
) -> Result<Json<Value>, ApiError> {
    if let Some(token) = &req.pending_id {
        match state.idempotency.begin(token) {
            Begin::Proceed => {}
            Begin::Conflict => {
                return Err(ApiError::pending("A request with this pending_id is already in flight"));
            }
            Begin::Completed(result) => {
                tracing::debug!(pending_id = %token, "replaying cached publish result");
                return Ok(Json(result));
            }
        }
    }

    if req.event.trim().is_empty() {
        if let Some(token) = &req.pending_id {
            state.idempotency.fail(token);
        }
        return Err(ApiError::bad_request("event name must not be empty"));
    }

    let event_id = prefixed_ulid(prefix::EVENT);
    let broadcast = Broadcast::new(EventPayload::new(req.event.clone(), req.data), req.target)
        .with_reliability(req.reliability);

    if broadcast.reliability == Reliability::Reliable {
        // Durable redelivery across restarts rides on the cluster messaging
        // layer; this process still delivers at most once.
        tracing::debug!(event = %req.event, "reliable delivery requested");
    }

    state.hub.broadcast_to_all(broadcast).await;

    let result = serde_json::json!({
        "id": event_id,
        "event": req.event,
    });
    if let Some(token) = &req.pending_id {
        state.idempotency.complete(token, result.clone());
    }

    Ok(Json(result))
}
