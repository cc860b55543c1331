//! Task dispatch endpoint - queues a task and attempts live delivery

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::state::AppState;
use ops_core::store::OpsStore;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DispatchTaskRequest {
    task_id: Option<Uuid>,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DispatchTaskResponse {
    task_id: Uuid,
    queue_entry_id: i64,
    /// Whether the frame reached a live gateway connection. A queued task
    /// with `delivered: false` is pushed on the machine's next connect.
    delivered: bool,
}

async fn dispatch_task_handler(
    State(state): State<AppState>,
    Path(machine_id): Path<Uuid>,
    Json(body): Json<DispatchTaskRequest>,
) -> impl IntoResponse {
    let task_id = body.task_id.unwrap_or_else(Uuid::new_v4);

    let entry = match state
        .store
        .enqueue_task(machine_id, task_id, body.payload)
        .await
    {
        Ok(entry) => entry,
        Err(e) => {
            warn!("Failed to enqueue task machine_id={}: {}", machine_id, e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let delivered = state
        .broker
        .send_task(machine_id, task_id, entry.id, entry.payload.clone())
        .await;

    (
        StatusCode::ACCEPTED,
        Json(DispatchTaskResponse {
            task_id,
            queue_entry_id: entry.id,
            delivered,
        }),
    )
        .into_response()
}

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/api/machines/{machine_id}/tasks",
        post(dispatch_task_handler),
    )
}
