//! Machine enrollment endpoints

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterMachineRequest {
    organization_id: Uuid,
    name: String,
}

/// Enroll a machine and hand back its token. The raw token is shown exactly
/// once; only its digest is retained.
async fn register_machine_handler(
    State(state): State<AppState>,
    Json(body): Json<RegisterMachineRequest>,
) -> impl IntoResponse {
    match state
        .store
        .register_machine(body.organization_id, &body.name)
        .await
    {
        Ok(issued) => (StatusCode::CREATED, Json(issued)).into_response(),
        Err(e) => {
            warn!("Machine registration rejected: {}", e);
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/machines", post(register_machine_handler))
}
