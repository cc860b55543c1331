//! Agent endpoints: registration and the interactive terminal relay

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::gateway::terminal_ws_handler;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterAgentRequest {
    organization_id: Uuid,
    name: String,
}

async fn register_agent_handler(
    State(state): State<AppState>,
    Json(body): Json<RegisterAgentRequest>,
) -> impl IntoResponse {
    match state
        .store
        .register_agent(body.organization_id, &body.name)
        .await
    {
        Ok(agent) => (StatusCode::CREATED, Json(agent)).into_response(),
        Err(e) => {
            warn!("Agent registration rejected: {}", e);
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/agents", post(register_agent_handler))
        .route("/agents/{agent_id}/terminal", get(terminal_ws_handler))
}
