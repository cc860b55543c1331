//! Gateway routes: dial-home WebSocket plus live-connection queries

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::gateway::{gateway_ws_handler, BrokerStats};
use crate::state::AppState;
use ops_core::store::OpsStore;

/// One live connection joined with its machine name.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectedGatewayInfo {
    machine_id: Uuid,
    machine_name: String,
    organization_id: Uuid,
    connected_at: DateTime<Utc>,
    last_heartbeat_at: DateTime<Utc>,
    gateway_version: Option<String>,
    agents_managed: i64,
}

async fn stats_handler(State(state): State<AppState>) -> Json<BrokerStats> {
    Json(state.broker.stats().await)
}

async fn connected_handler(State(state): State<AppState>) -> Json<Vec<ConnectedGatewayInfo>> {
    let mut connected = Vec::new();
    for machine_id in state.broker.connected_machines().await {
        let Some(gateway) = state.broker.get(machine_id).await else {
            continue;
        };
        let machine_name = state
            .store
            .machine_name(machine_id)
            .await
            .unwrap_or_else(|| "Unknown".to_string());

        connected.push(ConnectedGatewayInfo {
            machine_id,
            machine_name,
            organization_id: gateway.organization_id,
            connected_at: gateway.connected_at,
            last_heartbeat_at: gateway.last_heartbeat_at().await,
            gateway_version: gateway.gateway_version.clone(),
            agents_managed: gateway.agents_managed().await,
        });
    }
    Json(connected)
}

/// Create router for gateway endpoints
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/gateway/connect", get(gateway_ws_handler))
        .route("/gateway/stats", get(stats_handler))
        .route("/gateway/connected", get(connected_handler))
}
