//! API server for the ops platform gateway broker
//!
//! Hosts the dial-home WebSocket endpoint for remote gateways alongside the
//! HTTP surface that consumes the broker: stats, live-connection listing,
//! machine/agent enrollment, task dispatch, and terminal relays.

mod config;
mod gateway;
mod routes;
mod state;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::GatewayConfig;
use crate::state::AppState;
use ops_core::store::InMemoryStore;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "api_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::from_env();
    tracing::info!("Gateway config: {:?}", config);

    let store = Arc::new(InMemoryStore::new());
    let app_state = AppState::new(store, config);

    let app = Router::new()
        .merge(routes::health::router())
        .merge(routes::gateway::router())
        .merge(routes::machines::router())
        .merge(routes::agents::router())
        .merge(routes::tasks::router())
        .with_state(app_state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = config::bind_addr();
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(listener, app).await.expect("Server error");
}
