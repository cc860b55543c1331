//! Application state

use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::gateway::GatewayBroker;
use ops_core::store::InMemoryStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<GatewayBroker>,
    pub store: Arc<InMemoryStore>,
    pub config: GatewayConfig,
}

impl AppState {
    pub fn new(store: Arc<InMemoryStore>, config: GatewayConfig) -> Self {
        Self {
            broker: Arc::new(GatewayBroker::new()),
            store,
            config,
        }
    }
}
