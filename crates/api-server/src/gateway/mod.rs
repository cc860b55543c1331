//! Gateway dial-home broker
//!
//! Remote machines run a gateway daemon that dials home and holds one
//! persistent WebSocket to this server. This module owns that connection:
//! the wire protocol, the in-memory registry and request correlator, the
//! per-connection dispatcher loop, and the terminal session relay.

pub mod handler;
pub mod manager;
pub mod protocol;
pub mod terminal;

pub use handler::gateway_ws_handler;
pub use manager::{BrokerStats, ConnectedGateway, GatewayBroker};
pub use protocol::*;
pub use terminal::terminal_ws_handler;
