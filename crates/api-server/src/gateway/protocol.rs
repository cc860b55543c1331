//! Wire protocol types for gateway dial-home connections
//!
//! All frames are JSON objects with a `type` discriminator. The enums here
//! are closed: an unknown `type` fails to decode and is dropped by the
//! dispatcher without terminating the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// WebSocket close codes used by the broker.
pub mod close_code {
    /// Malformed identifier in the request path.
    pub const INVALID_ID: u16 = 4000;
    /// Machine token rejected during the handshake.
    pub const AUTH_FAILED: u16 = 4001;
    /// No gateway currently connected for the target organization.
    pub const NO_GATEWAY: u16 = 4003;
    /// Referenced agent does not exist.
    pub const NOT_FOUND: u16 = 4004;
    /// Gateway refused or never answered a session setup request.
    pub const SETUP_FAILED: u16 = 4005;
    /// Connection replaced by a newer registration for the same machine.
    pub const SUPERSEDED: u16 = 4006;
}

/// Messages sent by a gateway to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    Heartbeat {
        timestamp: Option<Value>,
        agents_managed: Option<i64>,
    },
    /// Same shape as a heartbeat; whether it also refreshes liveness is a
    /// configuration choice.
    Ping {
        timestamp: Option<Value>,
        agents_managed: Option<i64>,
    },
    TaskAck {
        queue_entry_id: i64,
    },
    TaskDispatched {
        queue_entry_id: i64,
        agent_id: Uuid,
    },
    TaskCompleted {
        queue_entry_id: i64,
    },
    /// Reply to a correlated request previously sent by the server.
    Response {
        request_id: String,
        #[serde(default)]
        response: Value,
    },
    AgentStatus {
        agent_id: Uuid,
        status: String,
    },
    TerminalOutput {
        session_id: String,
        #[serde(default)]
        content: String,
    },
}

/// Messages sent by the server to a gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        machine_id: Uuid,
        connection_id: i64,
    },
    /// Echoes whatever timestamp the gateway supplied with its heartbeat.
    Pong {
        timestamp: Option<Value>,
    },
    /// Idle-timeout liveness probe.
    Ping {
        timestamp: String,
    },
    Task {
        task_id: Uuid,
        queue_entry_id: i64,
        payload: Value,
    },
    TerminalStart {
        request_id: String,
        payload: Value,
    },
    TerminalInput {
        session_id: String,
        content: String,
    },
    TerminalResize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    TerminalStop {
        session_id: String,
    },
}

/// Correlated request kinds the server can issue over a gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    TerminalStart,
}

impl RequestKind {
    pub fn into_frame(self, request_id: String, payload: Value) -> ServerMessage {
        match self {
            RequestKind::TerminalStart => ServerMessage::TerminalStart {
                request_id,
                payload,
            },
        }
    }
}

/// Items carried by a connection's outbound channel. All writers share one
/// channel drained by a single forwarder task, so partial frames can never
/// interleave on the socket.
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerMessage),
    Close { code: u16, reason: &'static str },
}

/// Frames a terminal client sends to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalClientMessage {
    Input { content: String },
    Resize { cols: u16, rows: u16 },
}

/// Frames the server sends to a terminal client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalServerMessage {
    Output { content: String },
    Error { message: String },
}
