//! Terminal session relay
//!
//! Binds an interactive client WebSocket to a terminal session multiplexed
//! inside one gateway connection: client input and resize frames are
//! forwarded to the gateway, `terminal_output` frames come back through the
//! broker binding registered here.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::protocol::{
    close_code, RequestKind, ServerMessage, TerminalClientMessage, TerminalServerMessage,
};
use crate::state::AppState;
use ops_core::store::OpsStore;

/// WebSocket upgrade handler for `/agents/{agent_id}/terminal`
pub async fn terminal_ws_handler(
    ws: WebSocketUpgrade,
    Path(agent_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_terminal_socket(socket, agent_id, state))
}

/// Send a structured error frame and close with the given code.
async fn reject(mut socket: WebSocket, message: &str, code: u16) {
    let frame = TerminalServerMessage::Error {
        message: message.to_string(),
    };
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: "".into(),
        })))
        .await;
}

/// Extract the client-visible error from a `terminal_start` reply, or `None`
/// if the gateway reported success.
fn start_failure(reply: &Option<Value>) -> Option<String> {
    match reply {
        None => Some("Gateway did not respond".to_string()),
        Some(value) => {
            if value.get("ok").and_then(Value::as_bool).unwrap_or(false) {
                None
            } else {
                Some(
                    value
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("Failed to start terminal session")
                        .to_string(),
                )
            }
        }
    }
}

async fn handle_terminal_socket(socket: WebSocket, raw_agent_id: String, state: AppState) {
    let Ok(agent_id) = Uuid::parse_str(&raw_agent_id) else {
        reject(socket, "Invalid agent ID format", close_code::INVALID_ID).await;
        return;
    };

    let Some(agent) = state.store.get_agent(agent_id).await else {
        reject(socket, "Agent not found", close_code::NOT_FOUND).await;
        return;
    };

    // Any connected gateway in the agent's organization can host the session.
    let Some(gateway) = state
        .broker
        .list_for_organization(agent.organization_id)
        .await
        .into_iter()
        .next()
    else {
        reject(
            socket,
            "No connected gateway available",
            close_code::NO_GATEWAY,
        )
        .await;
        return;
    };
    let machine_id = gateway.machine_id;

    info!(
        "Terminal session starting agent_id={} machine_id={}",
        agent_id, machine_id
    );

    let session_id = format!("terminal_{}_{}", agent_id, Uuid::new_v4().simple());

    let reply = state
        .broker
        .send_and_await(
            machine_id,
            RequestKind::TerminalStart,
            json!({
                "agent_id": agent_id,
                "session_id": session_id,
            }),
            state.config.terminal_start_timeout,
        )
        .await;

    if let Some(message) = start_failure(&reply) {
        warn!(
            "Terminal setup failed agent_id={} machine_id={} reason={}",
            agent_id, machine_id, message
        );
        reject(socket, &message, close_code::SETUP_FAILED).await;
        return;
    }

    // Bind only after the gateway acknowledged the session.
    let (client_tx, mut client_rx) = mpsc::channel::<TerminalServerMessage>(100);
    state
        .broker
        .register_terminal_session(machine_id, &session_id, client_tx)
        .await;

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Forwarder: broker binding -> client socket. Ends when the binding is
    // dropped (relay failure or gateway unregister) and closes the client.
    let forward_task = tokio::spawn(async move {
        while let Some(msg) = client_rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize terminal frame: {}", e);
                }
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    // Client -> gateway direction.
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<TerminalClientMessage>(&text)
            {
                Ok(TerminalClientMessage::Input { content }) => {
                    state
                        .broker
                        .send_message(
                            machine_id,
                            ServerMessage::TerminalInput {
                                session_id: session_id.clone(),
                                content,
                            },
                        )
                        .await;
                }
                Ok(TerminalClientMessage::Resize { cols, rows }) => {
                    state
                        .broker
                        .send_message(
                            machine_id,
                            ServerMessage::TerminalResize {
                                session_id: session_id.clone(),
                                cols,
                                rows,
                            },
                        )
                        .await;
                }
                Err(e) => {
                    warn!("Invalid frame from terminal client: {}", e);
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(
                    "Terminal client error agent_id={} error={}",
                    agent_id, e
                );
                break;
            }
        }
    }

    // Teardown: removal is idempotent, the stop frame is best-effort.
    state
        .broker
        .unregister_terminal_session(machine_id, &session_id)
        .await;
    state
        .broker
        .send_message(
            machine_id,
            ServerMessage::TerminalStop {
                session_id: session_id.clone(),
            },
        )
        .await;
    forward_task.abort();
    info!(
        "Terminal session cleanup complete agent_id={} session_id={}",
        agent_id, session_id
    );
}
