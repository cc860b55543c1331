//! WebSocket handler for gateway dial-home connections
//!
//! Owns the per-connection dispatcher loop: handshake, frame routing, idle
//! probing, and the cleanup sequence that always runs on loop exit.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::protocol::{close_code, GatewayMessage, Outbound, ServerMessage};
use crate::state::AppState;
use ops_core::store::OpsStore;

/// Query parameters for the gateway WebSocket endpoint
#[derive(Debug, serde::Deserialize)]
pub struct ConnectQuery {
    pub token: String,
    pub version: Option<String>,
}

/// WebSocket upgrade handler for `/gateway/connect`
pub async fn gateway_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_gateway_socket(socket, query, state))
}

/// Handle one gateway connection from handshake to cleanup
async fn handle_gateway_socket(mut socket: WebSocket, query: ConnectQuery, state: AppState) {
    // Token verification is delegated; a rejected token closes the socket
    // with a distinct code and no connection record is created.
    let Some(ctx) = state.store.verify_machine_token(&query.token).await else {
        warn!("Rejected gateway connection: invalid machine token");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::AUTH_FAILED,
                reason: "Authentication failed".into(),
            })))
            .await;
        return;
    };

    let machine_id = ctx.machine_id;
    let organization_id = ctx.organization_id;
    let version = query.version.as_deref();

    let connection = match state
        .store
        .record_connect(machine_id, organization_id, version)
        .await
    {
        Ok(connection) => connection,
        Err(err) => {
            error!(
                "Failed to record gateway connect machine_id={} error={}",
                machine_id, err
            );
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 1011,
                    reason: "Connection setup failed".into(),
                })))
                .await;
            return;
        }
    };
    let connection_id = connection.id;

    info!(
        "Gateway connected machine_id={} organization_id={} version={}",
        machine_id,
        organization_id,
        version.unwrap_or("unknown")
    );

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Single outbound channel per connection; the forwarder task is the only
    // writer on the socket, so frames from the loop and from API callers
    // never interleave.
    let (tx, mut rx) = mpsc::channel::<Outbound>(100);

    let send_task = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(msg) => match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if ws_sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Failed to serialize outbound frame: {}", e);
                    }
                },
                Outbound::Close { code, reason } => {
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    state
        .broker
        .register(
            machine_id,
            organization_id,
            connection_id,
            version.map(str::to_string),
            tx.clone(),
        )
        .await;

    let _ = tx
        .send(Outbound::Frame(ServerMessage::Welcome {
            machine_id,
            connection_id,
        }))
        .await;

    push_pending_tasks(&state, machine_id, &tx).await;

    // Dispatcher loop: wait for the next frame with a bounded idle timeout.
    // Idling alone never closes the connection; only an explicit close or a
    // transport error does.
    loop {
        match tokio::time::timeout(state.config.idle_timeout, ws_receiver.next()).await {
            Err(_) => {
                debug!("Idle timeout, probing machine_id={}", machine_id);
                let probe = ServerMessage::Ping {
                    timestamp: Utc::now().to_rfc3339(),
                };
                if tx.send(Outbound::Frame(probe)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Ok(Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<GatewayMessage>(&text) {
                    Ok(msg) => {
                        handle_gateway_message(&state, machine_id, connection_id, msg, &tx).await;
                    }
                    Err(e) => {
                        // Malformed or unrecognized frame: drop it, keep the
                        // connection open.
                        warn!(
                            "Undecodable frame from machine_id={} error={}",
                            machine_id, e
                        );
                    }
                }
            }
            Ok(Some(Ok(Message::Close(_)))) => {
                info!("Gateway sent close frame machine_id={}", machine_id);
                break;
            }
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {
                debug!("WS control frame from machine_id={}", machine_id);
            }
            Ok(Some(Ok(Message::Binary(_)))) => {
                warn!("Unexpected binary frame from machine_id={}", machine_id);
            }
            Ok(Some(Err(e))) => {
                error!("WebSocket error machine_id={} error={}", machine_id, e);
                break;
            }
        }
    }

    // Cleanup always runs in this order: unregister (cancels waiters and
    // drops terminal bindings), persist the disconnect, log completion.
    info!("Gateway disconnected machine_id={}", machine_id);
    state.broker.unregister(machine_id, connection_id).await;
    if let Err(err) = state.store.record_disconnect(connection_id).await {
        warn!(
            "Failed to record disconnect connection_id={} error={}",
            connection_id, err
        );
    }
    send_task.abort();
    info!(
        "Gateway cleanup complete machine_id={} connection_id={}",
        machine_id, connection_id
    );
}

/// Push queued-but-undelivered tasks down a freshly registered connection.
async fn push_pending_tasks(state: &AppState, machine_id: Uuid, tx: &mpsc::Sender<Outbound>) {
    let entries = state
        .store
        .pending_tasks(machine_id, state.config.pending_task_batch)
        .await;

    for entry in entries {
        let frame = ServerMessage::Task {
            task_id: entry.task_id,
            queue_entry_id: entry.id,
            payload: entry.payload,
        };
        if tx.send(Outbound::Frame(frame)).await.is_err() {
            return;
        }
    }
}

/// Route a single decoded frame to its effect.
async fn handle_gateway_message(
    state: &AppState,
    machine_id: Uuid,
    connection_id: i64,
    msg: GatewayMessage,
    tx: &mpsc::Sender<Outbound>,
) {
    match msg {
        GatewayMessage::Heartbeat {
            timestamp,
            agents_managed,
        } => {
            handle_liveness(state, machine_id, connection_id, timestamp, agents_managed, tx).await;
        }

        GatewayMessage::Ping {
            timestamp,
            agents_managed,
        } => {
            // A plain ping proves the transport, but whether it also counts
            // as a heartbeat is a policy switch.
            if state.config.ping_refreshes_heartbeat {
                handle_liveness(state, machine_id, connection_id, timestamp, agents_managed, tx)
                    .await;
            } else {
                let _ = tx
                    .send(Outbound::Frame(ServerMessage::Pong { timestamp }))
                    .await;
            }
        }

        GatewayMessage::TaskAck { queue_entry_id } => {
            if let Err(err) = state.store.acknowledge_task(queue_entry_id).await {
                warn!(
                    "Failed to acknowledge queue entry {} error={}",
                    queue_entry_id, err
                );
            }
        }

        GatewayMessage::TaskDispatched {
            queue_entry_id,
            agent_id,
        } => {
            if let Err(err) = state
                .store
                .mark_task_dispatched(queue_entry_id, agent_id)
                .await
            {
                warn!(
                    "Failed to mark queue entry {} dispatched error={}",
                    queue_entry_id, err
                );
            }
        }

        GatewayMessage::TaskCompleted { queue_entry_id } => {
            if let Err(err) = state.store.mark_task_completed(queue_entry_id).await {
                warn!(
                    "Failed to mark queue entry {} completed error={}",
                    queue_entry_id, err
                );
            }
        }

        GatewayMessage::Response {
            request_id,
            response,
        } => {
            state.broker.resolve(machine_id, &request_id, response).await;
        }

        GatewayMessage::AgentStatus { agent_id, status } => {
            if let Err(err) = state.store.update_agent_status(agent_id, &status).await {
                warn!(
                    "Failed to update agent status agent_id={} error={}",
                    agent_id, err
                );
            }
        }

        GatewayMessage::TerminalOutput {
            session_id,
            content,
        } => {
            // Output with no binding is dropped silently.
            state
                .broker
                .relay_terminal_output(machine_id, &session_id, content)
                .await;
        }
    }
}

/// Heartbeat effect: refresh in-memory liveness, persist it, reply with a
/// pong echoing the gateway's timestamp.
async fn handle_liveness(
    state: &AppState,
    machine_id: Uuid,
    connection_id: i64,
    timestamp: Option<Value>,
    agents_managed: Option<i64>,
    tx: &mpsc::Sender<Outbound>,
) {
    state
        .broker
        .update_heartbeat(machine_id, connection_id, agents_managed)
        .await;

    if let Err(err) = state
        .store
        .update_gateway_heartbeat(connection_id, agents_managed)
        .await
    {
        warn!(
            "Failed to persist heartbeat connection_id={} error={}",
            connection_id, err
        );
    }

    let _ = tx
        .send(Outbound::Frame(ServerMessage::Pong { timestamp }))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use ops_core::store::{InMemoryStore, QueueStatus};
    use serde_json::json;
    use std::sync::Arc;

    struct Harness {
        state: AppState,
        machine_id: Uuid,
        connection_id: i64,
        rx: mpsc::Receiver<Outbound>,
        tx: mpsc::Sender<Outbound>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let state = AppState::new(store, GatewayConfig::default());
        let machine_id = Uuid::new_v4();
        let org_id = Uuid::new_v4();
        let connection = state
            .store
            .record_connect(machine_id, org_id, Some("1.0.0"))
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(16);
        state
            .broker
            .register(machine_id, org_id, connection.id, None, tx.clone())
            .await;
        Harness {
            state,
            machine_id,
            connection_id: connection.id,
            rx,
            tx,
        }
    }

    #[tokio::test]
    async fn heartbeat_updates_liveness_and_replies_pong() {
        let mut h = harness().await;

        handle_gateway_message(
            &h.state,
            h.machine_id,
            h.connection_id,
            GatewayMessage::Heartbeat {
                timestamp: Some(json!(42)),
                agents_managed: Some(3),
            },
            &h.tx,
        )
        .await;

        let gateway = h.state.broker.get(h.machine_id).await.unwrap();
        assert_eq!(gateway.agents_managed().await, 3);

        let row = h.state.store.get_connection(h.connection_id).await.unwrap();
        assert!(row.last_heartbeat_at.is_some());
        assert_eq!(row.agents_managed, 3);

        match h.rx.recv().await.unwrap() {
            Outbound::Frame(ServerMessage::Pong { timestamp }) => {
                assert_eq!(timestamp, Some(json!(42)));
            }
            other => panic!("expected pong, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_without_heartbeat_policy_only_pongs() {
        let store = Arc::new(InMemoryStore::new());
        let config = GatewayConfig {
            ping_refreshes_heartbeat: false,
            ..GatewayConfig::default()
        };
        let state = AppState::new(store, config);
        let machine_id = Uuid::new_v4();
        let org_id = Uuid::new_v4();
        let connection = state
            .store
            .record_connect(machine_id, org_id, None)
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        state
            .broker
            .register(machine_id, org_id, connection.id, None, tx.clone())
            .await;

        handle_gateway_message(
            &state,
            machine_id,
            connection.id,
            GatewayMessage::Ping {
                timestamp: None,
                agents_managed: Some(9),
            },
            &tx,
        )
        .await;

        // Pong is sent but the counter is untouched under this policy.
        assert!(matches!(
            rx.recv().await.unwrap(),
            Outbound::Frame(ServerMessage::Pong { .. })
        ));
        let gateway = state.broker.get(machine_id).await.unwrap();
        assert_eq!(gateway.agents_managed().await, 0);
    }

    #[tokio::test]
    async fn task_lifecycle_frames_update_queue_entry() {
        let h = harness().await;
        let agent_id = Uuid::new_v4();
        let entry = h
            .state
            .store
            .enqueue_task(h.machine_id, Uuid::new_v4(), json!({}))
            .await
            .unwrap();

        handle_gateway_message(
            &h.state,
            h.machine_id,
            h.connection_id,
            GatewayMessage::TaskAck {
                queue_entry_id: entry.id,
            },
            &h.tx,
        )
        .await;
        handle_gateway_message(
            &h.state,
            h.machine_id,
            h.connection_id,
            GatewayMessage::TaskDispatched {
                queue_entry_id: entry.id,
                agent_id,
            },
            &h.tx,
        )
        .await;
        handle_gateway_message(
            &h.state,
            h.machine_id,
            h.connection_id,
            GatewayMessage::TaskCompleted {
                queue_entry_id: entry.id,
            },
            &h.tx,
        )
        .await;

        let row = h.state.store.get_queue_entry(entry.id).await.unwrap();
        assert_eq!(row.status, QueueStatus::Completed);
        assert_eq!(row.agent_id, Some(agent_id));
    }

    #[tokio::test]
    async fn terminal_output_without_binding_keeps_loop_alive() {
        let mut h = harness().await;

        handle_gateway_message(
            &h.state,
            h.machine_id,
            h.connection_id,
            GatewayMessage::TerminalOutput {
                session_id: "nope".to_string(),
                content: "hello".to_string(),
            },
            &h.tx,
        )
        .await;

        // A following frame is still processed normally.
        handle_gateway_message(
            &h.state,
            h.machine_id,
            h.connection_id,
            GatewayMessage::Heartbeat {
                timestamp: None,
                agents_managed: None,
            },
            &h.tx,
        )
        .await;
        assert!(matches!(
            h.rx.recv().await.unwrap(),
            Outbound::Frame(ServerMessage::Pong { .. })
        ));
    }

    #[tokio::test]
    async fn response_frame_resolves_waiter() {
        let h = harness().await;
        let broker = Arc::clone(&h.state.broker);
        let machine_id = h.machine_id;

        let mut rx = h.rx;
        let state = h.state.clone();
        let tx = h.tx.clone();
        let connection_id = h.connection_id;
        let responder = tokio::spawn(async move {
            let request_id = loop {
                match rx.recv().await.unwrap() {
                    Outbound::Frame(ServerMessage::TerminalStart { request_id, .. }) => {
                        break request_id;
                    }
                    _ => continue,
                }
            };
            handle_gateway_message(
                &state,
                machine_id,
                connection_id,
                GatewayMessage::Response {
                    request_id,
                    response: json!({"ok": true}),
                },
                &tx,
            )
            .await;
        });

        let reply = broker
            .send_and_await(
                machine_id,
                super::super::protocol::RequestKind::TerminalStart,
                json!({}),
                std::time::Duration::from_secs(5),
            )
            .await;
        responder.await.unwrap();
        assert_eq!(reply, Some(json!({"ok": true})));
    }
}
