//! Gateway broker - authoritative registry of live dial-home connections
//!
//! Owns the machine-id -> connection mapping, correlates request/response
//! exchanges over each connection, and fans tasks out to gateways. All
//! outbound writes for a connection go through its single `Outbound`
//! channel; the registry map is guarded by one `RwLock`, the per-connection
//! waiter and terminal maps by their own mutexes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{close_code, Outbound, RequestKind, ServerMessage, TerminalServerMessage};

#[derive(Debug, Clone)]
struct Liveness {
    last_heartbeat_at: DateTime<Utc>,
    agents_managed: i64,
}

/// One live gateway connection.
///
/// Mutated concurrently by its own dispatcher loop and by API callers that
/// hold a reference; the registry only ever hands out `Arc`s.
pub struct ConnectedGateway {
    pub machine_id: Uuid,
    pub organization_id: Uuid,
    /// Externally persisted connection sequence; also guards unregistration
    /// so a stale dispatcher loop cannot evict its replacement.
    pub connection_id: i64,
    pub gateway_version: Option<String>,
    pub connected_at: DateTime<Utc>,
    liveness: RwLock<Liveness>,
    tx: mpsc::Sender<Outbound>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    terminals: Mutex<HashMap<String, mpsc::Sender<TerminalServerMessage>>>,
}

impl ConnectedGateway {
    pub async fn last_heartbeat_at(&self) -> DateTime<Utc> {
        self.liveness.read().await.last_heartbeat_at
    }

    pub async fn agents_managed(&self) -> i64 {
        self.liveness.read().await.agents_managed
    }

    pub async fn pending_request_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn terminal_session_count(&self) -> usize {
        self.terminals.lock().await.len()
    }

    /// Cancel every parked waiter and drop every terminal binding. Dropping
    /// the oneshot senders resolves parked send_and_await calls immediately
    /// with an absent result; dropping the client senders ends each
    /// terminal forwarder, which closes the client socket.
    async fn cancel_sessions(&self) {
        let cancelled = self.pending.lock().await.drain().count();
        if cancelled > 0 {
            debug!(
                "Cancelled {} pending requests machine_id={}",
                cancelled, self.machine_id
            );
        }

        let sessions = self.terminals.lock().await.drain().count();
        if sessions > 0 {
            debug!(
                "Dropped {} terminal sessions machine_id={}",
                sessions, self.machine_id
            );
        }
    }
}

/// Aggregate snapshot over all live connections.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BrokerStats {
    pub connected_gateways: usize,
    pub total_agents_managed: i64,
    pub organizations: usize,
    pub terminal_sessions: usize,
}

/// Central broker for gateway dial-home connections.
pub struct GatewayBroker {
    connections: RwLock<HashMap<Uuid, Arc<ConnectedGateway>>>,
}

impl GatewayBroker {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new gateway connection, superseding any prior connection
    /// for the same machine. The previous holder's transport is closed
    /// best-effort through its outbound channel.
    pub async fn register(
        &self,
        machine_id: Uuid,
        organization_id: Uuid,
        connection_id: i64,
        gateway_version: Option<String>,
        tx: mpsc::Sender<Outbound>,
    ) -> Arc<ConnectedGateway> {
        let now = Utc::now();
        let gateway = Arc::new(ConnectedGateway {
            machine_id,
            organization_id,
            connection_id,
            gateway_version,
            connected_at: now,
            liveness: RwLock::new(Liveness {
                last_heartbeat_at: now,
                agents_managed: 0,
            }),
            tx,
            pending: Mutex::new(HashMap::new()),
            terminals: Mutex::new(HashMap::new()),
        });

        let previous = {
            let mut connections = self.connections.write().await;
            let previous = connections.remove(&machine_id);
            connections.insert(machine_id, Arc::clone(&gateway));
            previous
        };

        // The superseded loop's own cleanup is seq-guarded into a no-op, so
        // its waiters and terminal bindings must be torn down here.
        if let Some(previous) = previous {
            warn!(
                "Machine {} already connected, superseding connection {}",
                machine_id, previous.connection_id
            );
            let _ = previous.tx.try_send(Outbound::Close {
                code: close_code::SUPERSEDED,
                reason: "superseded by new connection",
            });
            previous.cancel_sessions().await;
        }

        info!(
            "Gateway registered machine_id={} organization_id={} connection_id={}",
            machine_id, organization_id, connection_id
        );
        gateway
    }

    /// Remove a connection, cancelling its pending waiters and dropping its
    /// terminal bindings. Only removes the record whose sequence matches, so
    /// a superseded connection's cleanup never evicts its replacement.
    /// Idempotent.
    pub async fn unregister(&self, machine_id: Uuid, connection_id: i64) {
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get(&machine_id) {
                Some(current) if current.connection_id == connection_id => {
                    connections.remove(&machine_id)
                }
                _ => None,
            }
        };

        let Some(gateway) = removed else {
            return;
        };

        // Orphaned waiters and terminal bindings never outlive the
        // connection.
        gateway.cancel_sessions().await;

        info!(
            "Gateway unregistered machine_id={} connection_id={}",
            machine_id, connection_id
        );
    }

    pub async fn get(&self, machine_id: Uuid) -> Option<Arc<ConnectedGateway>> {
        self.connections.read().await.get(&machine_id).cloned()
    }

    pub async fn list_for_organization(
        &self,
        organization_id: Uuid,
    ) -> Vec<Arc<ConnectedGateway>> {
        self.connections
            .read()
            .await
            .values()
            .filter(|gw| gw.organization_id == organization_id)
            .cloned()
            .collect()
    }

    pub async fn is_connected(&self, machine_id: Uuid) -> bool {
        self.connections.read().await.contains_key(&machine_id)
    }

    pub async fn connected_machines(&self) -> Vec<Uuid> {
        self.connections.read().await.keys().copied().collect()
    }

    pub async fn connected_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Refresh a connection's liveness timestamp; the timestamp never moves
    /// backwards. No-op for unknown machines, and seq-guarded so a
    /// superseded connection still draining frames cannot refresh its
    /// replacement's liveness.
    pub async fn update_heartbeat(
        &self,
        machine_id: Uuid,
        connection_id: i64,
        agents_managed: Option<i64>,
    ) {
        let Some(gateway) = self.get(machine_id).await else {
            return;
        };
        if gateway.connection_id != connection_id {
            debug!(
                "Ignoring heartbeat from superseded connection machine_id={} connection_id={}",
                machine_id, connection_id
            );
            return;
        }
        let mut liveness = gateway.liveness.write().await;
        let now = Utc::now();
        if now > liveness.last_heartbeat_at {
            liveness.last_heartbeat_at = now;
        }
        if let Some(count) = agents_managed {
            liveness.agents_managed = count;
        }
    }

    /// Send a single frame to a gateway. A failed send proves the
    /// connection is dead and unregisters it as a side effect.
    pub async fn send_message(&self, machine_id: Uuid, message: ServerMessage) -> bool {
        let Some(gateway) = self.get(machine_id).await else {
            return false;
        };

        if gateway.tx.send(Outbound::Frame(message)).await.is_err() {
            warn!(
                "Send failed, dropping connection machine_id={} connection_id={}",
                machine_id, gateway.connection_id
            );
            self.unregister(machine_id, gateway.connection_id).await;
            return false;
        }
        true
    }

    /// Fire-and-forget task dispatch.
    pub async fn send_task(
        &self,
        machine_id: Uuid,
        task_id: Uuid,
        queue_entry_id: i64,
        payload: Value,
    ) -> bool {
        self.send_message(
            machine_id,
            ServerMessage::Task {
                task_id,
                queue_entry_id,
                payload,
            },
        )
        .await
    }

    /// Deliver a frame to every connected gateway in an organization;
    /// returns how many sends succeeded. Partial failure is expected.
    pub async fn broadcast_to_organization(
        &self,
        organization_id: Uuid,
        message: ServerMessage,
    ) -> usize {
        let gateways = self.list_for_organization(organization_id).await;
        let mut sent = 0;
        for gateway in gateways {
            if self.send_message(gateway.machine_id, message.clone()).await {
                sent += 1;
            }
        }
        sent
    }

    /// Send a correlated request and suspend until its reply, the timeout,
    /// or cancellation. Every exit path removes the waiter entry.
    pub async fn send_and_await(
        &self,
        machine_id: Uuid,
        kind: RequestKind,
        payload: Value,
        timeout: Duration,
    ) -> Option<Value> {
        let gateway = self.get(machine_id).await?;

        let request_id = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        gateway
            .pending
            .lock()
            .await
            .insert(request_id.clone(), reply_tx);

        let frame = kind.into_frame(request_id.clone(), payload);
        if gateway.tx.send(Outbound::Frame(frame)).await.is_err() {
            gateway.pending.lock().await.remove(&request_id);
            self.unregister(machine_id, gateway.connection_id).await;
            return None;
        }

        let reply = match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(value)) => Some(value),
            // Sender dropped: the connection was unregistered mid-wait.
            Ok(Err(_)) => None,
            Err(_) => {
                debug!(
                    "Request timed out machine_id={} request_id={}",
                    machine_id, request_id
                );
                None
            }
        };

        gateway.pending.lock().await.remove(&request_id);
        reply
    }

    /// Complete the waiter for a correlation id, if one is still parked.
    /// Late or unmatched responses are dropped silently; only the first
    /// resolution per id is honored.
    pub async fn resolve(&self, machine_id: Uuid, request_id: &str, reply: Value) {
        let Some(gateway) = self.get(machine_id).await else {
            return;
        };

        let waiter = gateway.pending.lock().await.remove(request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(
                "Dropping unmatched response machine_id={} request_id={}",
                machine_id, request_id
            ),
        }
    }

    /// Bind a terminal session to a client-facing sender.
    pub async fn register_terminal_session(
        &self,
        machine_id: Uuid,
        session_id: &str,
        client_tx: mpsc::Sender<TerminalServerMessage>,
    ) {
        if let Some(gateway) = self.get(machine_id).await {
            gateway
                .terminals
                .lock()
                .await
                .insert(session_id.to_string(), client_tx);
        }
    }

    /// Remove a terminal binding. Idempotent; removing an absent binding is
    /// a no-op.
    pub async fn unregister_terminal_session(&self, machine_id: Uuid, session_id: &str) {
        if let Some(gateway) = self.get(machine_id).await {
            gateway.terminals.lock().await.remove(session_id);
        }
    }

    /// Relay gateway terminal output to the bound client. Output with no
    /// binding is dropped; a failed client write drops the binding.
    pub async fn relay_terminal_output(
        &self,
        machine_id: Uuid,
        session_id: &str,
        content: String,
    ) -> bool {
        let Some(gateway) = self.get(machine_id).await else {
            return false;
        };

        let client_tx = gateway.terminals.lock().await.get(session_id).cloned();
        let Some(client_tx) = client_tx else {
            return false;
        };

        if client_tx
            .send(TerminalServerMessage::Output { content })
            .await
            .is_err()
        {
            gateway.terminals.lock().await.remove(session_id);
            return false;
        }
        true
    }

    /// Aggregate snapshot, computed on demand.
    pub async fn stats(&self) -> BrokerStats {
        let gateways: Vec<Arc<ConnectedGateway>> =
            self.connections.read().await.values().cloned().collect();

        let mut total_agents_managed = 0;
        let mut terminal_sessions = 0;
        let mut organizations = HashSet::new();
        for gateway in &gateways {
            total_agents_managed += gateway.agents_managed().await;
            terminal_sessions += gateway.terminal_session_count().await;
            organizations.insert(gateway.organization_id);
        }

        BrokerStats {
            connected_gateways: gateways.len(),
            total_agents_managed,
            organizations: organizations.len(),
            terminal_sessions,
        }
    }
}

impl Default for GatewayBroker {
    fn default() -> Self {
        Self::new()
    }
}
