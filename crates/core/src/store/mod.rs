//! External collaborator surface for the gateway broker
//!
//! The broker treats persistence and token verification as collaborators it
//! calls into but does not own. `OpsStore` is that surface; `InMemoryStore`
//! is the implementation wired into the server binary and tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::Result;

pub use memory::InMemoryStore;

/// Identity resolved from a machine token during the gateway handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineContext {
    pub machine_id: Uuid,
    pub organization_id: Uuid,
    pub machine_name: String,
    pub scopes: Vec<String>,
}

/// A registered machine (one gateway daemon per machine)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    /// Sha256 hex digest of the machine token; the raw token is never stored.
    pub token_digest: String,
    pub created_at: DateTime<Utc>,
}

/// Raw token handed back exactly once at machine registration
#[derive(Debug, Clone, Serialize)]
pub struct IssuedMachineToken {
    pub machine_id: Uuid,
    pub token: String,
}

/// Connection-history row; `id` is the connection sequence number the broker
/// uses to correlate in-memory state with persisted history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConnection {
    pub id: i64,
    pub machine_id: Uuid,
    pub organization_id: Uuid,
    pub gateway_version: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub agents_managed: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Acknowledged,
    Dispatched,
    Completed,
}

/// One task assignment queued for dispatch to a specific machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub task_id: Uuid,
    pub machine_id: Uuid,
    pub status: QueueStatus,
    pub payload: Value,
    pub agent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// An autonomous agent hosted by some machine in an organization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub status: String,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// Persistence and identity collaborators consumed by the broker.
///
/// The broker calls these and trusts the results; it never reaches into the
/// backing store directly. Write failures are surfaced as `Error` and logged
/// by callers, they never tear down a connection by themselves.
#[async_trait]
pub trait OpsStore: Send + Sync {
    /// Verify a raw machine token; `None` rejects the handshake.
    async fn verify_machine_token(&self, raw_token: &str) -> Option<MachineContext>;

    /// Record a new gateway connection, returning the row with its sequence.
    async fn record_connect(
        &self,
        machine_id: Uuid,
        organization_id: Uuid,
        gateway_version: Option<&str>,
    ) -> Result<GatewayConnection>;

    /// Stamp `disconnected_at` on a connection row.
    async fn record_disconnect(&self, connection_id: i64) -> Result<()>;

    /// Persist a heartbeat for a connection row.
    async fn update_gateway_heartbeat(
        &self,
        connection_id: i64,
        agents_managed: Option<i64>,
    ) -> Result<()>;

    /// Queue entries still pending for a machine, oldest first.
    async fn pending_tasks(&self, machine_id: Uuid, limit: usize) -> Vec<QueueEntry>;

    /// Queue a task for dispatch to a machine.
    async fn enqueue_task(
        &self,
        machine_id: Uuid,
        task_id: Uuid,
        payload: Value,
    ) -> Result<QueueEntry>;

    /// Gateway acknowledged receipt of a queue entry.
    async fn acknowledge_task(&self, queue_entry_id: i64) -> Result<()>;

    /// Gateway handed the queue entry to a specific agent.
    async fn mark_task_dispatched(&self, queue_entry_id: i64, agent_id: Uuid) -> Result<()>;

    /// Agent finished the queue entry.
    async fn mark_task_completed(&self, queue_entry_id: i64) -> Result<()>;

    async fn get_agent(&self, agent_id: Uuid) -> Option<AgentRecord>;

    /// Update an agent's status and stamp its heartbeat time.
    async fn update_agent_status(&self, agent_id: Uuid, status: &str) -> Result<()>;

    async fn machine_name(&self, machine_id: Uuid) -> Option<String>;
}
