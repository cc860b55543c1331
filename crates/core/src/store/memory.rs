//! In-memory `OpsStore` implementation

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    AgentRecord, GatewayConnection, IssuedMachineToken, MachineContext, MachineRecord, OpsStore,
    QueueEntry, QueueStatus,
};
use crate::{Error, Result};

#[derive(Default)]
struct StoreState {
    machines: HashMap<Uuid, MachineRecord>,
    agents: HashMap<Uuid, AgentRecord>,
    connections: HashMap<i64, GatewayConnection>,
    queue: HashMap<i64, QueueEntry>,
    next_connection_id: i64,
    next_queue_id: i64,
}

/// In-memory backing store keyed the way the relational schema is keyed.
///
/// Machine tokens are stored as Sha256 hex digests; verification hashes the
/// presented token and scans for the matching machine.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

fn token_digest(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

fn generate_machine_token() -> String {
    let mut bytes = [0_u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("mt_{}", hex::encode(bytes))
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a machine and issue its token. The raw token is returned
    /// exactly once; only the digest is retained.
    pub async fn register_machine(
        &self,
        organization_id: Uuid,
        name: &str,
    ) -> Result<IssuedMachineToken> {
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("machine name is required".to_string()));
        }

        let token = generate_machine_token();
        let machine = MachineRecord {
            id: Uuid::new_v4(),
            organization_id,
            name: name.trim().to_string(),
            token_digest: token_digest(&token),
            created_at: Utc::now(),
        };

        let mut state = self.state.write().await;
        let machine_id = machine.id;
        state.machines.insert(machine_id, machine);

        Ok(IssuedMachineToken { machine_id, token })
    }

    /// Register an agent under an organization.
    pub async fn register_agent(&self, organization_id: Uuid, name: &str) -> Result<AgentRecord> {
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("agent name is required".to_string()));
        }

        let agent = AgentRecord {
            id: Uuid::new_v4(),
            organization_id,
            name: name.trim().to_string(),
            status: "offline".to_string(),
            last_heartbeat_at: None,
        };

        let mut state = self.state.write().await;
        state.agents.insert(agent.id, agent.clone());
        Ok(agent)
    }

    pub async fn get_queue_entry(&self, queue_entry_id: i64) -> Option<QueueEntry> {
        self.state.read().await.queue.get(&queue_entry_id).cloned()
    }

    pub async fn get_connection(&self, connection_id: i64) -> Option<GatewayConnection> {
        self.state
            .read()
            .await
            .connections
            .get(&connection_id)
            .cloned()
    }
}

#[async_trait]
impl OpsStore for InMemoryStore {
    async fn verify_machine_token(&self, raw_token: &str) -> Option<MachineContext> {
        let digest = token_digest(raw_token);
        let state = self.state.read().await;
        state
            .machines
            .values()
            .find(|m| m.token_digest == digest)
            .map(|m| MachineContext {
                machine_id: m.id,
                organization_id: m.organization_id,
                machine_name: m.name.clone(),
                scopes: vec!["gateway:connect".to_string()],
            })
    }

    async fn record_connect(
        &self,
        machine_id: Uuid,
        organization_id: Uuid,
        gateway_version: Option<&str>,
    ) -> Result<GatewayConnection> {
        let mut state = self.state.write().await;
        state.next_connection_id += 1;
        let connection = GatewayConnection {
            id: state.next_connection_id,
            machine_id,
            organization_id,
            gateway_version: gateway_version.map(str::to_string),
            connected_at: Utc::now(),
            disconnected_at: None,
            last_heartbeat_at: None,
            agents_managed: 0,
        };
        state.connections.insert(connection.id, connection.clone());
        Ok(connection)
    }

    async fn record_disconnect(&self, connection_id: i64) -> Result<()> {
        let mut state = self.state.write().await;
        let connection = state
            .connections
            .get_mut(&connection_id)
            .ok_or(Error::ConnectionNotFound(connection_id))?;
        connection.disconnected_at = Some(Utc::now());
        Ok(())
    }

    async fn update_gateway_heartbeat(
        &self,
        connection_id: i64,
        agents_managed: Option<i64>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let connection = state
            .connections
            .get_mut(&connection_id)
            .ok_or(Error::ConnectionNotFound(connection_id))?;
        connection.last_heartbeat_at = Some(Utc::now());
        if let Some(count) = agents_managed {
            connection.agents_managed = count;
        }
        Ok(())
    }

    async fn pending_tasks(&self, machine_id: Uuid, limit: usize) -> Vec<QueueEntry> {
        let state = self.state.read().await;
        let mut entries: Vec<QueueEntry> = state
            .queue
            .values()
            .filter(|e| e.machine_id == machine_id && e.status == QueueStatus::Pending)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.id);
        entries.truncate(limit);
        entries
    }

    async fn enqueue_task(
        &self,
        machine_id: Uuid,
        task_id: Uuid,
        payload: Value,
    ) -> Result<QueueEntry> {
        let mut state = self.state.write().await;
        state.next_queue_id += 1;
        let entry = QueueEntry {
            id: state.next_queue_id,
            task_id,
            machine_id,
            status: QueueStatus::Pending,
            payload,
            agent_id: None,
            created_at: Utc::now(),
            acknowledged_at: None,
            dispatched_at: None,
            completed_at: None,
        };
        state.queue.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn acknowledge_task(&self, queue_entry_id: i64) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .queue
            .get_mut(&queue_entry_id)
            .ok_or(Error::QueueEntryNotFound(queue_entry_id))?;
        entry.status = QueueStatus::Acknowledged;
        entry.acknowledged_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_task_dispatched(&self, queue_entry_id: i64, agent_id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .queue
            .get_mut(&queue_entry_id)
            .ok_or(Error::QueueEntryNotFound(queue_entry_id))?;
        entry.status = QueueStatus::Dispatched;
        entry.agent_id = Some(agent_id);
        entry.dispatched_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_task_completed(&self, queue_entry_id: i64) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .queue
            .get_mut(&queue_entry_id)
            .ok_or(Error::QueueEntryNotFound(queue_entry_id))?;
        entry.status = QueueStatus::Completed;
        entry.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn get_agent(&self, agent_id: Uuid) -> Option<AgentRecord> {
        self.state.read().await.agents.get(&agent_id).cloned()
    }

    async fn update_agent_status(&self, agent_id: Uuid, status: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let agent = state
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))?;
        agent.status = status.to_string();
        agent.last_heartbeat_at = Some(Utc::now());
        Ok(())
    }

    async fn machine_name(&self, machine_id: Uuid) -> Option<String> {
        self.state
            .read()
            .await
            .machines
            .get(&machine_id)
            .map(|m| m.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn verifies_issued_token() {
        let store = InMemoryStore::new();
        let org_id = Uuid::new_v4();

        let issued = store.register_machine(org_id, "build-box").await.unwrap();
        let ctx = store.verify_machine_token(&issued.token).await.unwrap();

        assert_eq!(ctx.machine_id, issued.machine_id);
        assert_eq!(ctx.organization_id, org_id);
        assert_eq!(ctx.machine_name, "build-box");
    }

    #[tokio::test]
    async fn rejects_unknown_token() {
        let store = InMemoryStore::new();
        assert!(store.verify_machine_token("mt_bogus").await.is_none());
    }

    #[tokio::test]
    async fn connection_rows_get_increasing_sequence() {
        let store = InMemoryStore::new();
        let machine_id = Uuid::new_v4();
        let org_id = Uuid::new_v4();

        let first = store
            .record_connect(machine_id, org_id, Some("1.0.0"))
            .await
            .unwrap();
        let second = store
            .record_connect(machine_id, org_id, Some("1.0.1"))
            .await
            .unwrap();

        assert!(second.id > first.id);

        store.record_disconnect(first.id).await.unwrap();
        let row = store.get_connection(first.id).await.unwrap();
        assert!(row.disconnected_at.is_some());
    }

    #[tokio::test]
    async fn queue_lifecycle_transitions() {
        let store = InMemoryStore::new();
        let machine_id = Uuid::new_v4();
        let agent_id = Uuid::new_v4();

        let entry = store
            .enqueue_task(machine_id, Uuid::new_v4(), json!({"objective": "triage"}))
            .await
            .unwrap();

        let pending = store.pending_tasks(machine_id, 10).await;
        assert_eq!(pending.len(), 1);

        store.acknowledge_task(entry.id).await.unwrap();
        store.mark_task_dispatched(entry.id, agent_id).await.unwrap();
        store.mark_task_completed(entry.id).await.unwrap();

        let done = store.get_queue_entry(entry.id).await.unwrap();
        assert_eq!(done.status, QueueStatus::Completed);
        assert_eq!(done.agent_id, Some(agent_id));
        assert!(store.pending_tasks(machine_id, 10).await.is_empty());
    }

    #[tokio::test]
    async fn pending_tasks_respects_limit_and_order() {
        let store = InMemoryStore::new();
        let machine_id = Uuid::new_v4();

        for i in 0..5 {
            store
                .enqueue_task(machine_id, Uuid::new_v4(), json!({ "n": i }))
                .await
                .unwrap();
        }

        let pending = store.pending_tasks(machine_id, 3).await;
        assert_eq!(pending.len(), 3);
        assert!(pending.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn agent_status_updates_stamp_heartbeat() {
        let store = InMemoryStore::new();
        let agent = store
            .register_agent(Uuid::new_v4(), "scout")
            .await
            .unwrap();
        assert!(agent.last_heartbeat_at.is_none());

        store.update_agent_status(agent.id, "busy").await.unwrap();
        let updated = store.get_agent(agent.id).await.unwrap();
        assert_eq!(updated.status, "busy");
        assert!(updated.last_heartbeat_at.is_some());
    }
}
