//! Error types for the core library

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Machine not found: {0}")]
    MachineNotFound(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(i64),

    #[error("Queue entry not found: {0}")]
    QueueEntryNotFound(i64),

    #[error("Invalid token")]
    InvalidToken,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Storage(String),
}
