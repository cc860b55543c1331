//! Core library for the ops platform gateway broker
//!
//! This crate contains the domain types shared between the broker and its
//! external collaborators:
//! - Machine/connection/queue records
//! - The `OpsStore` collaborator trait (token verification, connection
//!   history, task queue, agent status)
//! - An in-memory store implementation used by the server and tests

pub mod error;
pub mod store;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
