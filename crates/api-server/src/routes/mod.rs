//! Route handlers

pub mod agents;
pub mod gateway;
pub mod health;
pub mod machines;
pub mod tasks;
