//! Shared domain types for Autoflow.
//!
//! This crate contains the types used across the engine: workflow and node
//! instances, workflow definition documents, task queue records, engine
//! configuration, and the storage-level error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod queue;
pub mod workflow;
