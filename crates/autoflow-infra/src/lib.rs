//! Infrastructure layer for Autoflow.
//!
//! Contains implementations of the ports defined in `autoflow-core`: SQLite
//! storage for workflow chains, the persisted task queue and its job worker,
//! subject snapshots, config loading, and the [`runtime::Runtime`] that wires
//! them into a running engine.

pub mod config;
pub mod queue;
pub mod runtime;
pub mod sqlite;
