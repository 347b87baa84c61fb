//! Engine logic and port definitions for Autoflow.
//!
//! This crate defines the "ports" (repository, task queue, subject lookup
//! traits) that the infrastructure layer implements, plus the engine itself:
//! definition loading, argument resolution, the transition scheduler and the
//! fork/join coordinator. It depends only on `autoflow-types` -- never on
//! `autoflow-infra` or any database/IO crate.

pub mod queue;
pub mod repository;
pub mod workflow;
