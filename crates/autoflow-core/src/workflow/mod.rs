//! Workflow engine core.
//!
//! - `definition` -- YAML parsing, validation, filesystem discovery
//! - `dag` -- static transition-graph checks (cycles, reachability)
//! - `store` -- the definition store consulted at execution time
//! - `resolver` -- `${source.path}` argument resolution
//! - `status` -- workflow status derivation from a node chain
//! - `engine` -- instance API (start/status/result) and node creation
//! - `scheduler` -- the transition sweep
//! - `fork` -- fork/join coordinator job

pub mod dag;
pub mod definition;
pub mod engine;
pub mod fork;
pub mod resolver;
pub mod scheduler;
pub mod status;
pub mod store;
