//! Task queue execution.
//!
//! The queue itself lives in `sqlite::queue`; this module runs its jobs.

pub mod worker;
