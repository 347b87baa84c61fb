//! Task queue port and job execution contracts.
//!
//! - `TaskQueue` -- the queue the engine enqueues node jobs on and polls
//! - `handler` -- the `JobHandler` trait implemented by job bindings
//! - `registry` -- binding name -> handler lookup used by job workers
//! - `retry` -- retry/backoff policy applied by queue implementations

pub mod handler;
pub mod registry;
pub mod retry;

use autoflow_types::error::QueueError;
use autoflow_types::queue::{JobHandle, JobRequest, JobResult, JobStatus};

/// Persisted job queue with status polling.
///
/// The engine never caches what these methods return; every sweep re-queries
/// the queue.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait TaskQueue: Send + Sync {
    /// Enqueue a job.
    ///
    /// Requests with an origin are idempotent per origin node: enqueueing the
    /// same node twice returns the first job's handle.
    fn enqueue(
        &self,
        request: &JobRequest,
    ) -> impl std::future::Future<Output = Result<JobHandle, QueueError>> + Send;

    /// Current state of a job.
    fn status(
        &self,
        handle: &JobHandle,
    ) -> impl std::future::Future<Output = Result<JobStatus, QueueError>> + Send;

    /// Result payload of a finished job; `None` in any other state.
    fn result(
        &self,
        handle: &JobHandle,
    ) -> impl std::future::Future<Output = Result<Option<JobResult>, QueueError>> + Send;

    /// Error message of a failed job; `None` in any other state.
    fn failure(
        &self,
        handle: &JobHandle,
    ) -> impl std::future::Future<Output = Result<Option<String>, QueueError>> + Send;
}
