//! Job handler trait and its object-safe wrapper.
//!
//! Handlers use RPITIT like the repository traits. Job workers need a
//! heterogeneous registry, so the usual blanket-impl pattern applies:
//! 1. `JobHandlerDyn` is an object-safe mirror with boxed futures
//! 2. every `T: JobHandler` implements it
//! 3. `BoxJobHandler` wraps `Box<dyn JobHandlerDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use autoflow_types::queue::{JobOrigin, JobResult};
use futures_util::future::BoxFuture;
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Context and error
// ---------------------------------------------------------------------------

/// Everything a handler receives about the job it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub binding: String,
    /// Resolved arguments.
    pub args: serde_json::Value,
    /// The node the job was dispatched for, if any.
    pub origin: Option<JobOrigin>,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl JobContext {
    /// String argument by key.
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(|v| v.as_str())
    }
}

/// Failure reported by a job handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct JobError {
    pub message: String,
    /// Whether the queue's retry policy applies.
    pub retryable: bool,
}

impl JobError {
    /// A failure worth retrying (I/O hiccup, busy resource).
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure retrying cannot fix (bad arguments, timeout already spent).
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

// ---------------------------------------------------------------------------
// JobHandler
// ---------------------------------------------------------------------------

/// Behaviour bound to a job name in a definition's `job:` field.
pub trait JobHandler: Send + Sync {
    /// Run the job. Called at least once per job; handlers with side effects
    /// must tolerate re-execution.
    fn run(
        &self,
        ctx: JobContext,
    ) -> impl std::future::Future<Output = Result<JobResult, JobError>> + Send;
}

/// Object-safe version of [`JobHandler`] with boxed futures.
pub trait JobHandlerDyn: Send + Sync {
    fn run_boxed(
        &self,
        ctx: JobContext,
    ) -> Pin<Box<dyn Future<Output = Result<JobResult, JobError>> + Send + '_>>;
}

impl<T: JobHandler> JobHandlerDyn for T {
    fn run_boxed(
        &self,
        ctx: JobContext,
    ) -> Pin<Box<dyn Future<Output = Result<JobResult, JobError>> + Send + '_>> {
        Box::pin(self.run(ctx))
    }
}

/// Type-erased job handler stored in the [`JobRegistry`](super::registry::JobRegistry).
#[derive(Clone)]
pub struct BoxJobHandler {
    inner: Arc<dyn JobHandlerDyn>,
}

impl BoxJobHandler {
    pub fn new<T: JobHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Arc::new(handler),
        }
    }

    pub async fn run(&self, ctx: JobContext) -> Result<JobResult, JobError> {
        self.inner.run_boxed(ctx).await
    }
}

impl std::fmt::Debug for BoxJobHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxJobHandler").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Closure handlers
// ---------------------------------------------------------------------------

/// Callback signature accepted by [`FnHandler`].
pub type JobFn =
    Arc<dyn Fn(JobContext) -> BoxFuture<'static, Result<JobResult, JobError>> + Send + Sync>;

/// Job handler backed by a closure.
#[derive(Clone)]
pub struct FnHandler {
    callback: JobFn,
}

impl FnHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JobResult, JobError>> + Send + 'static,
    {
        Self {
            callback: Arc::new(
                move |ctx| -> BoxFuture<'static, Result<JobResult, JobError>> { Box::pin(f(ctx)) },
            ),
        }
    }
}

impl JobHandler for FnHandler {
    async fn run(&self, ctx: JobContext) -> Result<JobResult, JobError> {
        (self.callback)(ctx).await
    }
}
