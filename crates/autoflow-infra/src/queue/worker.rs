//! Job worker: claims jobs from the SQLite queue and runs their handlers.
//!
//! Each poll tick recovers stale jobs, then claims jobs while execution slots
//! are free. Only bindings in the worker's registry are claimed; other jobs
//! stay pending for the workers that handle them. A job runs its registered
//! handler under the configured timeout; the outcome completes the job,
//! schedules a retry with backoff, or fails it. Panicking handlers fail their
//! job without retry.
//!
//! Coordinator jobs (forks) wait on jobs of this same queue. They are claimed
//! without taking an execution slot and run without the job timeout, so a
//! backlog of forks never starves their own children.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use autoflow_core::queue::handler::{BoxJobHandler, JobContext, JobError};
use autoflow_core::queue::registry::JobRegistry;
use autoflow_core::queue::retry::{RetryDecision, RetryPolicy};
use autoflow_types::config::QueueConfig;
use autoflow_types::error::QueueError;
use autoflow_types::queue::JobRecord;
use futures_util::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::sqlite::queue::SqliteTaskQueue;

/// What happened to a job after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Finished,
    Retrying,
    Failed,
    /// The claim expired and the job was requeued; the outcome was dropped.
    Lost,
}

/// Polls the queue and executes jobs with bounded concurrency.
#[derive(Clone)]
pub struct JobWorker {
    queue: Arc<SqliteTaskQueue>,
    registry: Arc<JobRegistry>,
    policy: RetryPolicy,
    config: QueueConfig,
    worker_id: String,
    /// Bindings run in the bounded slots.
    ordinary: Arc<[String]>,
    /// Bindings run outside the slots.
    coordinators: Arc<[String]>,
    /// Every registered binding.
    bindings: Arc<[String]>,
}

impl JobWorker {
    pub fn new(queue: Arc<SqliteTaskQueue>, registry: Arc<JobRegistry>, config: QueueConfig) -> Self {
        let (ordinary, coordinators) = registry.partition_bindings();
        let bindings: Vec<String> = registry.list_names().into_iter().map(str::to_string).collect();
        Self {
            queue,
            registry,
            policy: RetryPolicy::from_config(&config),
            config,
            worker_id: format!("worker-{}", Uuid::now_v7()),
            ordinary: ordinary.into(),
            coordinators: coordinators.into(),
            bindings: bindings.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until cancelled. In-flight jobs are aborted on shutdown; they stay
    /// `running` until stale recovery requeues them.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let slots = Arc::new(Semaphore::new(self.config.max_concurrent_jobs.max(1)));
        let mut tasks: JoinSet<()> = JoinSet::new();

        tracing::info!(
            worker_id = %self.worker_id,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            handlers = ?self.registry.list_names(),
            "job worker started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "job task aborted");
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.queue.requeue_stale(self.config.stale_after()).await {
                        tracing::warn!(error = %e, "stale job recovery failed");
                    }
                    self.fill(&slots, &mut tasks).await;
                }
            }
        }

        if !tasks.is_empty() {
            tracing::info!(in_flight = tasks.len(), "job worker stopping, aborting in-flight jobs");
        } else {
            tracing::info!("job worker stopping");
        }
        tasks.shutdown().await;
    }

    /// Claim every due coordinator job, then ordinary jobs while execution
    /// slots are free.
    async fn fill(&self, slots: &Arc<Semaphore>, tasks: &mut JoinSet<()>) {
        loop {
            match self.queue.claim_next(&self.worker_id, &self.coordinators).await {
                Ok(Some(job)) => self.spawn_job(tasks, job, None),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to claim coordinator job");
                    break;
                }
            }
        }

        loop {
            let Ok(permit) = Arc::clone(slots).try_acquire_owned() else {
                return;
            };
            match self.queue.claim_next(&self.worker_id, &self.ordinary).await {
                Ok(Some(job)) => self.spawn_job(tasks, job, Some(permit)),
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to claim job");
                    return;
                }
            }
        }
    }

    fn spawn_job(
        &self,
        tasks: &mut JoinSet<()>,
        job: JobRecord,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let this = self.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let job_id = job.id;
            if let Err(e) = this.execute(job).await {
                tracing::error!(%job_id, error = %e, "failed to record job outcome");
            }
        });
    }

    /// Run every claimable job one after another until none is due.
    /// Returns the number of attempts made.
    pub async fn drain(&self) -> Result<usize, QueueError> {
        let mut attempts = 0;
        while let Some(job) = self.queue.claim_next(&self.worker_id, &self.bindings).await? {
            self.execute(job).await?;
            attempts += 1;
        }
        Ok(attempts)
    }

    /// Run one claimed job and record its outcome.
    pub async fn execute(&self, job: JobRecord) -> Result<JobOutcome, QueueError> {
        let Some(handler) = self.registry.get(&job.binding).cloned() else {
            let message = format!("no handler registered for job '{}'", job.binding);
            tracing::warn!(job_id = %job.id, binding = %job.binding, "{message}");
            self.queue.fail_claimed(&job.id, &self.worker_id, &message).await?;
            return Ok(JobOutcome::Failed);
        };

        let ctx = JobContext {
            job_id: job.id,
            binding: job.binding.clone(),
            args: job.args.clone(),
            origin: job.origin,
            attempt: job.attempts,
        };

        tracing::debug!(job_id = %job.id, binding = %job.binding, attempt = job.attempts, "job started");
        let timeout = (!self.registry.is_coordinator(&job.binding)).then(|| self.config.job_timeout());
        let outcome = run_guarded(&handler, ctx, timeout).await;

        match outcome {
            Ok(result) => {
                if !self.queue.complete(&job.id, &self.worker_id, &result).await? {
                    tracing::warn!(job_id = %job.id, binding = %job.binding, "job claim lost, result dropped");
                    return Ok(JobOutcome::Lost);
                }
                tracing::info!(
                    job_id = %job.id,
                    binding = %job.binding,
                    selection = %result.selection,
                    attempt = job.attempts,
                    "job finished"
                );
                Ok(JobOutcome::Finished)
            }
            Err(error) => match self.policy.decide(job.attempts, &error) {
                RetryDecision::RetryAfter(delay) => {
                    if !self
                        .queue
                        .retry_later(&job.id, &self.worker_id, delay, &error.message)
                        .await?
                    {
                        return Ok(JobOutcome::Lost);
                    }
                    tracing::warn!(
                        job_id = %job.id,
                        binding = %job.binding,
                        attempt = job.attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %error,
                        "job failed, retrying"
                    );
                    Ok(JobOutcome::Retrying)
                }
                RetryDecision::GiveUp => {
                    if !self
                        .queue
                        .fail_claimed(&job.id, &self.worker_id, &error.message)
                        .await?
                    {
                        return Ok(JobOutcome::Lost);
                    }
                    tracing::warn!(
                        job_id = %job.id,
                        binding = %job.binding,
                        attempt = job.attempts,
                        retryable = error.retryable,
                        error = %error,
                        "job failed"
                    );
                    Ok(JobOutcome::Failed)
                }
            },
        }
    }
}

/// Run a handler, with a timeout when given, turning panics into fatal errors.
async fn run_guarded(
    handler: &BoxJobHandler,
    ctx: JobContext,
    timeout: Option<Duration>,
) -> Result<autoflow_types::queue::JobResult, JobError> {
    let guarded = AssertUnwindSafe(handler.run(ctx)).catch_unwind();
    let finished = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(finished) => finished,
            Err(_) => {
                return Err(JobError::retryable(format!(
                    "job timed out after {}s",
                    limit.as_secs()
                )));
            }
        },
        None => guarded.await,
    };
    finished.unwrap_or_else(|_| Err(JobError::fatal("job handler panicked")))
}
