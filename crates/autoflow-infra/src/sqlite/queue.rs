//! SQLite-backed persisted task queue.
//!
//! Implements the `TaskQueue` port used by the engine plus the worker-side
//! operations (`claim_next`, `complete`, `retry_later`, `fail_claimed`,
//! `fail`, `requeue_stale`). Outcome writes from a worker only land while
//! that worker still holds the job's lock. A job moves `pending -> running -> finished | failed`;
//! a retried job goes back to `pending` with `run_after` pushed out by the
//! backoff delay.

use std::time::Duration;

use autoflow_core::queue::TaskQueue;
use autoflow_types::error::QueueError;
use autoflow_types::queue::{
    JobHandle, JobOrigin, JobRecord, JobRequest, JobResult, JobStatus,
};
use autoflow_types::workflow::DEFAULT_SELECTION;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_json, parse_uuid, to_json};

const JOB_COLUMNS: &str = "id, binding, args, origin_workflow_id, origin_node_id, status, \
     attempts, max_attempts, selection, output, error, run_after, locked_by, locked_at, \
     created_at, updated_at";

/// SQLite-backed implementation of `TaskQueue`.
#[derive(Clone)]
pub struct SqliteTaskQueue {
    pool: DatabasePool,
    max_attempts: u32,
}

fn storage_error(e: sqlx::Error) -> QueueError {
    QueueError::Storage(e.to_string())
}

fn shifted(at: DateTime<Utc>, delay: Duration, forward: bool) -> DateTime<Utc> {
    let shifted = chrono::Duration::from_std(delay).ok().and_then(|d| {
        if forward {
            at.checked_add_signed(d)
        } else {
            at.checked_sub_signed(d)
        }
    });
    shifted.unwrap_or(if forward {
        DateTime::<Utc>::MAX_UTC
    } else {
        DateTime::<Utc>::MIN_UTC
    })
}

impl SqliteTaskQueue {
    /// Create a queue; `max_attempts` is stamped on every enqueued job.
    pub fn new(pool: DatabasePool, max_attempts: u32) -> Self {
        Self {
            pool,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Full record of a job.
    pub async fn get_job(&self, handle: &JobHandle) -> Result<Option<JobRecord>, QueueError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(handle.id().to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(storage_error)?;

        match row {
            Some(row) => Ok(Some(JobRow::from_row(&row).map_err(storage_error)?.into_record()?)),
            None => Ok(None),
        }
    }

    /// Lock the oldest claimable job among `bindings` for `worker_id` and
    /// bump its attempt counter. Returns `None` when nothing is due. Jobs of
    /// other bindings stay pending for the workers that handle them.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        bindings: &[String],
    ) -> Result<Option<JobRecord>, QueueError> {
        if bindings.is_empty() {
            return Ok(None);
        }
        let placeholders = vec!["?"; bindings.len()].join(", ");
        let now = format_datetime(&Utc::now());
        let sql = format!(
            "UPDATE jobs SET status = 'running', attempts = attempts + 1, \
                 locked_by = ?, locked_at = ?, updated_at = ? \
             WHERE id = ( \
                 SELECT id FROM jobs WHERE status = 'pending' AND run_after <= ? \
                 AND binding IN ({placeholders}) \
                 ORDER BY run_after ASC, created_at ASC, id ASC LIMIT 1) \
             RETURNING {JOB_COLUMNS}"
        );
        let mut query = sqlx::query(&sql)
            .bind(worker_id)
            .bind(&now)
            .bind(&now)
            .bind(&now);
        for binding in bindings {
            query = query.bind(binding);
        }
        let row = query
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(storage_error)?;

        match row {
            Some(row) => Ok(Some(JobRow::from_row(&row).map_err(storage_error)?.into_record()?)),
            None => Ok(None),
        }
    }

    /// Finish a job `worker_id` holds with its result. Returns `false` if the
    /// claim was lost (requeued as stale, possibly re-claimed elsewhere).
    pub async fn complete(
        &self,
        job_id: &Uuid,
        worker_id: &str,
        result: &JobResult,
    ) -> Result<bool, QueueError> {
        let output = to_json("output", &result.data)?;
        let done = sqlx::query(
            "UPDATE jobs SET status = 'finished', selection = ?, output = ?, error = NULL, \
                 locked_by = NULL, locked_at = NULL, updated_at = ? \
             WHERE id = ? AND status = 'running' AND locked_by = ?",
        )
        .bind(&result.selection)
        .bind(&output)
        .bind(format_datetime(&Utc::now()))
        .bind(job_id.to_string())
        .bind(worker_id)
        .execute(&self.pool.writer)
        .await
        .map_err(storage_error)?;

        Ok(done.rows_affected() > 0)
    }

    /// Put a job `worker_id` holds back to `pending`, claimable after `delay`.
    pub async fn retry_later(
        &self,
        job_id: &Uuid,
        worker_id: &str,
        delay: Duration,
        error: &str,
    ) -> Result<bool, QueueError> {
        let now = Utc::now();
        let run_after = format_datetime(&shifted(now, delay, true));
        let done = sqlx::query(
            "UPDATE jobs SET status = 'pending', error = ?, run_after = ?, \
                 locked_by = NULL, locked_at = NULL, updated_at = ? \
             WHERE id = ? AND status = 'running' AND locked_by = ?",
        )
        .bind(error)
        .bind(&run_after)
        .bind(format_datetime(&now))
        .bind(job_id.to_string())
        .bind(worker_id)
        .execute(&self.pool.writer)
        .await
        .map_err(storage_error)?;

        Ok(done.rows_affected() > 0)
    }

    /// Fail a job `worker_id` holds.
    pub async fn fail_claimed(
        &self,
        job_id: &Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<bool, QueueError> {
        let done = sqlx::query(
            "UPDATE jobs SET status = 'failed', error = ?, \
                 locked_by = NULL, locked_at = NULL, updated_at = ? \
             WHERE id = ? AND status = 'running' AND locked_by = ?",
        )
        .bind(error)
        .bind(format_datetime(&Utc::now()))
        .bind(job_id.to_string())
        .bind(worker_id)
        .execute(&self.pool.writer)
        .await
        .map_err(storage_error)?;

        Ok(done.rows_affected() > 0)
    }

    /// Mark a job failed. Applies to pending and running jobs, so it doubles
    /// as the out-of-band way to cancel a node's job.
    pub async fn fail(&self, job_id: &Uuid, error: &str) -> Result<bool, QueueError> {
        let done = sqlx::query(
            "UPDATE jobs SET status = 'failed', error = ?, \
                 locked_by = NULL, locked_at = NULL, updated_at = ? \
             WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(error)
        .bind(format_datetime(&Utc::now()))
        .bind(job_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(storage_error)?;

        Ok(done.rows_affected() > 0)
    }

    /// Recover jobs left `running` by a worker that died.
    ///
    /// Jobs locked longer than `stale_after` go back to `pending`, or to
    /// `failed` once their attempts are used up. Returns `(requeued, failed)`.
    pub async fn requeue_stale(&self, stale_after: Duration) -> Result<(u64, u64), QueueError> {
        let now = Utc::now();
        let cutoff = format_datetime(&shifted(now, stale_after, false));
        let now = format_datetime(&now);

        let failed = sqlx::query(
            "UPDATE jobs SET status = 'failed', error = 'worker lost; attempts exhausted', \
                 locked_by = NULL, locked_at = NULL, updated_at = ? \
             WHERE status = 'running' AND locked_at < ? AND attempts >= max_attempts",
        )
        .bind(&now)
        .bind(&cutoff)
        .execute(&self.pool.writer)
        .await
        .map_err(storage_error)?
        .rows_affected();

        let requeued = sqlx::query(
            "UPDATE jobs SET status = 'pending', run_after = ?, \
                 locked_by = NULL, locked_at = NULL, updated_at = ? \
             WHERE status = 'running' AND locked_at < ?",
        )
        .bind(&now)
        .bind(&now)
        .bind(&cutoff)
        .execute(&self.pool.writer)
        .await
        .map_err(storage_error)?
        .rows_affected();

        if requeued + failed > 0 {
            tracing::warn!(requeued, failed, "recovered stale jobs");
        }
        Ok((requeued, failed))
    }

    /// Number of jobs per status.
    pub async fn counts(&self) -> Result<Vec<(JobStatus, u64)>, QueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status ORDER BY status")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(storage_error)?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in &rows {
            let status: String = row.try_get("status").map_err(storage_error)?;
            let n: i64 = row.try_get("n").map_err(storage_error)?;
            let status = status.parse::<JobStatus>().map_err(QueueError::Storage)?;
            counts.push((status, u64::try_from(n).unwrap_or(0)));
        }
        Ok(counts)
    }

    async fn job_by_origin(&self, node_instance_id: &Uuid) -> Result<Option<JobHandle>, QueueError> {
        let row = sqlx::query("SELECT id FROM jobs WHERE origin_node_id = ?")
            .bind(node_instance_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(storage_error)?;

        match row {
            Some(row) => {
                let id: String = row.try_get("id").map_err(storage_error)?;
                Ok(Some(JobHandle(parse_uuid(&id)?)))
            }
            None => Ok(None),
        }
    }

    /// Status plus the raw outcome columns of a job.
    async fn outcome(&self, handle: &JobHandle) -> Result<JobOutcomeRow, QueueError> {
        let row = sqlx::query("SELECT status, selection, output, error FROM jobs WHERE id = ?")
            .bind(handle.id().to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| QueueError::NotFound(handle.to_string()))?;

        let status: String = row.try_get("status").map_err(storage_error)?;
        Ok(JobOutcomeRow {
            status: status.parse().map_err(QueueError::Storage)?,
            selection: row.try_get("selection").map_err(storage_error)?,
            output: row.try_get("output").map_err(storage_error)?,
            error: row.try_get("error").map_err(storage_error)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct JobOutcomeRow {
    status: JobStatus,
    selection: Option<String>,
    output: Option<String>,
    error: Option<String>,
}

struct JobRow {
    id: String,
    binding: String,
    args: String,
    origin_workflow_id: Option<String>,
    origin_node_id: Option<String>,
    status: String,
    attempts: i64,
    max_attempts: i64,
    selection: Option<String>,
    output: Option<String>,
    error: Option<String>,
    run_after: String,
    locked_by: Option<String>,
    locked_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            binding: row.try_get("binding")?,
            args: row.try_get("args")?,
            origin_workflow_id: row.try_get("origin_workflow_id")?,
            origin_node_id: row.try_get("origin_node_id")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            selection: row.try_get("selection")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            run_after: row.try_get("run_after")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get("locked_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<JobRecord, QueueError> {
        let origin = match (self.origin_workflow_id, self.origin_node_id) {
            (Some(workflow_id), Some(node_id)) => Some(JobOrigin {
                workflow_id: parse_uuid(&workflow_id)?,
                node_instance_id: parse_uuid(&node_id)?,
            }),
            _ => None,
        };
        let status: JobStatus = self.status.parse().map_err(QueueError::Storage)?;
        let result = match status {
            JobStatus::Finished => Some(JobResult {
                selection: self
                    .selection
                    .unwrap_or_else(|| DEFAULT_SELECTION.to_string()),
                data: match self.output.as_deref() {
                    Some(s) => parse_json("output", s)?,
                    None => serde_json::Value::Null,
                },
            }),
            _ => None,
        };

        Ok(JobRecord {
            id: parse_uuid(&self.id)?,
            binding: self.binding,
            args: parse_json("args", &self.args)?,
            origin,
            status,
            attempts: u32::try_from(self.attempts).unwrap_or(0),
            max_attempts: u32::try_from(self.max_attempts).unwrap_or(1),
            result,
            error: self.error,
            run_after: parse_datetime(&self.run_after)?,
            locked_by: self.locked_by,
            locked_at: self.locked_at.as_deref().map(parse_datetime).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// TaskQueue impl
// ---------------------------------------------------------------------------

impl TaskQueue for SqliteTaskQueue {
    async fn enqueue(&self, request: &JobRequest) -> Result<JobHandle, QueueError> {
        let args = to_json("args", &request.args)?;
        let id = Uuid::now_v7();
        let now = format_datetime(&Utc::now());

        let inserted = sqlx::query(
            r#"INSERT INTO jobs
               (id, binding, args, origin_workflow_id, origin_node_id, status, attempts,
                max_attempts, run_after, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?, ?)
               ON CONFLICT(origin_node_id) DO NOTHING"#,
        )
        .bind(id.to_string())
        .bind(&request.binding)
        .bind(&args)
        .bind(request.origin.map(|o| o.workflow_id.to_string()))
        .bind(request.origin.map(|o| o.node_instance_id.to_string()))
        .bind(i64::from(self.max_attempts))
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(storage_error)?;

        if inserted.rows_affected() > 0 {
            tracing::debug!(job_id = %id, binding = %request.binding, "job enqueued");
            return Ok(JobHandle(id));
        }

        let origin = request
            .origin
            .ok_or_else(|| QueueError::Storage(format!("job {id} could not be inserted")))?;
        self.job_by_origin(&origin.node_instance_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(format!("job for node {}", origin.node_instance_id)))
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus, QueueError> {
        Ok(self.outcome(handle).await?.status)
    }

    async fn result(&self, handle: &JobHandle) -> Result<Option<JobResult>, QueueError> {
        let outcome = self.outcome(handle).await?;
        if outcome.status != JobStatus::Finished {
            return Ok(None);
        }
        let data = match outcome.output.as_deref() {
            Some(s) => parse_json("output", s)?,
            None => serde_json::Value::Null,
        };
        Ok(Some(JobResult {
            selection: outcome
                .selection
                .unwrap_or_else(|| DEFAULT_SELECTION.to_string()),
            data,
        }))
    }

    async fn failure(&self, handle: &JobHandle) -> Result<Option<String>, QueueError> {
        let outcome = self.outcome(handle).await?;
        Ok(match outcome.status {
            JobStatus::Failed => Some(outcome.error.unwrap_or_else(|| "job failed".to_string())),
            _ => None,
        })
    }
}
