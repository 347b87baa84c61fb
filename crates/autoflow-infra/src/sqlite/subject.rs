//! SQLite subject lookup.
//!
//! Stores snapshots of subject records (`{kind, id}` plus a JSON object of
//! fields) so `${subject.*}` references resolve without an external catalog.

use autoflow_core::repository::subject::{LookupError, SubjectLookup};
use autoflow_types::workflow::SubjectRef;
use chrono::Utc;
use sqlx::Row;

use super::format_datetime;
use super::pool::DatabasePool;

/// SQLite-backed implementation of `SubjectLookup`.
pub struct SqliteSubjectLookup {
    pool: DatabasePool,
}

impl SqliteSubjectLookup {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a subject's fields. `fields` must be a JSON object.
    pub async fn put(&self, subject: &SubjectRef, fields: &serde_json::Value) -> Result<(), LookupError> {
        if !fields.is_object() {
            return Err(LookupError::Backend(format!(
                "fields of {subject} must be a JSON object"
            )));
        }
        let fields = serde_json::to_string(fields).map_err(|e| LookupError::Backend(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO subjects (kind, id, fields, updated_at) VALUES (?, ?, ?, ?)
               ON CONFLICT(kind, id) DO UPDATE SET
                 fields = excluded.fields,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&subject.kind)
        .bind(&subject.id)
        .bind(&fields)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| LookupError::Backend(e.to_string()))?;

        tracing::debug!(subject = %subject, "subject stored");
        Ok(())
    }

    /// Remove a subject. Returns whether it existed.
    pub async fn remove(&self, subject: &SubjectRef) -> Result<bool, LookupError> {
        let result = sqlx::query("DELETE FROM subjects WHERE kind = ? AND id = ?")
            .bind(&subject.kind)
            .bind(&subject.id)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| LookupError::Backend(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }
}

impl SubjectLookup for SqliteSubjectLookup {
    async fn fetch(&self, subject: &SubjectRef) -> Result<Option<serde_json::Value>, LookupError> {
        let row = sqlx::query("SELECT fields FROM subjects WHERE kind = ? AND id = ?")
            .bind(&subject.kind)
            .bind(&subject.id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| LookupError::Backend(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let fields: String = row
            .try_get("fields")
            .map_err(|e| LookupError::Backend(e.to_string()))?;
        serde_json::from_str(&fields)
            .map(Some)
            .map_err(|e| LookupError::Backend(format!("invalid fields for {subject}: {e}")))
    }
}
