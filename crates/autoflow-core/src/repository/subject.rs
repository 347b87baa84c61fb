//! Subject lookup port.
//!
//! Subjects are domain entities (an episode, a profile) owned by an external
//! catalog. The engine only holds `{kind, id}` references and asks this
//! collaborator for the entity's fields when resolving `${subject.*}`.

use autoflow_types::workflow::SubjectRef;
use thiserror::Error;

/// Errors from subject lookups. Treated as transient by the scheduler.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("subject kind '{0}' is not supported")]
    UnsupportedKind(String),

    #[error("subject lookup failed: {0}")]
    Backend(String),
}

/// Fetches subject entity fields by kind.
pub trait SubjectLookup: Send + Sync {
    /// The entity's fields as a JSON object, or `None` if it no longer exists.
    fn fetch(
        &self,
        subject: &SubjectRef,
    ) -> impl std::future::Future<Output = Result<Option<serde_json::Value>, LookupError>> + Send;
}
