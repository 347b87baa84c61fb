//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `autoflow-core` using sqlx with split
//! read/write pools. Node chains are rows linked through `parent_node_id` /
//! `child_node_id`; the partial unique index on unlinked nodes keeps a single
//! frontier per workflow even if a conditional update is ever bypassed.

use autoflow_core::repository::workflow::{ClaimOutcome, WorkflowRepository, order_chain};
use autoflow_types::error::RepositoryError;
use autoflow_types::queue::JobHandle;
use autoflow_types::workflow::{
    NodeData, NodeError, NodeInstance, SubjectRef, WorkflowInstance,
};
use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_json, parse_uuid, query_error, to_json};

const WORKFLOW_COLUMNS: &str = "id, definition_id, subject_kind, subject_id, args, \
     parent_workflow_id, reservation, created_at";

const NODE_COLUMNS: &str = "id, workflow_id, node_id, parent_node_id, child_node_id, \
     reservation, job_id, input, output, selection, error_details, terminal, halted, \
     created_at, updated_at";

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn workflow_by_reservation(
        &self,
        reservation: &str,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE reservation = ?");
        let row = sqlx::query(&sql)
            .bind(reservation)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        row.map(|r| WorkflowRow::from_row(&r).map_err(query_error)?.into_workflow())
            .transpose()
    }

    async fn node_by_reservation(
        &self,
        reservation: &str,
    ) -> Result<Option<NodeInstance>, RepositoryError> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE reservation = ?");
        let row = sqlx::query(&sql)
            .bind(reservation)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        row.map(|r| NodeRow::from_row(&r).map_err(query_error)?.into_node())
            .transpose()
    }

    /// The node linked as `parent_id`'s successor, if any.
    async fn successor_of(&self, parent_id: &Uuid) -> Result<Option<NodeInstance>, RepositoryError> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes \
             WHERE id = (SELECT child_node_id FROM nodes WHERE id = ?)"
        );
        let row = sqlx::query(&sql)
            .bind(parent_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        row.map(|r| NodeRow::from_row(&r).map_err(query_error)?.into_node())
            .transpose()
    }

    async fn fetch_workflows(
        &self,
        sql: &str,
        binds: &[String],
        limit: Option<u32>,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(value);
        }
        if let Some(limit) = limit {
            query = query.bind(i64::from(limit));
        }
        let rows = query
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut workflows = Vec::with_capacity(rows.len());
        for row in &rows {
            workflows.push(WorkflowRow::from_row(row).map_err(query_error)?.into_workflow()?);
        }
        Ok(workflows)
    }

    async fn fetch_nodes(
        &self,
        sql: &str,
        bind: Option<String>,
        limit: Option<u32>,
    ) -> Result<Vec<NodeInstance>, RepositoryError> {
        let mut query = sqlx::query(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        if let Some(limit) = limit {
            query = query.bind(i64::from(limit));
        }
        let rows = query
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut nodes = Vec::with_capacity(rows.len());
        for row in &rows {
            nodes.push(NodeRow::from_row(row).map_err(query_error)?.into_node()?);
        }
        Ok(nodes)
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowRow {
    id: String,
    definition_id: String,
    subject_kind: Option<String>,
    subject_id: Option<String>,
    args: String,
    parent_workflow_id: Option<String>,
    reservation: Option<String>,
    created_at: String,
}

impl WorkflowRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            definition_id: row.try_get("definition_id")?,
            subject_kind: row.try_get("subject_kind")?,
            subject_id: row.try_get("subject_id")?,
            args: row.try_get("args")?,
            parent_workflow_id: row.try_get("parent_workflow_id")?,
            reservation: row.try_get("reservation")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_workflow(self) -> Result<WorkflowInstance, RepositoryError> {
        let subject = match (self.subject_kind, self.subject_id) {
            (Some(kind), Some(id)) => Some(SubjectRef { kind, id }),
            _ => None,
        };
        Ok(WorkflowInstance {
            id: parse_uuid(&self.id)?,
            definition_id: self.definition_id,
            subject,
            args: parse_json("args", &self.args)?,
            parent_workflow_id: self.parent_workflow_id.as_deref().map(parse_uuid).transpose()?,
            reservation: self.reservation,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct NodeRow {
    id: String,
    workflow_id: String,
    node_id: String,
    parent_node_id: Option<String>,
    child_node_id: Option<String>,
    reservation: String,
    job_id: Option<String>,
    input: Option<String>,
    output: Option<String>,
    selection: Option<String>,
    error_details: Option<String>,
    terminal: bool,
    halted: bool,
    created_at: String,
    updated_at: String,
}

impl NodeRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            node_id: row.try_get("node_id")?,
            parent_node_id: row.try_get("parent_node_id")?,
            child_node_id: row.try_get("child_node_id")?,
            reservation: row.try_get("reservation")?,
            job_id: row.try_get("job_id")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            selection: row.try_get("selection")?,
            error_details: row.try_get("error_details")?,
            terminal: row.try_get("terminal")?,
            halted: row.try_get("halted")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_node(self) -> Result<NodeInstance, RepositoryError> {
        Ok(NodeInstance {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            node_id: self.node_id,
            parent_node_id: self.parent_node_id.as_deref().map(parse_uuid).transpose()?,
            child_node_id: self.child_node_id.as_deref().map(parse_uuid).transpose()?,
            reservation: self.reservation,
            job: self
                .job_id
                .as_deref()
                .map(|s| parse_uuid(s).map(JobHandle))
                .transpose()?,
            data: NodeData {
                input: self.input.as_deref().map(|s| parse_json("input", s)).transpose()?,
                output: self.output.as_deref().map(|s| parse_json("output", s)).transpose()?,
            },
            selection: self.selection,
            error_details: self
                .error_details
                .as_deref()
                .map(|s| parse_json("error_details", s))
                .transpose()?,
            terminal: self.terminal,
            halted: self.halted,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

/// Column values of a node about to be inserted.
struct NodeInsert {
    input: Option<String>,
    error_details: Option<String>,
}

impl NodeInsert {
    fn encode(node: &NodeInstance) -> Result<Self, RepositoryError> {
        Ok(Self {
            input: node.data.input.as_ref().map(|v| to_json("input", v)).transpose()?,
            error_details: node
                .error_details
                .as_ref()
                .map(|e| to_json("error_details", e))
                .transpose()?,
        })
    }
}

const INSERT_NODE: &str = r#"INSERT INTO nodes
    (id, workflow_id, node_id, parent_node_id, child_node_id, reservation, job_id,
     input, output, selection, error_details, terminal, halted, created_at, updated_at)
    VALUES (?, ?, ?, ?, NULL, ?, NULL, ?, NULL, NULL, ?, ?, 0, ?, ?)
    ON CONFLICT DO NOTHING"#;

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn create_workflow(
        &self,
        workflow: &WorkflowInstance,
    ) -> Result<WorkflowInstance, RepositoryError> {
        let args = to_json("args", &workflow.args)?;
        let (subject_kind, subject_id) = match &workflow.subject {
            Some(s) => (Some(s.kind.as_str()), Some(s.id.as_str())),
            None => (None, None),
        };

        let result = sqlx::query(
            r#"INSERT INTO workflows
               (id, definition_id, subject_kind, subject_id, args, parent_workflow_id,
                reservation, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT DO NOTHING"#,
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.definition_id)
        .bind(subject_kind)
        .bind(subject_id)
        .bind(&args)
        .bind(workflow.parent_workflow_id.map(|id| id.to_string()))
        .bind(&workflow.reservation)
        .bind(format_datetime(&workflow.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() > 0 {
            return Ok(workflow.clone());
        }

        if let Some(reservation) = &workflow.reservation
            && let Some(existing) = self.workflow_by_reservation(reservation).await?
        {
            return Ok(existing);
        }
        Err(RepositoryError::Conflict(format!(
            "workflow {} already exists",
            workflow.id
        )))
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?");
        Ok(self
            .fetch_workflows(&sql, &[id.to_string()], None)
            .await?
            .into_iter()
            .next())
    }

    async fn list_children(&self, parent_id: &Uuid) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let sql = format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE parent_workflow_id = ? \
             ORDER BY created_at ASC, id ASC"
        );
        self.fetch_workflows(&sql, &[parent_id.to_string()], None)
            .await
    }

    async fn list_unstarted(&self, limit: u32) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let sql = format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows w \
             WHERE NOT EXISTS (SELECT 1 FROM nodes n WHERE n.workflow_id = w.id) \
             ORDER BY created_at ASC, id ASC LIMIT ?"
        );
        self.fetch_workflows(&sql, &[], Some(limit)).await
    }

    async fn create_root_node(&self, node: &NodeInstance) -> Result<ClaimOutcome, RepositoryError> {
        let encoded = NodeInsert::encode(node)?;
        let now = format_datetime(&node.created_at);

        let result = sqlx::query(INSERT_NODE)
            .bind(node.id.to_string())
            .bind(node.workflow_id.to_string())
            .bind(&node.node_id)
            .bind(None::<String>)
            .bind(&node.reservation)
            .bind(&encoded.input)
            .bind(&encoded.error_details)
            .bind(node.terminal)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        if result.rows_affected() > 0 {
            let mut created = node.clone();
            created.parent_node_id = None;
            created.child_node_id = None;
            return Ok(ClaimOutcome::Created(created));
        }

        match self.node_by_reservation(&node.reservation).await? {
            Some(existing) => Ok(ClaimOutcome::Existing(existing)),
            None => Err(RepositoryError::Conflict(format!(
                "workflow {} already has a root node",
                node.workflow_id
            ))),
        }
    }

    async fn claim_and_advance(
        &self,
        parent_id: &Uuid,
        child: &NodeInstance,
    ) -> Result<ClaimOutcome, RepositoryError> {
        let encoded = NodeInsert::encode(child)?;
        let now = format_datetime(&Utc::now());
        let created_at = format_datetime(&child.created_at);

        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        // Writing first takes the write lock before anything is read.
        let linked = sqlx::query(
            "UPDATE nodes SET child_node_id = ?, updated_at = ? \
             WHERE id = ? AND child_node_id IS NULL",
        )
        .bind(child.id.to_string())
        .bind(&now)
        .bind(parent_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        if linked.rows_affected() == 0 {
            tx.rollback().await.map_err(query_error)?;
            return match self.successor_of(parent_id).await? {
                Some(winner) => Ok(ClaimOutcome::Existing(winner)),
                None => Err(RepositoryError::NotFound),
            };
        }

        let inserted = sqlx::query(INSERT_NODE)
            .bind(child.id.to_string())
            .bind(child.workflow_id.to_string())
            .bind(&child.node_id)
            .bind(parent_id.to_string())
            .bind(&child.reservation)
            .bind(&encoded.input)
            .bind(&encoded.error_details)
            .bind(child.terminal)
            .bind(&created_at)
            .bind(&created_at)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(query_error)?;
            return Err(RepositoryError::Conflict(format!(
                "reservation '{}' is held by a node outside this chain",
                child.reservation
            )));
        }

        tx.commit().await.map_err(query_error)?;

        let mut created = child.clone();
        created.parent_node_id = Some(*parent_id);
        created.child_node_id = None;
        Ok(ClaimOutcome::Created(created))
    }

    async fn attach_job(&self, node_id: &Uuid, job: &JobHandle) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE nodes SET job_id = ?, updated_at = ? WHERE id = ? AND job_id IS NULL",
        )
        .bind(job.id().to_string())
        .bind(format_datetime(&Utc::now()))
        .bind(node_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_outcome(
        &self,
        node_id: &Uuid,
        selection: &str,
        output: Option<&serde_json::Value>,
    ) -> Result<(), RepositoryError> {
        let output = output.map(|v| to_json("output", v)).transpose()?;

        sqlx::query(
            "UPDATE nodes SET selection = ?, output = COALESCE(?, output), updated_at = ? \
             WHERE id = ? AND selection IS NULL",
        )
        .bind(selection)
        .bind(&output)
        .bind(format_datetime(&Utc::now()))
        .bind(node_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn record_failure(&self, node_id: &Uuid, error: &NodeError) -> Result<(), RepositoryError> {
        let details = to_json("error_details", error)?;

        sqlx::query(
            "UPDATE nodes SET error_details = ?, updated_at = ? \
             WHERE id = ? AND error_details IS NULL",
        )
        .bind(&details)
        .bind(format_datetime(&Utc::now()))
        .bind(node_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn halt_node(&self, node_id: &Uuid) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE nodes SET halted = 1, updated_at = ? WHERE id = ? AND halted = 0")
            .bind(format_datetime(&Utc::now()))
            .bind(node_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(())
    }

    async fn get_node(&self, id: &Uuid) -> Result<Option<NodeInstance>, RepositoryError> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?");
        Ok(self
            .fetch_nodes(&sql, Some(id.to_string()), None)
            .await?
            .into_iter()
            .next())
    }

    async fn list_chain(&self, workflow_id: &Uuid) -> Result<Vec<NodeInstance>, RepositoryError> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE workflow_id = ? ORDER BY created_at ASC, id ASC"
        );
        let nodes = self
            .fetch_nodes(&sql, Some(workflow_id.to_string()), None)
            .await?;
        Ok(order_chain(nodes))
    }

    async fn list_frontier_candidates(&self, limit: u32) -> Result<Vec<NodeInstance>, RepositoryError> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes \
             WHERE child_node_id IS NULL AND halted = 0 \
               AND (selection IS NULL OR terminal = 0) \
             ORDER BY updated_at ASC, id ASC LIMIT ?"
        );
        self.fetch_nodes(&sql, None, Some(limit)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoflow_types::workflow::NodeErrorKind;
    use serde_json::json;
    use std::sync::Arc;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        // Leak tempdir so it lives for the test
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn sample_workflow() -> WorkflowInstance {
        let mut args = serde_json::Map::new();
        args.insert("path".to_string(), json!("/media/ep5.mkv"));
        WorkflowInstance::new("transcode_episode", Some(SubjectRef::new("episode", "42")), args)
    }

    fn node_for(workflow: &WorkflowInstance, node_id: &str, parent: Option<&NodeInstance>) -> NodeInstance {
        let now = Utc::now();
        NodeInstance {
            id: Uuid::now_v7(),
            workflow_id: workflow.id,
            node_id: node_id.to_string(),
            parent_node_id: parent.map(|p| p.id),
            child_node_id: None,
            reservation: parent
                .map(NodeInstance::successor_reservation)
                .unwrap_or_else(|| workflow.root_reservation()),
            job: None,
            data: NodeData {
                input: Some(json!({ "path": "/media/ep5.mkv" })),
                output: None,
            },
            selection: None,
            error_details: None,
            terminal: false,
            halted: false,
            created_at: now,
            updated_at: now,
        }
    }

    async fn repo_with_workflow() -> (SqliteWorkflowRepository, WorkflowInstance) {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let wf = sample_workflow();
        repo.create_workflow(&wf).await.unwrap();
        (repo, wf)
    }

    #[tokio::test]
    async fn test_create_and_get_workflow() {
        let (repo, wf) = repo_with_workflow().await;

        let loaded = repo.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.definition_id, "transcode_episode");
        assert_eq!(loaded.subject, Some(SubjectRef::new("episode", "42")));
        assert_eq!(loaded.args["path"], json!("/media/ep5.mkv"));
        assert!(loaded.parent_workflow_id.is_none());

        assert!(repo.get_workflow(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_workflow_reuses_reservation() {
        let (repo, parent) = repo_with_workflow().await;

        let mut first = WorkflowInstance::new("encode_rendition", None, serde_json::Map::new());
        first.parent_workflow_id = Some(parent.id);
        first.reservation = Some("fork-node:fork:0".to_string());
        let mut second = first.clone();
        second.id = Uuid::now_v7();

        let stored_first = repo.create_workflow(&first).await.unwrap();
        let stored_second = repo.create_workflow(&second).await.unwrap();
        assert_eq!(stored_first.id, first.id);
        assert_eq!(stored_second.id, first.id);

        let children = repo.list_children(&parent.id).await.unwrap();
        assert_eq!(children.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_workflow_id_conflicts() {
        let (repo, wf) = repo_with_workflow().await;
        let err = repo.create_workflow(&wf).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_list_unstarted() {
        let (repo, wf) = repo_with_workflow().await;
        let unstarted = repo.list_unstarted(10).await.unwrap();
        assert_eq!(unstarted.len(), 1);
        assert_eq!(unstarted[0].id, wf.id);

        repo.create_root_node(&node_for(&wf, "probe", None)).await.unwrap();
        assert!(repo.list_unstarted(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_root_node_is_idempotent() {
        let (repo, wf) = repo_with_workflow().await;

        let first = repo.create_root_node(&node_for(&wf, "probe", None)).await.unwrap();
        let second = repo.create_root_node(&node_for(&wf, "probe", None)).await.unwrap();
        assert!(first.is_created());
        assert!(!second.is_created());
        assert_eq!(first.node().id, second.node().id);
        assert_eq!(repo.list_chain(&wf.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_and_advance_links_chain() {
        let (repo, wf) = repo_with_workflow().await;
        let root = repo
            .create_root_node(&node_for(&wf, "probe", None))
            .await
            .unwrap()
            .into_node();

        let next = node_for(&wf, "determine_renditions", Some(&root));
        let outcome = repo.claim_and_advance(&root.id, &next).await.unwrap();
        assert!(outcome.is_created());

        let chain = repo.list_chain(&wf.id).await.unwrap();
        let ids: Vec<&str> = chain.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["probe", "determine_renditions"]);
        assert_eq!(chain[0].child_node_id, Some(next.id));
        assert_eq!(chain[1].parent_node_id, Some(root.id));
        assert_eq!(chain[1].data.input, Some(json!({ "path": "/media/ep5.mkv" })));
    }

    #[tokio::test]
    async fn test_second_claim_returns_winner() {
        let (repo, wf) = repo_with_workflow().await;
        let root = repo
            .create_root_node(&node_for(&wf, "probe", None))
            .await
            .unwrap()
            .into_node();

        let winner = node_for(&wf, "determine_renditions", Some(&root));
        let loser = node_for(&wf, "determine_renditions", Some(&root));
        repo.claim_and_advance(&root.id, &winner).await.unwrap();

        match repo.claim_and_advance(&root.id, &loser).await.unwrap() {
            ClaimOutcome::Existing(existing) => assert_eq!(existing.id, winner.id),
            ClaimOutcome::Created(_) => panic!("second claim must not create a node"),
        }
        assert_eq!(repo.list_chain(&wf.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_claims_create_one_successor() {
        let (repo, wf) = repo_with_workflow().await;
        let repo = Arc::new(repo);
        let root = repo
            .create_root_node(&node_for(&wf, "probe", None))
            .await
            .unwrap()
            .into_node();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = Arc::clone(&repo);
            let child = node_for(&wf, "determine_renditions", Some(&root));
            let parent_id = root.id;
            handles.push(tokio::spawn(async move {
                repo.claim_and_advance(&parent_id, &child).await.unwrap()
            }));
        }

        let mut created = 0;
        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            let outcome = handle.await.unwrap();
            if outcome.is_created() {
                created += 1;
            }
            ids.insert(outcome.node().id);
        }
        assert_eq!(created, 1);
        assert_eq!(ids.len(), 1);

        let chain = repo.list_chain(&wf.id).await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.iter().filter(|n| n.is_frontier()).count(), 1);
    }

    #[tokio::test]
    async fn test_claim_unknown_parent_is_not_found() {
        let (repo, wf) = repo_with_workflow().await;
        let orphan = node_for(&wf, "probe", None);
        let err = repo.claim_and_advance(&Uuid::now_v7(), &orphan).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_conditional_node_updates() {
        let (repo, wf) = repo_with_workflow().await;
        let root = repo
            .create_root_node(&node_for(&wf, "probe", None))
            .await
            .unwrap()
            .into_node();

        let job = JobHandle(Uuid::now_v7());
        assert!(repo.attach_job(&root.id, &job).await.unwrap());
        assert!(!repo.attach_job(&root.id, &JobHandle(Uuid::now_v7())).await.unwrap());

        repo.record_outcome(&root.id, "retry", Some(&json!({ "streams": [] })))
            .await
            .unwrap();
        repo.record_outcome(&root.id, "default", None).await.unwrap();

        let failure = NodeError::new(NodeErrorKind::JobFailure, "ffprobe exited 1");
        repo.record_failure(&root.id, &failure).await.unwrap();
        repo.record_failure(&root.id, &NodeError::new(NodeErrorKind::Resolution, "later"))
            .await
            .unwrap();
        repo.halt_node(&root.id).await.unwrap();

        let loaded = repo.get_node(&root.id).await.unwrap().unwrap();
        assert_eq!(loaded.job, Some(job));
        assert_eq!(loaded.selection.as_deref(), Some("retry"));
        assert_eq!(loaded.data.output, Some(json!({ "streams": [] })));
        assert_eq!(loaded.error_details, Some(failure));
        assert!(loaded.halted);
    }

    #[tokio::test]
    async fn test_frontier_candidates_filter() {
        let (repo, wf) = repo_with_workflow().await;
        let root = repo
            .create_root_node(&node_for(&wf, "probe", None))
            .await
            .unwrap()
            .into_node();
        assert_eq!(repo.list_frontier_candidates(10).await.unwrap().len(), 1);

        let mut last = node_for(&wf, "generate_playlist", Some(&root));
        last.terminal = true;
        repo.claim_and_advance(&root.id, &last).await.unwrap();

        // Linked root drops out, unsettled terminal node stays.
        let candidates = repo.list_frontier_candidates(10).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, last.id);
        assert!(candidates[0].terminal);

        repo.record_outcome(&last.id, "default", Some(&json!({}))).await.unwrap();
        assert!(repo.list_frontier_candidates(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_halted_nodes_are_not_candidates() {
        let (repo, wf) = repo_with_workflow().await;
        let root = repo
            .create_root_node(&node_for(&wf, "probe", None))
            .await
            .unwrap()
            .into_node();
        repo.halt_node(&root.id).await.unwrap();
        assert!(repo.list_frontier_candidates(10).await.unwrap().is_empty());
    }
}
