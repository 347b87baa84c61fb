//! Runtime wiring: one SQLite database, the engine, the transition
//! scheduler and the job worker.
//!
//! Callers supply the job registry with their handlers; the runtime adds the
//! fork coordinator (binding `fork`) because it needs the engine itself.

use std::sync::Arc;

use anyhow::Context;
use autoflow_core::queue::registry::JobRegistry;
use autoflow_core::workflow::engine::WorkflowEngine;
use autoflow_core::workflow::fork::{FORK_JOB, ForkJob};
use autoflow_core::workflow::scheduler::{SweepReport, TransitionScheduler};
use autoflow_core::workflow::store::{DefinitionCatalog, DefinitionStore};
use autoflow_types::config::EngineConfig;
use tokio_util::sync::CancellationToken;

use crate::queue::worker::JobWorker;
use crate::sqlite::pool::DatabasePool;
use crate::sqlite::queue::SqliteTaskQueue;
use crate::sqlite::subject::SqliteSubjectLookup;
use crate::sqlite::workflow::SqliteWorkflowRepository;

/// The engine over the SQLite implementations.
pub type Engine = WorkflowEngine<SqliteWorkflowRepository, SqliteTaskQueue, SqliteSubjectLookup>;

/// The scheduler over the SQLite implementations.
pub type Scheduler =
    TransitionScheduler<SqliteWorkflowRepository, SqliteTaskQueue, SqliteSubjectLookup>;

pub struct Runtime {
    config: EngineConfig,
    engine: Arc<Engine>,
    scheduler: Scheduler,
    worker: JobWorker,
    registry: Arc<JobRegistry>,
    queue: Arc<SqliteTaskQueue>,
    subjects: Arc<SqliteSubjectLookup>,
    definitions: Arc<DefinitionCatalog>,
}

impl Runtime {
    /// Open the database at `database_url` (running migrations) and wire the
    /// runtime.
    pub async fn connect(
        database_url: &str,
        definitions: Arc<DefinitionCatalog>,
        config: EngineConfig,
        registry: JobRegistry,
    ) -> anyhow::Result<Self> {
        let pool = DatabasePool::new(database_url)
            .await
            .with_context(|| format!("failed to open database {database_url}"))?;
        Ok(Self::new(pool, definitions, config, registry))
    }

    pub fn new(
        pool: DatabasePool,
        definitions: Arc<DefinitionCatalog>,
        config: EngineConfig,
        mut registry: JobRegistry,
    ) -> Self {
        let repo = Arc::new(SqliteWorkflowRepository::new(pool.clone()));
        let queue = Arc::new(SqliteTaskQueue::new(pool.clone(), config.queue.max_attempts));
        let subjects = Arc::new(SqliteSubjectLookup::new(pool));
        let store: Arc<dyn DefinitionStore> = definitions.clone();

        let engine = Arc::new(WorkflowEngine::new(
            repo,
            Arc::clone(&queue),
            Arc::clone(&subjects),
            store,
        ));

        registry.register_coordinator(
            FORK_JOB,
            ForkJob::new(Arc::clone(&engine), config.fork.clone()),
        );
        let registry = Arc::new(registry);

        let scheduler = TransitionScheduler::new(Arc::clone(&engine), config.scheduler.clone());
        let worker = JobWorker::new(Arc::clone(&queue), Arc::clone(&registry), config.queue.clone());

        Self {
            config,
            engine,
            scheduler,
            worker,
            registry,
            queue,
            subjects,
            definitions,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn worker(&self) -> &JobWorker {
        &self.worker
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &SqliteTaskQueue {
        &self.queue
    }

    pub fn subjects(&self) -> &SqliteSubjectLookup {
        &self.subjects
    }

    pub fn definitions(&self) -> &Arc<DefinitionCatalog> {
        &self.definitions
    }

    /// `(definition id, job binding)` pairs with no registered handler.
    pub fn missing_handlers(&self) -> Vec<(String, String)> {
        let mut missing = Vec::new();
        for id in self.definitions.ids() {
            let Some(graph) = self.definitions.get(&id) else {
                continue;
            };
            for binding in self.registry.missing_bindings(&graph) {
                missing.push((id.clone(), binding.to_string()));
            }
        }
        missing
    }

    /// One sweep followed by running every claimable job. Used by the
    /// `sweep` command; forks block it until their children finish, so
    /// definitions with forks need [`Runtime::run`].
    pub async fn step(&self) -> anyhow::Result<(SweepReport, usize)> {
        let report = self.scheduler.sweep().await.context("sweep failed")?;
        let jobs = self.worker.drain().await.context("job execution failed")?;
        Ok((report, jobs))
    }

    /// Run the scheduler and the job worker until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        for (definition, binding) in self.missing_handlers() {
            tracing::warn!(
                %definition,
                %binding,
                "no handler registered for job binding, its jobs wait for another worker"
            );
        }
        tokio::join!(self.scheduler.run(cancel.clone()), self.worker.run(cancel));
    }

    /// Spawn [`Runtime::run`] on the tokio runtime.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(cancel).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoflow_core::queue::handler::{FnHandler, JobContext, JobError};
    use autoflow_core::repository::workflow::WorkflowRepository;
    use autoflow_core::workflow::definition::parse_definition_yaml;
    use autoflow_types::config::{ForkConfig, QueueConfig, SchedulerConfig};
    use autoflow_types::queue::JobResult;
    use autoflow_types::workflow::{NodeErrorKind, SubjectRef, WorkflowStatus};
    use serde_json::{Map, Value, json};
    use std::collections::HashSet;
    use std::time::Duration;
    use uuid::Uuid;

    const TRANSCODE: &str = r#"
id: transcode_episode
nodes:
  - id: probe
    job: ffprobe
    args:
      path: "${args.path}"
      label: "${subject.title} S${subject.season}E${subject.episode}"
    transitions: { default: determine_renditions }
  - id: determine_renditions
    job: determine_renditions
    args:
      probe: "${probe.output}"
    transitions: { default: generate_playlist, error: cleanup }
  - id: generate_playlist
    job: generate_master_playlist
    args:
      renditions: "${determine_renditions.output.video}"
      source: "${probe.input.path}"
    end: true
  - id: cleanup
    job: cleanup
    end: true
"#;

    const FAN_OUT: &str = r#"
id: encode_all
nodes:
  - id: fan_out
    job: fork
    args:
      workflow: encode_one
      children: "${args.heights}"
      item_key: height
      shared: { source: "${args.path}" }
    transitions: { default: publish, partial_failure: publish_partial }
  - id: publish
    job: noop
    end: true
  - id: publish_partial
    job: noop
    end: true
"#;

    const ENCODE_ONE: &str = r#"
id: encode_one
nodes:
  - id: encode
    job: encode
    args: { height: "${args.height}", source: "${args.source}" }
    end: true
"#;

    fn fast_config() -> EngineConfig {
        EngineConfig {
            scheduler: SchedulerConfig {
                poll_interval_ms: 10,
                ..SchedulerConfig::default()
            },
            queue: QueueConfig {
                poll_interval_ms: 10,
                backoff_base_ms: 1,
                backoff_max_ms: 5,
                ..QueueConfig::default()
            },
            fork: ForkConfig {
                timeout_secs: 10,
                poll_interval_ms: 10,
            },
            ..EngineConfig::default()
        }
    }

    fn catalog(yamls: &[&str]) -> Arc<DefinitionCatalog> {
        Arc::new(DefinitionCatalog::from_graphs(
            yamls.iter().map(|y| parse_definition_yaml(y).unwrap()),
        ))
    }

    fn temp_url() -> String {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        // Leak tempdir so it lives for the test
        std::mem::forget(dir);
        url
    }

    fn ok(data: Value) -> FnHandler {
        FnHandler::new(move |_ctx: JobContext| {
            let data = data.clone();
            async move { Ok(JobResult::new(data)) }
        })
    }

    /// Handlers for the transcode chain; `determine` decides the middle step.
    fn transcode_registry(determine: FnHandler) -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry.register(
            "ffprobe",
            FnHandler::new(|ctx: JobContext| async move {
                Ok(JobResult::new(json!({
                    "height": 1080,
                    "label": ctx.args["label"].clone(),
                })))
            }),
        );
        registry.register("determine_renditions", determine);
        registry.register(
            "generate_master_playlist",
            FnHandler::new(|ctx: JobContext| async move {
                Ok(JobResult::new(json!({
                    "playlist": "master.m3u8",
                    "renditions": ctx.args["renditions"].clone(),
                })))
            }),
        );
        registry.register("cleanup", ok(json!({ "cleaned": true })));
        registry
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn runtime(yamls: &[&str], registry: JobRegistry) -> Runtime {
        runtime_with(yamls, registry, fast_config()).await
    }

    async fn runtime_with(yamls: &[&str], registry: JobRegistry, config: EngineConfig) -> Runtime {
        Runtime::connect(&temp_url(), catalog(yamls), config, registry)
            .await
            .unwrap()
    }

    /// Sweep and drain until the workflow settles.
    async fn settle(rt: &Runtime, workflow_id: Uuid) -> WorkflowStatus {
        for _ in 0..20 {
            rt.step().await.unwrap();
            let status = rt.engine().status(workflow_id).await.unwrap();
            if status.is_terminal() {
                return status;
            }
        }
        rt.engine().status(workflow_id).await.unwrap()
    }

    fn chain_ids(chain: &[autoflow_types::workflow::NodeInstance]) -> Vec<&str> {
        chain.iter().map(|n| n.node_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_transcode_chain_completes() {
        let rt = runtime(
            &[TRANSCODE],
            transcode_registry(ok(json!({ "video": [{ "height": 1080 }, { "height": 720 }] }))),
        )
        .await;
        let episode = SubjectRef::new("episode", "42");
        rt.subjects()
            .put(&episode, &json!({ "title": "X", "season": 2, "episode": 5 }))
            .await
            .unwrap();

        let id = rt
            .engine()
            .start(
                "transcode_episode",
                Some(episode),
                args(json!({ "path": "/media/x.mkv" })),
            )
            .await
            .unwrap();
        assert_eq!(rt.engine().status(id).await.unwrap(), WorkflowStatus::Running);
        assert!(rt.engine().result(id).await.unwrap().is_none());

        assert_eq!(settle(&rt, id).await, WorkflowStatus::Complete);

        let chain = rt.engine().chain(id).await.unwrap();
        assert_eq!(
            chain_ids(&chain),
            vec!["probe", "determine_renditions", "generate_playlist"]
        );
        assert_eq!(chain[0].data.input.as_ref().unwrap()["label"], "X S2E5");
        assert_eq!(chain[1].data.input.as_ref().unwrap()["probe"]["height"], 1080);

        let result = rt.engine().result(id).await.unwrap().unwrap();
        assert_eq!(result.node_id, "generate_playlist");
        assert_eq!(result.selection, "default");
        assert_eq!(result.output["playlist"], "master.m3u8");
        assert_eq!(result.output["renditions"][1]["height"], 720);
    }

    #[tokio::test]
    async fn test_undeclared_selection_falls_back_to_default() {
        let retry = FnHandler::new(|_ctx: JobContext| async move {
            Ok(JobResult::with_selection("retry", json!({ "video": [] })))
        });
        let rt = runtime(&[TRANSCODE], transcode_registry(retry)).await;

        let id = rt
            .engine()
            .start("transcode_episode", None, args(json!({ "path": "/m.mkv" })))
            .await
            .unwrap();
        assert_eq!(settle(&rt, id).await, WorkflowStatus::Complete);

        let chain = rt.engine().chain(id).await.unwrap();
        assert_eq!(chain[1].selection.as_deref(), Some("retry"));
        assert_eq!(chain[2].node_id, "generate_playlist");
    }

    #[tokio::test]
    async fn test_job_failure_without_error_transition_fails_workflow() {
        let mut registry = transcode_registry(ok(json!({})));
        registry.register(
            "ffprobe",
            FnHandler::new(|_ctx: JobContext| async move { Err(JobError::fatal("not a video")) }),
        );
        let rt = runtime(&[TRANSCODE], registry).await;

        let id = rt
            .engine()
            .start("transcode_episode", None, args(json!({ "path": "/m.txt" })))
            .await
            .unwrap();
        assert_eq!(settle(&rt, id).await, WorkflowStatus::Failed);

        let chain = rt.engine().chain(id).await.unwrap();
        assert_eq!(chain_ids(&chain), vec!["probe"]);
        assert!(chain[0].halted);
        let error = chain[0].error_details.as_ref().unwrap();
        assert_eq!(error.kind, NodeErrorKind::JobFailure);
        assert_eq!(error.message, "not a video");
        assert!(rt.engine().result(id).await.unwrap().is_none());

        // Further sweeps never extend a failed chain.
        rt.step().await.unwrap();
        assert_eq!(rt.engine().chain(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_error_transition_recovers() {
        let failing =
            FnHandler::new(|_ctx: JobContext| async move { Err(JobError::fatal("no streams")) });
        let rt = runtime(&[TRANSCODE], transcode_registry(failing)).await;

        let id = rt
            .engine()
            .start("transcode_episode", None, args(json!({ "path": "/m.mkv" })))
            .await
            .unwrap();
        assert_eq!(settle(&rt, id).await, WorkflowStatus::Complete);

        let chain = rt.engine().chain(id).await.unwrap();
        assert_eq!(
            chain_ids(&chain),
            vec!["probe", "determine_renditions", "cleanup"]
        );
        assert_eq!(chain[1].selection.as_deref(), Some("error"));
        assert_eq!(
            chain[1].error_details.as_ref().unwrap().kind,
            NodeErrorKind::JobFailure
        );
        let result = rt.engine().result(id).await.unwrap().unwrap();
        assert_eq!(result.output, json!({ "cleaned": true }));
    }

    #[tokio::test]
    async fn test_resolution_failure_is_not_dispatched() {
        let yaml = r#"
id: broken_refs
nodes:
  - id: first
    job: noop
    args: { root: "${settings.root_path}" }
    end: true
"#;
        let mut registry = JobRegistry::new();
        registry.register("noop", ok(json!(null)));
        let rt = runtime(&[yaml], registry).await;

        let id = rt
            .engine()
            .start("broken_refs", None, Map::new())
            .await
            .unwrap();
        assert_eq!(settle(&rt, id).await, WorkflowStatus::Failed);

        let chain = rt.engine().chain(id).await.unwrap();
        assert_eq!(chain.len(), 1);
        assert!(chain[0].job.is_none());
        assert!(chain[0].data.input.is_none());
        let error = chain[0].error_details.as_ref().unwrap();
        assert_eq!(error.kind, NodeErrorKind::Resolution);
        assert!(error.message.contains("settings"), "{}", error.message);
        assert!(rt.queue().counts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_definition_change_halts_with_inconsistency() {
        let v1 = r#"
id: evolving
nodes:
  - id: a
    job: noop
    transitions: { default: b }
  - id: b
    job: noop
    end: true
"#;
        let v2 = r#"
id: evolving
nodes:
  - id: renamed
    job: noop
    end: true
"#;
        let mut registry = JobRegistry::new();
        registry.register("noop", ok(json!(null)));
        let rt = runtime(&[v1], registry).await;

        let id = rt.engine().start("evolving", None, Map::new()).await.unwrap();
        rt.worker().drain().await.unwrap();

        rt.definitions().insert(parse_definition_yaml(v2).unwrap());
        let report = rt.scheduler().sweep().await.unwrap();
        assert_eq!(report.halted, 1);

        assert_eq!(rt.engine().status(id).await.unwrap(), WorkflowStatus::Failed);
        let chain = rt.engine().chain(id).await.unwrap();
        assert_eq!(chain_ids(&chain), vec!["a"]);
        assert_eq!(
            chain[0].error_details.as_ref().unwrap().kind,
            NodeErrorKind::DefinitionInconsistency
        );
    }

    #[tokio::test]
    async fn test_reservations_make_creation_idempotent() {
        let mut registry = JobRegistry::new();
        registry.register("encode", ok(json!(null)));
        let rt = runtime(&[ENCODE_ONE], registry).await;
        let engine = rt.engine();

        let parent_id = engine.start("encode_one", None, Map::new()).await.unwrap();
        let parent = engine.workflow(parent_id).await.unwrap();

        let first = engine
            .start_child(&parent, "encode_one", None, args(json!({ "height": 720 })), "n:fork:0".into())
            .await
            .unwrap();
        let again = engine
            .start_child(&parent, "encode_one", None, args(json!({ "height": 1 })), "n:fork:0".into())
            .await
            .unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(again.args["height"], 720);
        assert_eq!(engine.children(parent_id).await.unwrap().len(), 1);

        let graph = engine.definition("encode_one").unwrap();
        let outcome = engine.bootstrap(&first, &graph).await.unwrap();
        assert!(!outcome.is_created());
        assert_eq!(engine.chain(first.id).await.unwrap().len(), 1);
        assert_eq!(rt.queue().counts().await.unwrap()[0].1, 2);
    }

    #[tokio::test]
    async fn test_unknown_definition_is_rejected() {
        let rt = runtime(&[ENCODE_ONE], JobRegistry::new()).await;
        let err = rt.engine().start("nope", None, Map::new()).await.unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert_eq!(rt.missing_handlers(), vec![("encode_one".to_string(), "encode".to_string())]);
    }

    fn fork_registry() -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry.register("noop", ok(json!("published")));
        registry.register(
            "encode",
            FnHandler::new(|ctx: JobContext| async move {
                match ctx.args["height"].as_u64() {
                    Some(480) => Err(JobError::fatal("encoder crashed at 480p")),
                    Some(h) => Ok(JobResult::new(json!({ "height": h, "source": ctx.args["source"].clone() }))),
                    None => Err(JobError::fatal("missing height")),
                }
            }),
        );
        registry.register(
            "hang",
            FnHandler::new(|_ctx: JobContext| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(JobResult::new(json!(null)))
            }),
        );
        registry
    }

    #[tokio::test]
    async fn test_fork_partial_failure_takes_declared_transition() {
        let rt = Arc::new(runtime(&[FAN_OUT, ENCODE_ONE], fork_registry()).await);
        let cancel = CancellationToken::new();
        let running = rt.spawn(cancel.clone());

        let id = rt
            .engine()
            .start(
                "encode_all",
                None,
                args(json!({ "heights": [1080, 720, 480], "path": "/m.mkv" })),
            )
            .await
            .unwrap();
        let status = rt
            .engine()
            .wait_for(id, Duration::from_secs(20), Duration::from_millis(20))
            .await
            .unwrap();
        cancel.cancel();
        running.await.unwrap();
        assert_eq!(status, WorkflowStatus::Complete);

        let chain = rt.engine().chain(id).await.unwrap();
        assert_eq!(chain_ids(&chain), vec!["fan_out", "publish_partial"]);
        let fork_output = chain[0].data.output.as_ref().unwrap();
        assert_eq!(fork_output["complete"], 2);
        assert_eq!(fork_output["failed"], 1);
        assert_eq!(chain[0].selection.as_deref(), Some("partial_failure"));

        let children = rt.engine().children(id).await.unwrap();
        assert_eq!(children.len(), 3);
        assert_eq!(children[0].args["source"], "/m.mkv");
        let mut statuses = Vec::new();
        for child in &children {
            statuses.push(rt.engine().status(child.id).await.unwrap());
        }
        assert_eq!(
            statuses.iter().filter(|s| **s == WorkflowStatus::Failed).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_fork_all_children_complete_takes_default() {
        let rt = Arc::new(runtime(&[FAN_OUT, ENCODE_ONE], fork_registry()).await);
        let cancel = CancellationToken::new();
        let running = rt.spawn(cancel.clone());

        let id = rt
            .engine()
            .start("encode_all", None, args(json!({ "heights": [720, 360], "path": "/m.mkv" })))
            .await
            .unwrap();
        let status = rt
            .engine()
            .wait_for(id, Duration::from_secs(20), Duration::from_millis(20))
            .await
            .unwrap();
        cancel.cancel();
        running.await.unwrap();

        assert_eq!(status, WorkflowStatus::Complete);
        let chain = rt.engine().chain(id).await.unwrap();
        assert_eq!(chain_ids(&chain), vec!["fan_out", "publish"]);
    }

    #[tokio::test]
    async fn test_fork_timeout_fails_fork_node() {
        let yaml = r#"
id: impatient
nodes:
  - id: fan_out
    job: fork
    args:
      workflow: stuck
      children: [1]
      timeout_secs: 0
    transitions: { default: done }
  - id: done
    job: noop
    end: true
"#;
        let stuck = r#"
id: stuck
nodes:
  - { id: wait, job: hang, end: true }
"#;
        let rt = Arc::new(runtime(&[yaml, stuck], fork_registry()).await);
        let cancel = CancellationToken::new();
        let running = rt.spawn(cancel.clone());

        let id = rt.engine().start("impatient", None, Map::new()).await.unwrap();
        let status = rt
            .engine()
            .wait_for(id, Duration::from_secs(20), Duration::from_millis(20))
            .await
            .unwrap();
        cancel.cancel();
        running.await.unwrap();

        assert_eq!(status, WorkflowStatus::Failed);
        let chain = rt.engine().chain(id).await.unwrap();
        let error = chain[0].error_details.as_ref().unwrap();
        assert!(error.message.contains("timed out"), "{}", error.message);
        // Children are not cancelled.
        let children = rt.engine().children(id).await.unwrap();
        assert_eq!(children.len(), 1);
    }

    #[tokio::test]
    async fn test_fork_with_failed_child_and_no_partial_failure_takes_default() {
        let fan_out = r#"
id: encode_all
nodes:
  - id: fan_out
    job: fork
    args:
      workflow: encode_one
      children: "${args.heights}"
      item_key: height
      shared: { source: "${args.path}" }
    transitions: { default: publish }
  - id: publish
    job: noop
    end: true
"#;
        let rt = Arc::new(runtime(&[fan_out, ENCODE_ONE], fork_registry()).await);
        let cancel = CancellationToken::new();
        let running = rt.spawn(cancel.clone());

        let id = rt
            .engine()
            .start("encode_all", None, args(json!({ "heights": [720, 480], "path": "/m.mkv" })))
            .await
            .unwrap();
        let status = rt
            .engine()
            .wait_for(id, Duration::from_secs(20), Duration::from_millis(20))
            .await
            .unwrap();
        cancel.cancel();
        running.await.unwrap();

        assert_eq!(status, WorkflowStatus::Complete);
        let chain = rt.engine().chain(id).await.unwrap();
        assert_eq!(chain_ids(&chain), vec!["fan_out", "publish"]);
        assert_eq!(chain[0].selection.as_deref(), Some("default"));
        let fork_output = chain[0].data.output.as_ref().unwrap();
        assert_eq!(fork_output["complete"], 1);
        assert_eq!(fork_output["failed"], 1);
    }

    #[tokio::test]
    async fn test_fork_backlog_larger_than_job_slots_completes() {
        let mut config = fast_config();
        config.queue.max_concurrent_jobs = 2;
        let rt = Arc::new(runtime_with(&[FAN_OUT, ENCODE_ONE], fork_registry(), config).await);
        assert!(rt.registry().is_coordinator(FORK_JOB));

        // Every fork job is queued before any worker runs, ahead of the
        // children they will wait on.
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(
                rt.engine()
                    .start("encode_all", None, args(json!({ "heights": [720], "path": "/m.mkv" })))
                    .await
                    .unwrap(),
            );
        }

        let cancel = CancellationToken::new();
        let running = rt.spawn(cancel.clone());
        let mut statuses = Vec::new();
        for id in &ids {
            statuses.push(
                rt.engine()
                    .wait_for(*id, Duration::from_secs(20), Duration::from_millis(20))
                    .await
                    .unwrap(),
            );
        }
        cancel.cancel();
        running.await.unwrap();

        assert_eq!(statuses, vec![WorkflowStatus::Complete; ids.len()]);
        for id in &ids {
            let chain = rt.engine().chain(*id).await.unwrap();
            assert_eq!(chain_ids(&chain), vec!["fan_out", "publish"]);
        }
    }

    #[tokio::test]
    async fn test_fork_deadline_outlasts_job_timeout() {
        let yaml = r#"
id: waits_on_external
nodes:
  - id: fan_out
    job: fork
    args:
      workflow: external_encode
      children: [1]
      timeout_secs: 2
    transitions: { default: done }
  - id: done
    job: noop
    end: true
"#;
        // No worker here handles `remote_encode`, so the child never settles.
        let external = r#"
id: external_encode
nodes:
  - { id: encode, job: remote_encode, end: true }
"#;
        let mut config = fast_config();
        config.queue.job_timeout_secs = 1;
        config.queue.max_attempts = 1;
        let rt = Arc::new(runtime_with(&[yaml, external], fork_registry(), config).await);
        let cancel = CancellationToken::new();
        let running = rt.spawn(cancel.clone());

        let id = rt.engine().start("waits_on_external", None, Map::new()).await.unwrap();
        let status = rt
            .engine()
            .wait_for(id, Duration::from_secs(20), Duration::from_millis(20))
            .await
            .unwrap();
        cancel.cancel();
        running.await.unwrap();

        assert_eq!(status, WorkflowStatus::Failed);
        let chain = rt.engine().chain(id).await.unwrap();
        let error = chain[0].error_details.as_ref().unwrap();
        assert_eq!(error.kind, NodeErrorKind::JobFailure);
        assert!(
            error.message.contains("fork timed out after 2s with 1 of 1 children unresolved"),
            "{}",
            error.message
        );

        let child = &rt.engine().children(id).await.unwrap()[0];
        assert_eq!(rt.engine().status(child.id).await.unwrap(), WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn test_runtimes_with_disjoint_handlers_share_workflows() {
        let url = temp_url();
        let mut media = JobRegistry::new();
        media.register("ffprobe", ok(json!({ "height": 1080 })));
        media.register("generate_master_playlist", ok(json!({ "playlist": "master.m3u8" })));
        media.register("cleanup", ok(json!({ "cleaned": true })));
        let mut planner = JobRegistry::new();
        planner.register("determine_renditions", ok(json!({ "video": [{ "height": 1080 }] })));

        let media = Runtime::connect(&url, catalog(&[TRANSCODE]), fast_config(), media)
            .await
            .unwrap();
        let planner = Runtime::connect(&url, catalog(&[TRANSCODE]), fast_config(), planner)
            .await
            .unwrap();

        let id = media
            .engine()
            .start("transcode_episode", None, args(json!({ "path": "/m.mkv" })))
            .await
            .unwrap();
        for _ in 0..10 {
            media.step().await.unwrap();
            planner.step().await.unwrap();
            if media.engine().status(id).await.unwrap().is_terminal() {
                break;
            }
        }

        assert_eq!(media.engine().status(id).await.unwrap(), WorkflowStatus::Complete);
        let chain = media.engine().chain(id).await.unwrap();
        assert_eq!(
            chain_ids(&chain),
            vec!["probe", "determine_renditions", "generate_playlist"]
        );
        assert!(chain.iter().all(|n| n.error_details.is_none()));
    }

    #[tokio::test]
    async fn test_concurrent_sweeps_keep_single_frontier() {
        let linear = r#"
id: linear
nodes:
  - { id: s1, job: noop, transitions: { default: s2 } }
  - { id: s2, job: noop, transitions: { default: s3 } }
  - { id: s3, job: noop, transitions: { default: s4 } }
  - { id: s4, job: noop, end: true }
"#;
        let url = temp_url();
        let registry = || {
            let mut r = JobRegistry::new();
            r.register("noop", ok(json!(null)));
            r
        };
        // Two runtimes over one database file act as separate processes.
        let rt1 = Runtime::connect(&url, catalog(&[linear]), fast_config(), registry())
            .await
            .unwrap();
        let rt2 = Runtime::connect(&url, catalog(&[linear]), fast_config(), registry())
            .await
            .unwrap();

        let mut ids = Vec::new();
        for _ in 0..6 {
            ids.push(rt1.engine().start("linear", None, Map::new()).await.unwrap());
        }

        for _ in 0..30 {
            let (a, b, c) = tokio::join!(
                rt1.scheduler().sweep(),
                rt1.scheduler().sweep(),
                rt2.scheduler().sweep()
            );
            a.unwrap();
            b.unwrap();
            c.unwrap();
            rt2.worker().drain().await.unwrap();

            let mut settled = true;
            for id in &ids {
                settled &= rt1.engine().status(*id).await.unwrap().is_terminal();
            }
            if settled {
                break;
            }
        }

        for id in &ids {
            assert_eq!(rt1.engine().status(*id).await.unwrap(), WorkflowStatus::Complete);
            let chain = rt1.engine().chain(*id).await.unwrap();
            assert_eq!(chain_ids(&chain), vec!["s1", "s2", "s3", "s4"]);
            assert_eq!(chain.iter().filter(|n| n.is_frontier()).count(), 1);

            let parents: HashSet<Uuid> = chain.iter().filter_map(|n| n.parent_node_id).collect();
            assert_eq!(parents.len(), 3, "every parent has exactly one successor");
            for node in &chain {
                assert!(node.job.is_some());
            }
        }
        assert!(
            rt1.engine()
                .repository()
                .list_frontier_candidates(100)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
