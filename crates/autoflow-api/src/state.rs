//! Application state wiring the engine runtime for CLI commands.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use autoflow_core::workflow::store::DefinitionCatalog;
use autoflow_infra::config::{load_engine_config, resolve_database_url, resolve_definitions_dir};
use autoflow_infra::runtime::Runtime;
use autoflow_infra::sqlite::pool::default_data_dir;
use autoflow_types::config::EngineConfig;

use crate::jobs::builtin_registry;

/// Resolved locations and configuration. Cheap to build; opens nothing.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub database_url: String,
    pub definitions_dir: PathBuf,
}

impl AppPaths {
    /// Resolve the data directory (flag, `AUTOFLOW_DATA_DIR`, or
    /// `~/.autoflow`) and load its `config.toml`.
    pub async fn resolve(data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let database_url = resolve_database_url(&data_dir, &config);
        let definitions_dir = resolve_definitions_dir(&data_dir, &config);

        Ok(Self {
            data_dir,
            config,
            database_url,
            definitions_dir,
        })
    }

    /// Load and validate every definition in the definitions directory.
    pub fn load_definitions(&self) -> anyhow::Result<DefinitionCatalog> {
        DefinitionCatalog::load_dir(&self.definitions_dir).with_context(|| {
            format!(
                "failed to load definitions from {}",
                self.definitions_dir.display()
            )
        })
    }
}

/// Shared state for commands that touch the database.
pub struct AppState {
    pub paths: AppPaths,
    pub runtime: Arc<Runtime>,
}

impl AppState {
    /// Load definitions, open the database and wire the runtime with the
    /// built-in job handlers.
    pub async fn init(paths: AppPaths) -> anyhow::Result<Self> {
        let definitions = Arc::new(paths.load_definitions()?);
        let runtime = Runtime::connect(
            &paths.database_url,
            definitions,
            paths.config.clone(),
            builtin_registry(),
        )
        .await?;

        tracing::debug!(
            data_dir = %paths.data_dir.display(),
            definitions = runtime.definitions().len(),
            "application state ready"
        );

        Ok(Self {
            paths,
            runtime: Arc::new(runtime),
        })
    }
}
