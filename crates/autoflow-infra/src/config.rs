//! Engine configuration loader for Autoflow.
//!
//! Reads `config.toml` from the data directory (`~/.autoflow/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing, malformed, or holds conflicting settings.

use std::path::{Path, PathBuf};

use autoflow_types::config::EngineConfig;

use crate::sqlite::pool::database_url_for;

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - If the parsed config has [`EngineConfig::problems`], logs each and returns the default.
/// - Otherwise returns the parsed config.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => {
            let problems = config.problems();
            if problems.is_empty() {
                return config;
            }
            for problem in &problems {
                tracing::warn!("Invalid {}: {problem}", config_path.display());
            }
            tracing::warn!("Ignoring {}, using defaults", config_path.display());
            EngineConfig::default()
        }
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Database URL from the config, else `autoflow.db` in the data directory.
pub fn resolve_database_url(data_dir: &Path, config: &EngineConfig) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(|| database_url_for(data_dir))
}

/// Definitions directory; relative paths are taken from the data directory.
pub fn resolve_definitions_dir(data_dir: &Path, config: &EngineConfig) -> PathBuf {
    if config.definitions_dir.is_absolute() {
        config.definitions_dir.clone()
    } else {
        data_dir.join(&config.definitions_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert!(config.database_url.is_none());
        assert_eq!(config.scheduler.batch_size, 200);
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
definitions_dir = "flows"

[queue]
max_concurrent_jobs = 2
stale_after_secs = 60

[fork]
timeout_secs = 30
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.queue.max_concurrent_jobs, 2);
        assert_eq!(config.queue.stale_after_secs, 60);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(
            resolve_definitions_dir(tmp.path(), &config),
            tmp.path().join("flows")
        );
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not [valid toml")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.scheduler.poll_interval_ms, 2_000);
    }

    #[tokio::test]
    async fn load_engine_config_conflicting_timeouts_return_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
[queue]
stale_after_secs = 60

[fork]
timeout_secs = 120
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.queue.stale_after_secs, 7_200);
        assert_eq!(config.fork.timeout_secs, 1_800);
    }

    #[test]
    fn resolve_paths() {
        let data_dir = Path::new("/srv/autoflow");
        let mut config = EngineConfig::default();
        assert_eq!(
            resolve_database_url(data_dir, &config),
            "sqlite:///srv/autoflow/autoflow.db?mode=rwc"
        );
        assert_eq!(
            resolve_definitions_dir(data_dir, &config),
            PathBuf::from("/srv/autoflow/definitions")
        );

        config.database_url = Some("sqlite::memory:".to_string());
        config.definitions_dir = PathBuf::from("/etc/autoflow/definitions");
        assert_eq!(resolve_database_url(data_dir, &config), "sqlite::memory:");
        assert_eq!(
            resolve_definitions_dir(data_dir, &config),
            PathBuf::from("/etc/autoflow/definitions")
        );
    }
}
