use anyhow::Result;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::paths;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub workspace_dir: PathBuf,
    pub listen_addr: String,
    pub warehouse_db_path: PathBuf,
    pub operational_db_path: PathBuf,
    // Quiet period after the last change signal before a refresh starts.
    pub debounce_ms: u64,
    pub query_timeout_ms: u64,
    pub max_concurrent_queries: usize,
    pub log_filter: String,
}

fn default_workspace_dir() -> PathBuf {
    let base_dir = dirs::home_dir()
        .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    base_dir.join(".pulseboard")
}

impl Default for AppConfig {
    fn default() -> Self {
        let workspace_dir = default_workspace_dir();
        Self {
            warehouse_db_path: paths::warehouse_db(&workspace_dir),
            operational_db_path: paths::operational_db(&workspace_dir),
            workspace_dir,
            listen_addr: "127.0.0.1:3000".into(),
            debounce_ms: 1000,
            query_timeout_ms: 10_000,
            max_concurrent_queries: 8,
            log_filter: "info".into(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let defaults = Self::default();
        let config_path = paths::config_file(&defaults.workspace_dir);

        let mut builder = Config::builder()
            .set_default(
                "workspace_dir",
                defaults.workspace_dir.to_string_lossy().as_ref(),
            )?
            .set_default("listen_addr", defaults.listen_addr.as_str())?
            .set_default(
                "warehouse_db_path",
                defaults.warehouse_db_path.to_string_lossy().as_ref(),
            )?
            .set_default(
                "operational_db_path",
                defaults.operational_db_path.to_string_lossy().as_ref(),
            )?
            .set_default("debounce_ms", defaults.debounce_ms)?
            .set_default("query_timeout_ms", defaults.query_timeout_ms)?
            .set_default("max_concurrent_queries", defaults.max_concurrent_queries as u64)?
            .set_default("log_filter", defaults.log_filter.as_str())?;

        if config_path.exists() {
            builder = builder.add_source(File::from(config_path));
        }

        builder = builder.add_source(Environment::with_prefix("PULSEBOARD"));

        let config = builder.build()?;
        let app_config: AppConfig = config.try_deserialize()?;
        Ok(app_config)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}
