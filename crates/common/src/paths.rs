use std::path::{Path, PathBuf};

const PID_FILE_NAME: &str = "pulsed.pid";
const CONFIG_FILE_NAME: &str = "config.toml";
const LOG_DIR_NAME: &str = "logs";
const WAREHOUSE_DB_NAME: &str = "warehouse.sqlite3";
const OPERATIONAL_DB_NAME: &str = "operational.sqlite3";

pub fn pid_file(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(PID_FILE_NAME)
}

pub fn config_file(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(CONFIG_FILE_NAME)
}

pub fn log_dir(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(LOG_DIR_NAME)
}

pub fn warehouse_db(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(WAREHOUSE_DB_NAME)
}

pub fn operational_db(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(OPERATIONAL_DB_NAME)
}
