use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use pulseboard::daemon::dashboard::dashboard_catalog;
use pulseboard::daemon::server::http;
use pulseboard::storage::{SqliteStore, Store};
use pulseboard::util::config::AppConfig;
use pulseboard::util::paths;
use pulseboard::{Engine, EngineOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(author, version, about = "Realtime dashboard snapshot daemon", long_about = None)]
struct Cli {
    /// Address to listen on, overriding `listen_addr` from the config.
    #[arg(long)]
    listen: Option<String>,

    /// Log to stderr instead of the rolling log file.
    #[arg(long)]
    foreground: bool,

    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn ensure_workspace_dir(workspace_dir: &Path) {
    if !workspace_dir.exists() {
        std::fs::create_dir_all(workspace_dir).unwrap_or_else(|e| {
            eprintln!("Failed to create workspace directory: {}", e);
            std::process::exit(1);
        });
    }
}

fn is_process_running(pid: u32) -> bool {
    std::process::Command::new("ps")
        .args(["-p", &pid.to_string()])
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn write_pid_file(pid_file: &PathBuf) {
    if pid_file.exists() {
        match std::fs::read_to_string(pid_file) {
            Ok(content) => {
                if let Ok(existing_pid) = content.trim().parse::<u32>() {
                    if is_process_running(existing_pid) {
                        eprintln!("pulsed is already running (PID: {})", existing_pid);
                        std::process::exit(1);
                    }
                    info!("Removing stale PID file (process {} is gone)", existing_pid);
                    let _ = std::fs::remove_file(pid_file);
                }
            }
            Err(_) => {
                info!("Removing unreadable PID file");
                let _ = std::fs::remove_file(pid_file);
            }
        }
    }

    std::fs::write(pid_file, std::process::id().to_string()).unwrap_or_else(|e| {
        eprintln!("Failed to write PID file: {}", e);
        std::process::exit(1);
    });
}

fn cleanup_pid_file(pid_file: &PathBuf) {
    let current_pid = std::process::id();
    match std::fs::read_to_string(pid_file) {
        Ok(content) if content.trim().parse::<u32>().ok() == Some(current_pid) => {
            if let Err(e) = std::fs::remove_file(pid_file) {
                error!("Failed to remove PID file: {}", e);
            }
        }
        Ok(content) => error!(
            "PID file holds {} instead of {}; leaving it in place",
            content.trim(),
            current_pid
        ),
        Err(e) => error!("Failed to read PID file for cleanup: {}", e),
    }
}

fn log_filter(config: &AppConfig, verbose: u8) -> EnvFilter {
    let level = match verbose {
        0 => config.log_filter.as_str(),
        1 => "debug",
        _ => "trace",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn setup_logging(config: &AppConfig, cli: &Cli) {
    let env_filter = log_filter(config, cli.verbose);
    let timer = fmt::time::ChronoUtc::new("%Y-%m-%dT%H:%M:%S%.6fZ".to_string());

    if cli.foreground {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr).with_timer(timer))
            .with(env_filter)
            .init();
        return;
    }

    let log_dir = paths::log_dir(&config.workspace_dir);
    std::fs::create_dir_all(&log_dir).unwrap_or_else(|e| {
        eprintln!("Failed to create log directory: {}", e);
        std::process::exit(1);
    });

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("pulsed")
        .filename_suffix("log")
        .max_log_files(7)
        .build(&log_dir)
        .unwrap_or_else(|e| {
            eprintln!("Failed to create log appender: {}", e);
            std::process::exit(1);
        });

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .with_timer(timer),
        )
        .with(env_filter)
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn run(config: AppConfig, listen_addr: String) -> Result<()> {
    let catalog = dashboard_catalog().context("build dashboard catalog")?;
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&config.warehouse_db_path, &config.operational_db_path)
            .context("open dashboard databases")?,
    );
    let engine = Engine::start(catalog, store, EngineOptions::from(&config));

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("bind {listen_addr}"))?;
    let served = http::serve(listener, engine.clone(), shutdown_signal()).await;
    engine.shutdown().await;
    served
}

fn main() {
    let cli = Cli::parse();
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    ensure_workspace_dir(&config.workspace_dir);
    setup_logging(&config, &cli);

    let pid_file = paths::pid_file(&config.workspace_dir);
    write_pid_file(&pid_file);

    let listen_addr = cli.listen.clone().unwrap_or_else(|| config.listen_addr.clone());
    info!("Starting pulsed on {}", listen_addr);

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("pulsed-worker")
        .build()
        .context("build tokio runtime")
        .and_then(|rt| rt.block_on(run(config, listen_addr)));

    cleanup_pid_file(&pid_file);

    if let Err(e) = result {
        error!("pulsed exited with error: {:#}", e);
        eprintln!("pulsed exited with error: {:#}", e);
        std::process::exit(1);
    }
}
