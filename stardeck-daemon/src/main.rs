use anyhow::Context;
use clap::Parser;
use stardeck_core::observability::health::{DATABASE, ENGINE};
use stardeck_core::workflows::WorkflowSettings;
use stardeck_core::{
    init_observability, paths, shutdown_observability, BackupManager, Config, ContainerEngine,
    DockerCli, HealthChecker, MetadataStore, StackDriver, StateManager, Workflows,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

mod api;
mod reconcile;
mod shutdown;
mod supervisor;

use api::AppState;
use reconcile::StateReconciler;
use shutdown::{shutdown_signal, ShutdownManager};
use supervisor::Supervisor;

/// Stardeck daemon: container and stack orchestration over HTTP and WebSocket.
#[derive(Parser, Debug)]
#[command(name = "stardeckd", version, about)]
struct Args {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Data directory for the database, stacks and backups
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(listen) = &args.listen {
        config.listen_addr = listen.clone();
    }
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.to_string_lossy().to_string();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // Initialize observability FIRST
    init_observability(&config.log_level, config.metrics_port)
        .map_err(|e| anyhow::anyhow!("failed to initialize observability: {}", e))?;

    info!("Stardeck daemon starting");

    let health = HealthChecker::new();

    let data_dir = config.data_dir();
    let db_path = paths::db_path(&data_dir);
    info!("Initializing state manager at {}", db_path.display());
    let state = Arc::new(StateManager::new(&db_path).await?);
    health.register_subsystem(DATABASE).await;

    let engine: Arc<dyn ContainerEngine> =
        Arc::new(DockerCli::new(&config.engine_binary, config.engine_timeouts));
    match engine.ping().await {
        Ok(version) => info!(engine = engine.name(), version = %version, "Container engine reachable"),
        Err(e) => warn!("Container engine not reachable yet: {}", e),
    }
    health.register_subsystem(ENGINE).await;

    let store: Arc<dyn MetadataStore> = state.clone();
    let backups = BackupManager::new(store.clone(), paths::backups_dir(&data_dir));
    let stacks = StackDriver::new(engine.clone(), paths::stacks_dir(&data_dir));
    let settings = WorkflowSettings {
        default_stop_timeout: config.default_stop_timeout(),
        workflow_timeout: config.workflow_timeout(),
    };
    let workflows = Workflows::new(engine.clone(), store, state.clone(), backups, stacks, settings);

    // Reconcile stored state with the engine (handles restarts and crashes)
    match StateReconciler::new(workflows.clone()).reconcile().await {
        Ok(report) => {
            if !report.leftover_backups.is_empty() {
                warn!(
                    count = report.leftover_backups.len(),
                    "Backup containers from earlier updates are still present"
                );
            }
        }
        Err(e) => error!("State reconciliation failed: {}", e),
    }
    health.probe(&state, engine.as_ref()).await;

    if config.api_tokens.is_empty() {
        warn!("No API tokens configured; every caller is trusted as 'local'");
    }

    let supervisor = Supervisor::new();
    let app = Arc::new(AppState {
        workflows,
        state: state.clone(),
        health,
        supervisor: supervisor.clone(),
        config: Arc::new(config.clone()),
    });

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("Stardeck daemon ready");

    let mut signal = shutdown_signal();
    let server = api::serve(app, listener, async move {
        let _ = signal.recv().await;
    });
    if let Err(e) = server.await {
        error!("API server failed: {}", e);
    }

    ShutdownManager::new(state, supervisor, config.shutdown_grace()).shutdown().await;

    info!("Stardeck daemon stopped");
    shutdown_observability();
    Ok(())
}
