//! Backend entrypoint: control-plane API, worker pool, and trigger
//! scheduler sharing one Postgres pool.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use wirl::callable::{CallableResolver, InProcessRegistry, SubprocessResolver};
use wirl::checkpoint_postgres::PostgresCheckpointStore;
use wirl::config::Config;
use wirl::db::Database;
use wirl::scheduler::TriggerScheduler;
use wirl::server::ApiServer;
use wirl::templates::TemplateStore;
use wirl::worker::{WorkerPool, WorkerPoolConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    info!(
        http_addr = %config.http_addr,
        definitions = %config.definitions_path.display(),
        workers = config.worker_count,
        "starting wirl server"
    );

    let db = Database::connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    let templates = Arc::new(TemplateStore::new(config.definitions_path.clone()));
    let checkpoints = Arc::new(PostgresCheckpointStore::new(db.pool().clone()));

    let resolver: Arc<dyn CallableResolver> = match &config.functions_module {
        Some(module) => Arc::new(SubprocessResolver::new(module.clone())),
        None => {
            warn!("WIRL_FUNCTIONS_MODULE not set; every run will fail callable resolution");
            Arc::new(InProcessRegistry::new())
        }
    };

    let api = ApiServer::start(
        config.http_addr,
        db.clone(),
        Arc::clone(&templates),
        checkpoints.clone(),
    )
    .await
    .context("failed to start api server")?;

    let mut workers = WorkerPool::new(
        db.clone(),
        Arc::clone(&templates),
        resolver,
        checkpoints,
        WorkerPoolConfig {
            worker_count: config.worker_count,
            max_concurrent_runs: config.max_concurrent_runs,
            stale_timeout_secs: config.stale_timeout_secs,
            poll_interval: Duration::from_secs(config.worker_poll_secs),
            checkpoint_ttl_secs: config.checkpoint_ttl_secs,
        },
    );
    workers.start();

    let mut scheduler = TriggerScheduler::new(
        db,
        templates,
        Duration::from_secs(config.scheduler_interval_secs),
    );
    scheduler.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    scheduler.shutdown().await;
    workers.shutdown().await;
    api.shutdown().await;
    info!("shutdown complete");
    Ok(())
}
