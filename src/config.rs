//! Server configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Backend configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// HTTP server bind address
    pub http_addr: SocketAddr,

    /// Directory scanned for `.wirl` workflow templates
    pub definitions_path: PathBuf,

    /// Executable module that resolves node call targets (subprocess binding)
    pub functions_module: Option<PathBuf>,

    /// Number of worker tasks claiming runs
    pub worker_count: usize,

    /// Max concurrently executing runs per worker process
    pub max_concurrent_runs: usize,

    /// Seconds after which an unrefreshed claim becomes reclaimable
    pub stale_timeout_secs: i64,

    /// Seconds between trigger scheduler ticks
    pub scheduler_interval_secs: u64,

    /// Seconds between idle worker queue polls
    pub worker_poll_secs: u64,

    /// Seconds a terminal run's checkpoints are retained
    pub checkpoint_ttl_secs: i64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let http_addr: SocketAddr = std::env::var("WIRL_HTTP_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8000".to_string())
            .parse()?;

        let definitions_path = PathBuf::from(
            std::env::var("WORKFLOW_DEFINITIONS_PATH")
                .unwrap_or_else(|_| "workflow_definitions".to_string()),
        );

        let functions_module = std::env::var("WIRL_FUNCTIONS_MODULE")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let worker_count: usize = std::env::var("WIRL_WORKER_COUNT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(num_cpus::get);

        let max_concurrent_runs: usize = std::env::var("WIRL_MAX_CONCURRENT_RUNS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8);

        let stale_timeout_secs: i64 = std::env::var("WIRL_STALE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);

        let scheduler_interval_secs: u64 = std::env::var("WIRL_SCHEDULER_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(15);

        let worker_poll_secs: u64 = std::env::var("WIRL_WORKER_POLL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let checkpoint_ttl_secs: i64 = std::env::var("WIRL_CHECKPOINT_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(7 * 24 * 3600);

        Ok(Config {
            database_url,
            http_addr,
            definitions_path,
            functions_module,
            worker_count,
            max_concurrent_runs,
            stale_timeout_secs,
            scheduler_interval_secs,
            worker_poll_secs,
            checkpoint_ttl_secs,
        })
    }
}
