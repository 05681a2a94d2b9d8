//! Standalone worker process: recovers interrupted analyses, then executes
//! queued ones until interrupted.
//!
//! Usage: `vidscan-worker [config.json]`. Without a path, `VIDSCAN_CONFIG` is
//! consulted and built-in defaults apply when neither is set.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use vidscan::config::load_config;
use vidscan::db::Database;
use vidscan::{
    init_logging, AnalysisQueue, Config, HttpEngineClient, MemoryCache, Orchestrator,
    UrlVideoLocator, VidscanError,
};

/// Completed queue entries older than this are pruned at startup.
const COMPLETED_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

fn resolve_config() -> Result<Config, VidscanError> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("VIDSCAN_CONFIG").ok());
    let mut config = match path {
        Some(path) => load_config(&path)?,
        None => Config::default(),
    };
    config.apply_env_overrides();
    Ok(config)
}

async fn run(config: Config) -> Result<(), VidscanError> {
    let db = match config.database_path() {
        Some(path) => Database::open(&path)?,
        None => {
            warn!("No home directory found; using an in-memory database");
            Database::open_in_memory()?
        }
    };

    let queue = Arc::new(AnalysisQueue::new(db.clone(), &config.queue));
    let engine = Arc::new(HttpEngineClient::new(&config.engine)?);
    let locator = Arc::new(UrlVideoLocator::from_config(&config.storage));
    let cache = Arc::new(MemoryCache::from_config(&config.cache));

    let orchestrator = Orchestrator::new(db, Arc::clone(&queue), engine, locator, cache, &config);

    let report = orchestrator.recover_interrupted()?;
    info!(
        "Startup recovery done: {} requeued, {} failed, {} re-enqueued",
        report.requeued, report.failed, report.reenqueued
    );
    match queue.prune_finished(COMPLETED_RETENTION) {
        Ok(0) => {}
        Ok(pruned) => info!("Pruned {} finished queue entries", pruned),
        Err(e) => warn!("Failed to prune finished queue entries: {}", e),
    }

    let pool = orchestrator.start_workers(config.queue.concurrency);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down...");

    queue.close();
    pool.abort();
    pool.wait().await;

    info!("vidscan-worker stopped");
    Ok(())
}

#[tokio::main]
async fn main() {
    let config = match resolve_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("vidscan-worker: {}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("vidscan-worker: {}", e);
        std::process::exit(2);
    }

    info!("Starting vidscan-worker v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(config).await {
        error!("vidscan-worker failed: {}", e);
        std::process::exit(1);
    }
}
