use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::AnalyzerConfig;
use crate::server::{self, analyzer};
use crate::task::Collaborators;
use crate::task::queue::{TaskQueue, WorkerPool};

pub async fn run(config: AnalyzerConfig) -> Result<()> {
    let scratch_dir = config.analysis.scratch_dir();
    std::fs::create_dir_all(&scratch_dir)
        .with_context(|| format!("Failed to create scratch directory {}", scratch_dir.display()))?;

    let collaborators = Arc::new(Collaborators::layout(&config.analysis.store_dir));
    let queue = Arc::new(TaskQueue::new(scratch_dir, config.analysis.task_timeout()));
    let (jobs, pool) = WorkerPool::spawn(config.workers, collaborators);
    info!(
        workers = config.workers,
        store = %config.analysis.store_dir.display(),
        "analyzer starting"
    );

    let state = analyzer::AnalyzerState::new(queue.clone(), jobs);
    let served = server::serve(
        config.addr,
        move |req| analyzer::handle(req, state.clone()),
        server::shutdown_signal(),
    )
    .await;

    // Cancel whatever is still running so the workers drain quickly
    if !queue.is_empty() {
        info!(tasks = queue.len(), "cancelling remaining tasks");
    }
    let failures = queue.cleanup_all();
    if !failures.is_empty() {
        warn!(count = failures.len(), "some tasks could not be cleaned up");
    }
    pool.join().await;
    info!("analyzer stopped");

    served.with_context(|| format!("Analyzer server on {} failed", config.addr))
}
