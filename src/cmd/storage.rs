use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::StorageConfig;
use crate::history::HistoryStore;
use crate::server::{self, storage};

pub async fn run(config: StorageConfig) -> Result<()> {
    let store = HistoryStore::open(&config.database)
        .with_context(|| format!("Failed to open database {}", config.database.display()))?;
    let store = Arc::new(store);

    server::serve(
        config.addr,
        move |req| storage::handle(req, store.clone()),
        server::shutdown_signal(),
    )
    .await
    .with_context(|| format!("Storage server on {} failed", config.addr))?;

    info!("storage stopped");
    Ok(())
}
