//! `serve` command: load the cache, then run the HTTP evaluator
//!
//! The cache is fully built before the listening socket is bound, so clients
//! never reach a half-initialized evaluator.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::evaluator::cache::Cache;
use crate::evaluator::Evaluator;
use crate::server;
use crate::storage::SqliteStore;

pub fn run(database: &Path, port: u16) -> Result<()> {
    tracing::info!("Sqlite DB file: {}", database.display());
    if !database.exists() {
        bail!(
            "Database not found: {} (run `ovaleval init-db` first)",
            database.display()
        );
    }

    let store = SqliteStore::open(database).context("Failed to open database")?;
    let cache = Cache::load(&store)?;
    drop(store);

    let evaluator = Arc::new(Evaluator::new(cache));

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(server::serve(port, evaluator))
}
