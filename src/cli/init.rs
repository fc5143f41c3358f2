//! `init-db` command: create the schema, then optionally run a full sync

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;

use crate::cli::sync;
use crate::storage::SqliteStore;

pub fn run(database: &Path, schema_only: bool, metadata_dir: &Path) -> Result<()> {
    let store = SqliteStore::open(database)?;
    store.initialize().context("Failed to initialize schema")?;
    println!(
        "{} Initialized database schema: {}",
        "✓".green(),
        database.display()
    );

    if schema_only {
        return Ok(());
    }

    sync::sync_metadata(&store, metadata_dir, false)
}
