//! `sync` command: parse downloaded metadata and populate the store

use std::path::Path;

use anyhow::{bail, Context, Result};
use colored::Colorize;

use crate::parsers::feed::OvalFeed;
use crate::parsers::oval_stream::parse_oval_stream_file;
use crate::parsers::repo_cpe_map::RepoCpeMap;
use crate::storage::oval_store::OvalStore;
use crate::storage::repo_cpe_store::RepoCpeStore;
use crate::storage::SqliteStore;
use crate::unpack::unpack_file;

pub fn run(database: &Path, metadata_dir: &Path, force: bool) -> Result<()> {
    let store = SqliteStore::open(database)?;
    store.initialize().context("Failed to initialize schema")?;
    sync_metadata(&store, metadata_dir, force)
}

/// Import the repository-to-CPE mapping and every downloaded OVAL stream.
pub fn sync_metadata(store: &SqliteStore, metadata_dir: &Path, force: bool) -> Result<()> {
    let map_path = metadata_dir.join("repository-to-cpe.json");
    if map_path.exists() {
        let arch_names = store.arch_map()?.into_keys().collect();
        let map = RepoCpeMap::from_file(&map_path, &arch_names)?;
        RepoCpeStore::new(store).store(&map)?;
        println!("{} Synchronized repository-to-CPE mapping", "✓".green());
    } else {
        tracing::warn!(
            "CPE mapping not found: {} (run `ovaleval download` first)",
            map_path.display()
        );
    }

    let feed_path = metadata_dir.join("feed.json");
    if !feed_path.exists() {
        bail!(
            "OVAL feed not found: {} (run `ovaleval download` first)",
            feed_path.display()
        );
    }

    let feed = OvalFeed::from_file(&feed_path)?;
    let oval_store = OvalStore::new(store);
    let mut imported = 0;
    let mut skipped = 0;

    for stream in &feed.streams {
        if !stream.local_path.exists() {
            tracing::warn!(
                "OVAL stream {} not downloaded, skipping: {}",
                stream.id,
                stream.local_path.display()
            );
            continue;
        }

        let Some(stream_id) = oval_store.upsert_stream(&stream.id, stream.updated, force)? else {
            tracing::debug!("OVAL stream {} is unchanged, skipping", stream.id);
            skipped += 1;
            continue;
        };

        let unpacked = unpack_file(&stream.local_path)?;
        let parsed = parse_oval_stream_file(&unpacked)?;
        oval_store
            .store_stream(stream_id, &parsed)
            .with_context(|| format!("Failed to import OVAL stream {}", stream.id))?;
        tracing::info!(
            "Imported OVAL stream {}: {} definitions, {} tests",
            stream.id,
            parsed.definitions.len(),
            parsed.tests.len()
        );
        imported += 1;
    }

    println!(
        "{} Synchronized OVAL streams: {} imported, {} unchanged",
        "✓".green(),
        imported,
        skipped
    );
    Ok(())
}
