//! `download` command: fetch vendor metadata
//!
//! Retrieves the repository-to-CPE map, the OVAL feed, and every stream
//! archive the feed lists, mirroring the upstream layout under the metadata
//! directory. A failing stream does not abort the remaining downloads.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use colored::Colorize;

use crate::download::Downloader;
use crate::parsers::feed::{OvalFeed, OVAL_FEED_BASE_URL};

const REPO_CPE_MAP_URL: &str =
    "https://access.redhat.com/security/data/metrics/repository-to-cpe.json";

pub fn run(metadata_dir: &Path) -> Result<()> {
    fs::create_dir_all(metadata_dir).with_context(|| {
        format!("Failed to create metadata directory: {}", metadata_dir.display())
    })?;

    let downloader = Downloader::new()?;

    downloader
        .download(REPO_CPE_MAP_URL, &metadata_dir.join("repository-to-cpe.json"))
        .context("Failed to download repository-to-CPE mapping")?;
    println!("{} Downloaded repository-to-CPE mapping", "✓".green());

    let feed_path = metadata_dir.join("feed.json");
    downloader
        .download(&format!("{OVAL_FEED_BASE_URL}feed.json"), &feed_path)
        .context("Failed to download OVAL feed")?;
    println!("{} Downloaded OVAL feed", "✓".green());

    let feed = OvalFeed::from_file(&feed_path)?;
    let total = feed.streams.len();
    let mut failed = 0;

    for (idx, stream) in feed.streams.iter().enumerate() {
        match downloader.download(&stream.url, &stream.local_path) {
            Ok(()) => {
                tracing::info!("Downloaded OVAL stream {} [{}/{}]", stream.id, idx + 1, total);
            }
            Err(e) => {
                tracing::error!("Failed to download OVAL stream {}: {}", stream.id, e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        println!(
            "{} Downloaded {} of {} OVAL streams ({} failed)",
            "!".yellow(),
            total - failed,
            total,
            failed
        );
        if failed == total {
            bail!("All OVAL stream downloads failed");
        }
    } else {
        println!("{} Downloaded {} OVAL streams", "✓".green(), total);
    }

    Ok(())
}
