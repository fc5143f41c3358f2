//! Vendor OVAL feed (`feed.json`)
//!
//! The feed lists one entry per OVAL stream: upstream id, archive URL and
//! last-updated timestamp. Local paths mirror the upstream layout under the
//! directory the feed was downloaded to.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use serde::Deserialize;

pub const OVAL_FEED_BASE_URL: &str = "https://access.redhat.com/security/data/oval/v2/";

#[derive(Debug, Deserialize)]
struct FeedFile {
    feed: FeedBody,
}

#[derive(Debug, Deserialize)]
struct FeedBody {
    entry: Vec<FeedEntry>,
}

#[derive(Debug, Deserialize)]
struct FeedEntry {
    id: String,
    updated: DateTime<FixedOffset>,
    content: FeedContent,
}

#[derive(Debug, Deserialize)]
struct FeedContent {
    src: String,
}

/// One OVAL stream listed in the feed
#[derive(Debug, Clone)]
pub struct FeedStream {
    pub id: String,
    pub url: String,
    pub local_path: PathBuf,
    pub updated: DateTime<FixedOffset>,
}

#[derive(Debug)]
pub struct OvalFeed {
    pub streams: Vec<FeedStream>,
}

impl OvalFeed {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read feed: {}", path.display()))?;
        let metadata_dir = path.parent().unwrap_or_else(|| Path::new(""));
        Self::parse(&data, metadata_dir)
            .with_context(|| format!("Failed to parse feed: {}", path.display()))
    }

    fn parse(data: &str, metadata_dir: &Path) -> Result<Self> {
        let parsed: FeedFile = serde_json::from_str(data).context("Invalid feed JSON")?;

        let streams = parsed
            .feed
            .entry
            .into_iter()
            .map(|entry| {
                let relative = entry
                    .content
                    .src
                    .strip_prefix(OVAL_FEED_BASE_URL)
                    .unwrap_or(&entry.content.src)
                    .to_string();
                FeedStream {
                    id: entry.id,
                    local_path: metadata_dir.join(relative),
                    url: entry.content.src,
                    updated: entry.updated,
                }
            })
            .collect();

        Ok(Self { streams })
    }
}
