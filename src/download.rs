//! Metadata download client
//!
//! Fetches vendor metadata (the repository-to-CPE map, the OVAL feed and the
//! stream archives it lists) over HTTPS with retry logic. Downloads go to a
//! `.part` file first and are renamed into place only on success.

use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;

/// Maximum number of attempts per URL
const MAX_RETRIES: u32 = 3;

/// Timeout for connecting to a server
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the entire download (stream archives run to tens of MB)
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Download manager for vendor metadata
pub struct Downloader {
    client: Client,
}

impl Downloader {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(DOWNLOAD_TIMEOUT)
            .user_agent(format!("ovaleval/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    /// Download `url` to `dest`, creating parent directories as needed.
    pub fn download(&self, url: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory: {}", parent.display())
                })?;
            }
        }

        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 1..=MAX_RETRIES {
            if attempt > 1 {
                tracing::info!("Retry attempt {} of {}: {}", attempt, MAX_RETRIES, url);
                std::thread::sleep(Duration::from_secs(2_u64.pow(attempt - 1)));
            }

            match self.download_single(url, dest) {
                Ok(()) => {
                    tracing::debug!("Downloaded {} -> {}", url, dest.display());
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("Attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("Download failed after {MAX_RETRIES} retries")))
    }

    fn download_single(&self, url: &str, dest: &Path) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("Failed to connect to: {url}"))?;

        if !response.status().is_success() {
            bail!("HTTP error {}: {}", response.status(), url);
        }

        let temp_path = dest.with_extension("part");
        let mut file = File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;

        let mut buffer = [0u8; 8192];
        let mut reader = BufReader::new(response);

        loop {
            let bytes_read = reader
                .read(&mut buffer)
                .context("Failed to read from network")?;
            if bytes_read == 0 {
                break;
            }
            file.write_all(&buffer[..bytes_read])
                .context("Failed to write to file")?;
        }

        file.flush().context("Failed to flush file")?;
        drop(file);

        fs::rename(&temp_path, dest).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                temp_path.display(),
                dest.display()
            )
        })?;

        Ok(())
    }
}
