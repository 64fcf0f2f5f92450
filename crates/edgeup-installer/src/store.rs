use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;

/// Where release assets are read from. Writes the complete content of
/// `location` to `destination`.
pub trait ArtifactStore: Send + Sync {
    fn fetch_to(&self, location: &str, destination: &Path) -> Result<u64>;
}

impl<T: ArtifactStore + ?Sized> ArtifactStore for Box<T> {
    fn fetch_to(&self, location: &str, destination: &Path) -> Result<u64> {
        (**self).fetch_to(location, destination)
    }
}

/// Serves `http`/`https` locations over the network and `file://` or bare
/// paths from the local filesystem.
pub struct HttpArtifactStore {
    client: Client,
}

impl HttpArtifactStore {
    /// `transfer_timeout` bounds the whole request, body included, so a
    /// stalled server cannot hold a run forever.
    pub fn new(
        user_agent: &str,
        connect_timeout: Duration,
        transfer_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent.to_string())
            .connect_timeout(connect_timeout)
            .timeout(transfer_timeout)
            .build()
            .context("failed to build download HTTP client")?;
        Ok(Self { client })
    }

    fn fetch_http(&self, url: &str, destination: &Path) -> Result<u64> {
        let mut response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("failed to connect to {url}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("HTTP {status}: {url}"));
        }

        let file = File::create(destination)
            .with_context(|| format!("failed to create {}", destination.display()))?;
        let mut writer = BufWriter::new(file);
        let written = io::copy(&mut response, &mut writer)
            .with_context(|| format!("failed to read response body from {url}"))?;
        writer
            .flush()
            .with_context(|| format!("failed to flush {}", destination.display()))?;

        if let Some(expected) = response.content_length() {
            if expected != written {
                return Err(anyhow!(
                    "truncated download from {url}: expected {expected} bytes, got {written}"
                ));
            }
        }
        Ok(written)
    }
}

impl ArtifactStore for HttpArtifactStore {
    fn fetch_to(&self, location: &str, destination: &Path) -> Result<u64> {
        if location.starts_with("http://") || location.starts_with("https://") {
            return self.fetch_http(location, destination);
        }
        copy_local(&local_path(location)?, destination)
    }
}

fn local_path(location: &str) -> Result<PathBuf> {
    if let Some(path) = location.strip_prefix("file://") {
        return Ok(PathBuf::from(path));
    }
    if location.contains("://") {
        return Err(anyhow!("unsupported asset location scheme: {location}"));
    }
    Ok(PathBuf::from(location))
}

fn copy_local(source: &Path, destination: &Path) -> Result<u64> {
    fs::copy(source, destination).with_context(|| {
        format!(
            "failed to copy {} to {}",
            source.display(),
            destination.display()
        )
    })
}
