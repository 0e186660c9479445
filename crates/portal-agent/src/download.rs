use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::Context;
use futures_util::StreamExt;
use reqwest::Url;
use tokio::io::AsyncWriteExt;

use crate::error::{PortalError, Result, format_error_chain};
use crate::progress::ProgressSink;

#[derive(Debug, Clone, serde::Deserialize)]
struct LinksResponse {
    result: LinksResult,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct LinksResult {
    links: Vec<DownloadLink>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadLink {
    download_type: Option<String>,
    download_url: Option<String>,
}

/// Result of a completed download.
#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub path: PathBuf,
    pub url: String,
    pub downloaded_bytes: u64,
}

fn download_chunk_threshold(total_bytes: u64) -> u64 {
    if total_bytes >= 512 * 1024 * 1024 {
        4 * 1024 * 1024
    } else {
        1024 * 1024
    }
}

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(concat!("portal-agent/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Picks the URL of the first link whose `downloadType` equals `variant` exactly.
fn select_link(links: &[DownloadLink], variant: &str) -> Option<String> {
    links
        .iter()
        .find(|l| l.download_type.as_deref() == Some(variant))
        .and_then(|l| l.download_url.clone())
}

/// File name taken from the last path segment of the URL.
fn file_name_from_url(url: &Url) -> Option<String> {
    url.path_segments()?
        .next_back()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Removes an in-progress download unless it was persisted. Covers errors and
/// futures dropped mid-transfer alike.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Fetches server packages: asks the metadata endpoint for the link matching
/// the configured variant tag and streams it into the image store.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    endpoint: String,
    download_type: String,
    images_dir: PathBuf,
}

impl Downloader {
    pub fn new(
        endpoint: impl Into<String>,
        download_type: impl Into<String>,
        images_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client: build_client(),
            endpoint: endpoint.into(),
            download_type: download_type.into(),
            images_dir: images_dir.into(),
        }
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    pub fn download_type(&self) -> &str {
        &self.download_type
    }

    pub async fn resolve_download_url(&self, variant: &str) -> Result<String> {
        let links: LinksResponse = async {
            self.client
                .get(&self.endpoint)
                .send()
                .await
                .context("fetch download links")?
                .error_for_status()
                .context("fetch download links (status)")?
                .json::<LinksResponse>()
                .await
                .context("parse download links")
        }
        .await
        .map_err(|e: anyhow::Error| PortalError::Resolution(format_error_chain(&e)))?;

        select_link(&links.result.links, variant).ok_or_else(|| {
            PortalError::Resolution(format!("no download link for {variant}"))
        })
    }

    /// Downloads the package for the configured variant into the image store,
    /// replacing any earlier image with the same file name.
    pub async fn download(&self, progress: &dyn ProgressSink) -> Result<DownloadReport> {
        let url = self
            .resolve_download_url(&self.download_type)
            .await
            .map_err(|e| PortalError::Download(e.to_string()))?;

        self.download_from(&url, progress)
            .await
            .map_err(|e| PortalError::Download(format_error_chain(&e)))
    }

    async fn download_from(
        &self,
        raw_url: &str,
        progress: &dyn ProgressSink,
    ) -> anyhow::Result<DownloadReport> {
        let url = Url::parse(raw_url).with_context(|| format!("invalid download url {raw_url}"))?;
        let file_name = file_name_from_url(&url)
            .ok_or_else(|| anyhow::anyhow!("cannot derive a file name from {url}"))?;
        let dest = self.images_dir.join(&file_name);
        let part = self.images_dir.join(format!("{file_name}.part"));

        progress.report(&format!("downloading {file_name}"));
        tracing::info!(%url, dest = %dest.display(), "download started");

        tokio::fs::create_dir_all(&self.images_dir)
            .await
            .with_context(|| format!("create {}", self.images_dir.display()))?;

        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .context("request package")?
            .error_for_status()
            .context("request package (status)")?;

        let total_bytes = resp.content_length().unwrap_or(0);
        let threshold = download_chunk_threshold(total_bytes);

        let mut guard = PartialFile::new(part.clone());
        let mut file = tokio::fs::File::create(&part)
            .await
            .with_context(|| format!("create {}", part.display()))?;

        let mut stream = resp.bytes_stream();
        let mut downloaded_bytes = 0u64;
        let mut last_emit_bytes = 0u64;
        let mut last_emit_at = Instant::now();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("read package body chunk")?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("write {}", part.display()))?;
            downloaded_bytes = downloaded_bytes.saturating_add(chunk.len() as u64);

            let now = Instant::now();
            if downloaded_bytes.saturating_sub(last_emit_bytes) >= threshold
                || now.duration_since(last_emit_at) >= Duration::from_millis(300)
            {
                if total_bytes > 0 {
                    progress.report(&format!(
                        "downloading {file_name}: {downloaded_bytes}/{total_bytes} bytes"
                    ));
                } else {
                    progress.report(&format!("downloading {file_name}: {downloaded_bytes} bytes"));
                }
                last_emit_bytes = downloaded_bytes;
                last_emit_at = now;
            }
        }

        file.flush().await.context("flush package")?;
        file.sync_all().await.context("sync package")?;
        drop(file);

        tokio::fs::rename(&part, &dest)
            .await
            .with_context(|| format!("move {} into place", part.display()))?;
        guard.disarm();

        progress.report(&format!("downloaded {file_name} ({downloaded_bytes} bytes)"));
        tracing::info!(dest = %dest.display(), bytes = downloaded_bytes, "download finished");

        Ok(DownloadReport {
            path: dest,
            url: url.to_string(),
            downloaded_bytes,
        })
    }
}
