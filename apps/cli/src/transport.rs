//! Reference HTTP transport
//!
//! Streams a bit to `<dir>/<hash>/<file_name>`, reporting a snapshot per
//! chunk. Bits already on disk with the expected size are not fetched again.

use anyhow::Context;
use async_trait::async_trait;
use bitsync_core::{BitTransport, ProgressSink};
use bitsync_types::{Bit, BitTotals, TransferSnapshot};
use futures::StreamExt;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Failures of a single fetch attempt
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Server error: {status}")]
    ServerError { status: u16 },

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

impl FetchError {
    /// Check if another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(_) | FetchError::SizeMismatch { .. } => true,
            FetchError::ServerError { status } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

pub struct HttpTransport {
    client: Client,
    dir: PathBuf,
    max_retries: u32,
    retry_delay: Duration,
}

impl HttpTransport {
    pub fn new(dir: PathBuf, max_retries: u32) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(concat!("bitsync/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            dir,
            max_retries,
            retry_delay: Duration::from_secs(2),
        })
    }

    /// Where a bit lives on disk; `None` without a file name
    pub fn bit_path(&self, bit: &Bit) -> Option<PathBuf> {
        let file_name = bit.file_name.as_ref()?;
        Some(self.dir.join(&bit.hash).join(file_name))
    }

    async fn fetch_once(
        &self,
        bit: &Bit,
        link: &str,
        path: &Path,
        progress: &mut Reporter,
    ) -> Result<(), FetchError> {
        let expected = bit.size.unwrap_or(0);
        let response = self.client.get(link).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::ServerError {
                status: status.as_u16(),
            });
        }

        let max = response.content_length().unwrap_or(expected);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = part_path(path);
        let mut file = tokio::fs::File::create(&part).await?;

        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();
        progress.report(bit, downloaded, max);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            progress.report(bit, downloaded, max);
        }
        file.flush().await?;
        drop(file);

        if expected > 0 && downloaded != expected {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(FetchError::SizeMismatch {
                expected,
                actual: downloaded,
            });
        }

        tokio::fs::rename(&part, path).await?;
        Ok(())
    }
}

#[async_trait]
impl BitTransport for HttpTransport {
    async fn fetch(&self, bit: Bit, progress: ProgressSink) -> anyhow::Result<Vec<Bit>> {
        let link = bit
            .download_link
            .clone()
            .with_context(|| format!("bit {} has no download link", bit.hash))?;
        url::Url::parse(&link).map_err(|_| FetchError::InvalidUrl(link.clone()))?;
        let path = self
            .bit_path(&bit)
            .with_context(|| format!("bit {} has no file name", bit.hash))?;

        if is_installed(&path, bit.size).await {
            debug!(hash = %bit.hash, path = %path.display(), "Bit already on disk");
            let size = bit.size.unwrap_or(0);
            progress.report(snapshot(&bit, size, size));
            return Ok(vec![bit]);
        }

        let mut reporter = Reporter::new(progress);
        let mut attempt = 0;
        loop {
            match self.fetch_once(&bit, &link, &path, &mut reporter).await {
                Ok(()) => {
                    info!(hash = %bit.hash, path = %path.display(), "Bit stored");
                    return Ok(vec![bit]);
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(hash = %bit.hash, attempt, error = %e, "Fetch failed, retrying");
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Forwards byte counts to the coordinator, holding back a restarted attempt
/// until it passes what an earlier attempt already reported
struct Reporter {
    sink: ProgressSink,
    high_water: Option<u64>,
}

impl Reporter {
    fn new(sink: ProgressSink) -> Self {
        Self {
            sink,
            high_water: None,
        }
    }

    /// Whether `downloaded` moves the reported progress forward
    fn advance(&mut self, downloaded: u64) -> bool {
        match self.high_water {
            Some(high) if downloaded < high => false,
            _ => {
                self.high_water = Some(downloaded);
                true
            }
        }
    }

    fn report(&mut self, bit: &Bit, downloaded: u64, max: u64) {
        if self.advance(downloaded) {
            self.sink.report(snapshot(bit, downloaded, max));
        }
    }
}

fn snapshot(bit: &Bit, downloaded: u64, max: u64) -> TransferSnapshot {
    TransferSnapshot::from_totals(bit.clone(), vec![bit.clone()], BitTotals::new(downloaded, max))
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

/// Present on disk with the expected size
async fn is_installed(path: &Path, size: Option<u64>) -> bool {
    match (tokio::fs::metadata(path).await, size) {
        (Ok(meta), Some(size)) => meta.is_file() && meta.len() == size,
        _ => false,
    }
}
