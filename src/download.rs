//! Bundle download with integrity checking and live progress.

use crate::conditions::Stage;
use crate::error::{InstallerError, Result};
use crate::progress::ProgressTask;
use crate::status::StatusHandle;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Sampling period for the download progress reporter.
const REPORT_PERIOD: Duration = Duration::from_secs(3);

/// Shared byte counters the reporter samples while the transfer blocks.
#[derive(Default)]
struct TransferProgress {
    received: AtomicU64,
    total: AtomicU64,
}

impl TransferProgress {
    fn percent(&self) -> u32 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        let received = self.received.load(Ordering::Relaxed);
        ((received * 100) / total).min(100) as u32
    }
}

/// Downloads the installation bundle to a local path and verifies its
/// SHA-256 against the expected value.
pub struct Downloader {
    url: String,
    dest: PathBuf,
    expected_sha256: String,
}

impl Downloader {
    pub fn new(url: &str, dest: &Path, expected_sha256: &str) -> Self {
        Self {
            url: url.to_string(),
            dest: dest.to_path_buf(),
            expected_sha256: expected_sha256.to_lowercase(),
        }
    }

    /// Fetch the bundle. A file already present with a matching checksum
    /// succeeds immediately without a transfer. One retry on transfer
    /// failure; the second failure surfaces.
    pub async fn fetch(&self, status: &StatusHandle) -> Result<()> {
        if let Some(actual) = sha256_of(&self.dest).await? {
            if actual == self.expected_sha256 {
                info!("bundle already present with matching checksum, skipping download");
                return Ok(());
            }
            info!("bundle present but checksum differs, downloading again");
        }

        let transfer = Arc::new(TransferProgress::default());
        let reporter = {
            let transfer = transfer.clone();
            let status = status.clone();
            ProgressTask::spawn(REPORT_PERIOD, move || {
                let transfer = transfer.clone();
                let status = status.clone();
                async move {
                    let percent = transfer.percent();
                    // Keep the reported value slightly under the raw
                    // percentage so the stage never looks done before the
                    // final checksum verification.
                    let skewed = percent.saturating_sub(percent * 5 / 100);
                    if status.set_progress(Stage::DownloadPackage, skewed).await {
                        if let Err(e) = status.persist().await {
                            warn!("persist download progress: {e}");
                        }
                    }
                }
            })
        };

        let mut outcome = self.transfer(&transfer).await;
        if let Err(e) = &outcome {
            warn!("download bundle from {}: {e}, retrying once", self.url);
            status
                .set_reason(
                    Stage::DownloadPackage,
                    "DownloadRetried",
                    &format!("download failed, retrying: {e}"),
                )
                .await;
            if let Err(e) = status.persist().await {
                warn!("persist download retry reason: {e}");
            }
            transfer.received.store(0, Ordering::Relaxed);
            outcome = self.transfer(&transfer).await;
        }
        reporter.stop().await;

        outcome?;
        info!("successfully downloaded bundle from {}", self.url);
        Ok(())
    }

    /// One streaming transfer attempt, hashing as it writes.
    async fn transfer(&self, progress: &TransferProgress) -> Result<()> {
        let response = reqwest::Client::new().get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(InstallerError::Download(format!(
                "fetching {} returned {}",
                self.url,
                response.status()
            )));
        }
        if let Some(total) = response.content_length() {
            progress.total.store(total, Ordering::Relaxed);
        }

        if let Some(parent) = self.dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&self.dest).await?;
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| InstallerError::Download(format!("read body: {e}")))?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            progress
                .received
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        file.sync_all().await?;

        let actual = hex_digest(hasher);
        if actual != self.expected_sha256 {
            return Err(InstallerError::ChecksumMismatch {
                expected: self.expected_sha256.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// SHA-256 of a file, or `None` when it does not exist.
pub async fn sha256_of(path: &Path) -> Result<Option<String>> {
    use tokio::io::AsyncReadExt;

    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Some(hex_digest(hasher)))
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
