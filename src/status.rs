//! Persisted package status and the store boundary.
//!
//! The whole condition set plus the pushed-image bookkeeping is persisted as
//! one record with an opaque concurrency token. Writes are optimistic:
//! re-fetch the latest revision, copy its token over, write, and retry the
//! whole sequence a bounded number of times on conflict.

use crate::conditions::{Condition, ConditionSet, ConditionStatus, Stage};
use crate::error::{InstallerError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Conflict-retry budget for one persist call.
const PERSIST_ATTEMPTS: u32 = 5;
/// Backoff between conflict retries.
const PERSIST_BACKOFF: Duration = Duration::from_millis(10);

/// A destination reference that was successfully pushed this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushedImage {
    pub name: String,
}

/// The full persisted status record for one package.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageStatus {
    /// Concurrency token assigned by the store on every successful write.
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub conditions: ConditionSet,
    /// Total images the PushImage stage intends to push this attempt.
    #[serde(default)]
    pub images_number: u32,
    /// Destination references pushed so far this attempt, append-only.
    #[serde(default)]
    pub images_pushed: Vec<PushedImage>,
}

/// Storage boundary for [`PackageStatus`].
///
/// `put` must reject a record whose revision does not match the stored one
/// with [`InstallerError::Conflict`]; concurrency safety for the backing
/// record lives here, not in in-process locking.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn get(&self) -> Result<PackageStatus>;

    /// Optimistic write. Returns the new revision on success.
    async fn put(&self, status: &PackageStatus) -> Result<u64>;
}

/// Shared in-pass view of the package status.
///
/// The reconciler and the background progress reporters both write through
/// one handle; clones share the same underlying record.
#[derive(Clone)]
pub struct StatusHandle {
    store: Arc<dyn StatusStore>,
    status: Arc<Mutex<PackageStatus>>,
}

impl StatusHandle {
    pub fn new(store: Arc<dyn StatusStore>, status: PackageStatus) -> Self {
        Self {
            store,
            status: Arc::new(Mutex::new(status)),
        }
    }

    pub async fn condition(&self, stage: Stage) -> Option<Condition> {
        self.status.lock().await.conditions.get(stage).cloned()
    }

    pub async fn snapshot(&self) -> PackageStatus {
        self.status.lock().await.clone()
    }

    pub async fn set_status(&self, stage: Stage, status: ConditionStatus) {
        self.status.lock().await.conditions.set_status(stage, status);
    }

    pub async fn set_reason(&self, stage: Stage, reason: &str, message: &str) {
        self.status
            .lock()
            .await
            .conditions
            .set_reason(stage, reason, message);
    }

    /// Clamped progress write; returns whether the stored value changed.
    pub async fn set_progress(&self, stage: Stage, progress: u32) -> bool {
        self.status
            .lock()
            .await
            .conditions
            .set_progress(stage, progress)
    }

    /// Start a fresh push attempt: fix the expected total and drop any
    /// pushed-image records from earlier attempts.
    pub async fn reset_pushed(&self, images_number: u32) {
        let mut status = self.status.lock().await;
        status.images_number = images_number;
        status.images_pushed.clear();
    }

    /// Record one pushed image; returns (pushed so far, expected total).
    pub async fn record_pushed(&self, name: &str) -> (u32, u32) {
        let mut status = self.status.lock().await;
        status.images_pushed.push(PushedImage {
            name: name.to_string(),
        });
        (status.images_pushed.len() as u32, status.images_number)
    }

    /// Write the whole record back: read the latest stored revision, copy
    /// its token over, write, and retry on conflict up to the budget.
    pub async fn persist(&self) -> Result<()> {
        let mut attempt = 0;
        loop {
            let latest = self.store.get().await?;
            let outcome = {
                let mut status = self.status.lock().await;
                status.revision = latest.revision;
                self.store.put(&status).await
            };
            match outcome {
                Ok(revision) => {
                    self.status.lock().await.revision = revision;
                    return Ok(());
                }
                Err(InstallerError::Conflict) => {
                    attempt += 1;
                    if attempt >= PERSIST_ATTEMPTS {
                        tracing::error!(
                            "status write conflicted {attempt} times, giving up this pass"
                        );
                        return Err(InstallerError::Conflict);
                    }
                    tokio::time::sleep(PERSIST_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// In-process [`StatusStore`] with real revision checking.
///
/// Backs embedded runs and tests; a cluster deployment would put the record
/// behind its API server instead.
#[derive(Default)]
pub struct MemoryStatusStore {
    inner: std::sync::Mutex<PackageStatus>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn get(&self) -> Result<PackageStatus> {
        let guard = self
            .inner
            .lock()
            .map_err(|e| InstallerError::Status(format!("status store poisoned: {e}")))?;
        Ok(guard.clone())
    }

    async fn put(&self, status: &PackageStatus) -> Result<u64> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|e| InstallerError::Status(format!("status store poisoned: {e}")))?;
        if status.revision != guard.revision {
            return Err(InstallerError::Conflict);
        }
        *guard = status.clone();
        guard.revision += 1;
        Ok(guard.revision)
    }
}
