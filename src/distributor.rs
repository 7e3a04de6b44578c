//! Image distribution: moving platform images into the destination registry.
//!
//! Two mutually exclusive strategies, selected by install mode:
//! pull-and-push walks the fixed image mapping and pulls from the mirror;
//! load-and-push walks the unpacked bundle directory and loads archives into
//! the local store. Both re-tag under the destination registry and push,
//! with a bounded per-image retry, and both stream structured messages from
//! the engine, failing hard on an embedded error field and observing the
//! pass's cancellation signal between messages.

use crate::conditions::Stage;
use crate::config::{ClusterConfig, ImageMapping, PackageSpec};
use crate::engine::{encode_registry_auth, ImageEngine, MessageStream};
use crate::error::{InstallerError, Result};
use crate::reference::{parse_loaded_image, ImageReference};
use crate::status::StatusHandle;
use crate::unpack::image_files;
use futures::StreamExt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retry budget for one image in pull-and-push mode.
const PULL_ATTEMPTS: u32 = 3;
const PULL_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Retry budget for one archive in load-and-push mode.
const LOAD_ATTEMPTS: u32 = 3;
const LOAD_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Bounded fixed-delay retry. Returns the last error once the budget is
/// exhausted.
async fn retry<T, F, Fut>(attempts: u32, delay: Duration, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last = None;
    for attempt in 1..=attempts {
        if attempt > 1 {
            tokio::time::sleep(delay).await;
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!("{what} attempt {attempt}/{attempts} failed: {e}");
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| InstallerError::Image(format!("{what}: no attempts made"))))
}

/// Moves images from their source (remote mirror or local archive) to the
/// destination registry.
pub struct Distributor {
    engine: Arc<dyn ImageEngine>,
    status: StatusHandle,
    cancel: CancellationToken,
    hub_prefix: String,
    hub_auth: Option<String>,
    mirror_auth: Option<String>,
}

impl Distributor {
    pub fn new(
        engine: Arc<dyn ImageEngine>,
        status: StatusHandle,
        cancel: CancellationToken,
        cluster: &ClusterConfig,
        spec: &PackageSpec,
    ) -> Result<Self> {
        let hub_auth = cluster
            .image_hub
            .as_ref()
            .and_then(|hub| hub.credentials())
            .map(|(user, pass)| encode_registry_auth(user, pass))
            .transpose()?;
        let mirror_auth = spec
            .mirror_credentials()
            .map(|(user, pass)| encode_registry_auth(user, pass))
            .transpose()?;
        Ok(Self {
            engine,
            status,
            cancel,
            hub_prefix: cluster.hub_prefix(),
            hub_auth,
            mirror_auth,
        })
    }

    /// Pull each mapped image from the mirror and push it on. Processing
    /// stops at the first entry that exhausts its retry budget.
    pub async fn pull_and_push(&self, mappings: &[ImageMapping]) -> Result<()> {
        self.status.reset_pushed(mappings.len() as u32).await;
        self.status.persist().await?;

        for mapping in mappings {
            retry(
                PULL_ATTEMPTS,
                PULL_RETRY_DELAY,
                &format!("sync image {}", mapping.source),
                || self.sync_one(&mapping.source, &mapping.destination),
            )
            .await?;
            self.record_success(&mapping.destination).await?;
        }
        Ok(())
    }

    /// Load each archive from the unpacked bundle and push it on. The total
    /// for progress purposes is the up-front count of valid files.
    pub async fn load_and_push(&self, dir: &Path) -> Result<()> {
        let files = image_files(dir);
        self.status.reset_pushed(files.len() as u32).await;
        self.status.persist().await?;

        for file in &files {
            let destination = retry(
                LOAD_ATTEMPTS,
                LOAD_RETRY_DELAY,
                &format!("load image {file:?}"),
                || self.load_one(file),
            )
            .await?;
            self.record_success(&destination).await?;
        }
        Ok(())
    }

    /// Exists-check, pull-if-absent, re-tag, push for one mapping entry.
    async fn sync_one(&self, source: &str, destination: &str) -> Result<()> {
        if !self.image_exists(source).await? {
            debug!("image {source} does not exist locally, start pulling");
            let stream = self.engine.pull(source, self.mirror_auth.as_deref()).await?;
            self.drain(stream).await?;
        }
        self.engine.tag(source, destination).await?;
        let stream = self.engine.push(destination, self.hub_auth.as_deref()).await?;
        self.drain(stream).await?;
        Ok(())
    }

    /// Load one archive, extract the loaded image's canonical name from the
    /// stream, re-tag it under the destination registry, push. Returns the
    /// destination reference.
    async fn load_one(&self, file: &Path) -> Result<String> {
        info!("start loading image file {:?}", file);
        let stream = self.engine.load(file).await?;
        let loaded = self.drain_collect_loaded(stream).await?.ok_or_else(|| {
            InstallerError::Image(format!("no loaded-image name found in stream for {file:?}"))
        })?;

        let destination = ImageReference::parse(&loaded)?.with_registry(&self.hub_prefix);
        self.engine.tag(&loaded, &destination).await?;
        let stream = self.engine.push(&destination, self.hub_auth.as_deref()).await?;
        self.drain(stream).await?;
        Ok(destination)
    }

    /// List images by the exact normalized `name:tag`.
    async fn image_exists(&self, reference: &str) -> Result<bool> {
        let full_name = ImageReference::parse(reference)?.full_name();
        let summaries = self.engine.list_images(&full_name).await?;
        Ok(!summaries.is_empty())
    }

    /// Consume a message stream, surfacing embedded errors and observing
    /// cancellation between messages.
    async fn drain(&self, mut stream: MessageStream) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(InstallerError::Image("image operation cancelled".to_string()));
                }
                message = stream.next() => match message {
                    None => return Ok(()),
                    Some(Ok(msg)) => {
                        if let Some(error) = msg.error.filter(|e| !e.is_empty()) {
                            return Err(InstallerError::Engine(error));
                        }
                    }
                    Some(Err(e)) => return Err(e),
                },
            }
        }
    }

    /// Like [`drain`], additionally scanning stream lines for the
    /// loaded-image marker.
    async fn drain_collect_loaded(&self, mut stream: MessageStream) -> Result<Option<String>> {
        let mut loaded = None;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(InstallerError::Image("image operation cancelled".to_string()));
                }
                message = stream.next() => match message {
                    None => return Ok(loaded),
                    Some(Ok(msg)) => {
                        if let Some(error) = msg.error.filter(|e| !e.is_empty()) {
                            return Err(InstallerError::Engine(error));
                        }
                        if let Some(name) = msg.stream.as_deref().and_then(parse_loaded_image) {
                            loaded = Some(name);
                        }
                    }
                    Some(Err(e)) => return Err(e),
                },
            }
        }
    }

    /// Append to the pushed list, recompute progress, persist on change.
    async fn record_success(&self, destination: &str) -> Result<()> {
        let (count, total) = self.status.record_pushed(destination).await;
        let progress = count * 100 / total.max(1);
        if self.status.set_progress(Stage::PushImage, progress).await {
            self.status.persist().await?;
        }
        info!("successfully pushed image {destination}");
        Ok(())
    }
}
