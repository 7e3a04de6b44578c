//! One reconciliation pass over a package.
//!
//! The entry point is invoked repeatedly by an external scheduler. Each
//! invocation loads the persisted conditions, asks the gatekeeper which
//! stage (if any) may run, runs at most one stage to completion or failure,
//! persists the conditions, and tells the caller how soon to come back.
//! Advancing one stage per pass bounds the blast radius of any single
//! failure and keeps progress observable between calls.

use crate::conditions::{ConditionSet, ConditionStatus, Stage};
use crate::config::{image_mappings, ClusterConfig, InstallMode, PackageSpec};
use crate::distributor::Distributor;
use crate::download::Downloader;
use crate::engine::ImageEngine;
use crate::error::{InstallerError, Result};
use crate::status::{StatusHandle, StatusStore};
use crate::unpack::unpack_bundle;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay while waiting on preconditions or an in-flight stage.
pub const PRECONDITION_REQUEUE: Duration = Duration::from_secs(3);
/// Delay after completing a stage, before the next one may run.
pub const STAGE_REQUEUE: Duration = Duration::from_secs(3);
/// Delay after a status-write problem (conflict exhaustion, store error).
pub const STATUS_REQUEUE: Duration = Duration::from_secs(5);
/// Delay suggested once a stage has failed and needs an external reset.
pub const FAILURE_REQUEUE: Duration = Duration::from_secs(8);

/// What the caller should do after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// The package is fully installed; no further passes needed.
    Done,
    /// Come back after this delay.
    After(Duration),
}

impl Requeue {
    /// Suggested delay for a pass that returned an error. Preconditions
    /// mean "not yet" and get the short wait; status-write trouble gets a
    /// shorter delay than a failed stage, which waits on an external reset.
    pub fn for_error(error: &InstallerError) -> Requeue {
        if error.is_precondition() {
            return Requeue::After(PRECONDITION_REQUEUE);
        }
        match error {
            InstallerError::Conflict | InstallerError::Status(_) => {
                Requeue::After(STATUS_REQUEUE)
            }
            _ => Requeue::After(FAILURE_REQUEUE),
        }
    }
}

/// Pure stage selection: the first stage in chain order that is not yet
/// Completed. `None` for an empty or fully completed set. Claiming and
/// skip-shortcuts are side effects of the pass itself, not of this
/// decision.
pub fn next_stage(conditions: &ConditionSet) -> Option<Stage> {
    if conditions.is_empty() {
        return None;
    }
    Stage::ALL
        .iter()
        .copied()
        .find(|stage| !conditions.is_completed(*stage))
}

/// Runs one reconciliation pass. Construct a fresh value per pass; nothing
/// is retained between passes beyond what the status store holds.
pub struct PackageReconciler {
    engine: Arc<dyn ImageEngine>,
    store: Arc<dyn StatusStore>,
    cluster: ClusterConfig,
    spec: PackageSpec,
    cancel: CancellationToken,
}

impl PackageReconciler {
    pub fn new(
        engine: Arc<dyn ImageEngine>,
        store: Arc<dyn StatusStore>,
        cluster: ClusterConfig,
        spec: PackageSpec,
    ) -> Self {
        Self {
            engine,
            store,
            cluster,
            spec,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie long-running image operations to an external cancellation signal.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Execute one pass.
    pub async fn reconcile(&self) -> Result<Requeue> {
        let status = self.store.get().await?;

        // First sight of the package: initialize every stage to Waiting.
        if status.conditions.is_empty() {
            let mut status = status;
            status.conditions = ConditionSet::initialized();
            let handle = StatusHandle::new(self.store.clone(), status);
            handle.persist().await?;
            info!("initialized package conditions");
            return Ok(Requeue::After(PRECONDITION_REQUEUE));
        }

        if status.conditions.all_completed() {
            return Ok(Requeue::Done);
        }
        if status.conditions.any_running() {
            debug!("a stage is already running, nothing to do this pass");
            return Ok(Requeue::After(PRECONDITION_REQUEUE));
        }
        if status.conditions.any_failed() {
            debug!("a stage has failed, waiting for an external reset");
            return Ok(Requeue::After(FAILURE_REQUEUE));
        }

        // Precondition gate: not a failure, just "not yet".
        if let Err(e) = self.check_preconditions() {
            debug!("preconditions not met: {e}");
            return Ok(Requeue::After(PRECONDITION_REQUEUE));
        }

        let handle = StatusHandle::new(self.store.clone(), status);
        self.set_init_completed(&handle).await?;

        // One stage per pass; a skip-shortcut completes its stage without
        // work and falls through to the next selection.
        loop {
            let conditions = handle.snapshot().await.conditions;
            let Some(stage) = next_stage(&conditions) else {
                return Ok(Requeue::Done);
            };
            match stage {
                Stage::Init => return Ok(Requeue::After(PRECONDITION_REQUEUE)),
                Stage::DownloadPackage => {
                    if !self.cluster.needs_bundle() {
                        info!("install mode ships no bundle, completing download stage");
                        self.complete_claimed(&handle, Stage::DownloadPackage).await;
                        continue;
                    }
                    self.claim(&handle, Stage::DownloadPackage).await;
                    let downloader = Downloader::new(
                        &self.spec.bundle_url,
                        &self.spec.bundle_path,
                        &self.spec.bundle_sha256,
                    );
                    let result = downloader.fetch(&handle).await;
                    return self
                        .finish_stage(
                            &handle,
                            Stage::DownloadPackage,
                            "DownloadFailed",
                            "download package failure",
                            result,
                        )
                        .await;
                }
                Stage::UnpackPackage => {
                    if !self.cluster.needs_bundle() {
                        info!("install mode ships no bundle, completing unpack stage");
                        self.complete_claimed(&handle, Stage::UnpackPackage).await;
                        continue;
                    }
                    self.claim(&handle, Stage::UnpackPackage).await;
                    let result = unpack_bundle(
                        &self.spec.bundle_path,
                        &self.spec.unpack_dir,
                        self.spec.total_images,
                        &handle,
                    )
                    .await;
                    return self
                        .finish_stage(
                            &handle,
                            Stage::UnpackPackage,
                            "UnpackFailed",
                            "unpack package failure",
                            result,
                        )
                        .await;
                }
                Stage::PushImage => {
                    self.claim(&handle, Stage::PushImage).await;
                    let distributor = Distributor::new(
                        self.engine.clone(),
                        handle.clone(),
                        self.cancel.clone(),
                        &self.cluster,
                        &self.spec,
                    )?;
                    let result = match self.cluster.install_mode {
                        InstallMode::Offline => {
                            info!("start load and push images");
                            distributor.load_and_push(&self.spec.unpack_dir).await
                        }
                        InstallMode::Online => {
                            info!("start pull and push images");
                            distributor
                                .pull_and_push(&image_mappings(&self.cluster))
                                .await
                        }
                    };
                    return self
                        .finish_stage(
                            &handle,
                            Stage::PushImage,
                            "PushImageFailed",
                            "distribute images failure",
                            result,
                        )
                        .await;
                }
                Stage::Ready => {
                    handle.set_status(Stage::Ready, ConditionStatus::Completed).await;
                    handle.persist().await?;
                    info!("package install is ready");
                    return Ok(Requeue::Done);
                }
            }
        }
    }

    fn check_preconditions(&self) -> Result<()> {
        if !self.cluster.config_completed {
            return Err(InstallerError::ConfigNotReady);
        }
        if !self.cluster.registry_ready {
            return Err(InstallerError::RegistryNotReady);
        }
        Ok(())
    }

    /// Mark Init completed once the precondition gate has been passed.
    async fn set_init_completed(&self, handle: &StatusHandle) -> Result<()> {
        let init = handle.condition(Stage::Init).await;
        if init.map(|c| c.status) != Some(ConditionStatus::Completed) {
            handle
                .set_status(Stage::Init, ConditionStatus::Completed)
                .await;
            handle.persist().await?;
        }
        Ok(())
    }

    /// Claim a stage for this pass: flip it to Running and persist so a
    /// concurrent poll sees it in flight. A persist error here is logged,
    /// not fatal; durable state is re-derived next pass either way.
    async fn claim(&self, handle: &StatusHandle, stage: Stage) {
        handle.set_status(stage, ConditionStatus::Running).await;
        if let Err(e) = handle.persist().await {
            warn!("persist running condition for {stage}: {e}");
        }
    }

    async fn complete_claimed(&self, handle: &StatusHandle, stage: Stage) {
        handle.set_status(stage, ConditionStatus::Completed).await;
        if let Err(e) = handle.persist().await {
            warn!("persist skipped condition for {stage}: {e}");
        }
    }

    /// Record a stage outcome and translate it into a requeue signal.
    async fn finish_stage(
        &self,
        handle: &StatusHandle,
        stage: Stage,
        reason: &str,
        message: &str,
        result: Result<()>,
    ) -> Result<Requeue> {
        match result {
            Ok(()) => {
                handle.set_status(stage, ConditionStatus::Completed).await;
                handle.persist().await?;
                info!("stage {stage} completed");
                Ok(Requeue::After(STAGE_REQUEUE))
            }
            Err(e) => {
                handle.set_status(stage, ConditionStatus::Failed).await;
                handle
                    .set_reason(stage, reason, &format!("{message}: {e}"))
                    .await;
                if let Err(persist_err) = handle.persist().await {
                    error!("persist failed condition for {stage}: {persist_err}");
                }
                error!("stage {stage} failed: {e}");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_stage_walks_the_chain() {
        let mut set = ConditionSet::initialized();
        assert_eq!(next_stage(&set), Some(Stage::Init));
        set.set_status(Stage::Init, ConditionStatus::Completed);
        assert_eq!(next_stage(&set), Some(Stage::DownloadPackage));
        set.set_status(Stage::DownloadPackage, ConditionStatus::Completed);
        assert_eq!(next_stage(&set), Some(Stage::UnpackPackage));
        set.set_status(Stage::UnpackPackage, ConditionStatus::Completed);
        set.set_status(Stage::PushImage, ConditionStatus::Completed);
        assert_eq!(next_stage(&set), Some(Stage::Ready));
        set.set_status(Stage::Ready, ConditionStatus::Completed);
        assert_eq!(next_stage(&set), None);
    }

    #[test]
    fn next_stage_is_idempotent_without_state_change() {
        let set = ConditionSet::initialized();
        assert_eq!(next_stage(&set), next_stage(&set));
    }

    #[test]
    fn completed_download_is_never_selected_again() {
        let mut set = ConditionSet::initialized();
        set.set_status(Stage::Init, ConditionStatus::Completed);
        set.set_status(Stage::DownloadPackage, ConditionStatus::Completed);
        // Later mutations to other stages do not resurrect it.
        set.set_status(Stage::UnpackPackage, ConditionStatus::Failed);
        assert_ne!(next_stage(&set), Some(Stage::DownloadPackage));
        set.set_status(Stage::PushImage, ConditionStatus::Running);
        assert_ne!(next_stage(&set), Some(Stage::DownloadPackage));
    }

    #[test]
    fn empty_condition_set_selects_nothing() {
        assert_eq!(next_stage(&ConditionSet::empty()), None);
    }

    #[test]
    fn error_requeue_classification() {
        assert_eq!(
            Requeue::for_error(&InstallerError::ConfigNotReady),
            Requeue::After(PRECONDITION_REQUEUE)
        );
        assert_eq!(
            Requeue::for_error(&InstallerError::RegistryNotReady),
            Requeue::After(PRECONDITION_REQUEUE)
        );
        assert_eq!(
            Requeue::for_error(&InstallerError::Conflict),
            Requeue::After(STATUS_REQUEUE)
        );
        assert_eq!(
            Requeue::for_error(&InstallerError::Image("denied".to_string())),
            Requeue::After(FAILURE_REQUEUE)
        );
    }
}
