//! Bundle extraction with proxy progress reporting.
//!
//! The bundle is a gzipped tarball containing one `.tgz` archive per image.
//! True extraction progress is unknown up front, so the reporter estimates
//! it by counting valid image files already present in the destination
//! against the expected total.

use crate::conditions::Stage;
use crate::error::{InstallerError, Result};
use crate::progress::ProgressTask;
use crate::status::StatusHandle;
use flate2::read::GzDecoder;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tar::Archive;
use tracing::{info, warn};

/// Sampling period for the unpack progress reporter.
const REPORT_PERIOD: Duration = Duration::from_secs(2);

/// Extension of the per-image archives inside the bundle.
const IMAGE_FILE_EXT: &str = "tgz";

/// True for files the distributor should process: the image archive
/// extension, excluding macOS resource-fork artifacts (`._` prefix).
pub fn is_image_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with("._") {
        return false;
    }
    path.extension().and_then(|e| e.to_str()) == Some(IMAGE_FILE_EXT)
}

/// Count valid image files under `dir`, recursively. Unreadable entries
/// are skipped rather than failing the estimate.
pub fn count_images(dir: &Path) -> u32 {
    fn walk(dir: &Path, count: &mut u32) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, count);
            } else if is_image_file(&path) {
                *count += 1;
            }
        }
    }
    let mut count = 0;
    walk(dir, &mut count);
    count
}

/// List valid image files under `dir`, recursively, in a stable order.
pub fn image_files(dir: &Path) -> Vec<PathBuf> {
    fn walk(dir: &Path, files: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        paths.sort();
        for path in paths {
            if path.is_dir() {
                walk(&path, files);
            } else if is_image_file(&path) {
                files.push(path);
            }
        }
    }
    let mut files = Vec::new();
    walk(dir, &mut files);
    files
}

/// Extract the bundle into `dest`, creating it if absent. Re-entry after a
/// partial extraction simply re-extracts from scratch into the same
/// directory, overwriting. No retry: an extraction error fails the stage.
pub async fn unpack_bundle(
    archive: &Path,
    dest: &Path,
    total_images: u32,
    status: &StatusHandle,
) -> Result<()> {
    info!("start unpacking {:?} into {:?}", archive, dest);
    // Surface a missing bundle before spawning anything.
    std::fs::File::open(archive)
        .map_err(|e| InstallerError::Unpack(format!("open bundle {archive:?}: {e}")))?;
    tokio::fs::create_dir_all(dest).await?;

    let reporter = {
        let dest = dest.to_path_buf();
        let status = status.clone();
        ProgressTask::spawn(REPORT_PERIOD, move || {
            let dest = dest.clone();
            let status = status.clone();
            async move {
                if total_images == 0 {
                    return;
                }
                let extracted = count_images(&dest);
                let progress = extracted * 100 / total_images;
                if status.set_progress(Stage::UnpackPackage, progress).await {
                    if let Err(e) = status.persist().await {
                        warn!("persist unpack progress: {e}");
                    }
                }
            }
        })
    };

    let archive = archive.to_path_buf();
    let dest_dir = dest.to_path_buf();
    let outcome = tokio::task::spawn_blocking(move || extract(&archive, &dest_dir))
        .await
        .map_err(|e| InstallerError::Unpack(format!("extraction task: {e}")));
    reporter.stop().await;

    outcome??;
    info!("successfully unpacked bundle into {:?}", dest);
    Ok(())
}

/// Blocking gzip + tar extraction.
fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)
        .map_err(|e| InstallerError::Unpack(format!("open bundle {archive:?}: {e}")))?;
    let tar = GzDecoder::new(file);
    let mut bundle = Archive::new(tar);
    // Bundle members were produced elsewhere; extract with the current
    // user's ownership so re-runs can overwrite.
    bundle.set_preserve_permissions(false);
    bundle.set_preserve_ownerships(false);
    bundle.set_overwrite(true);
    bundle
        .unpack(dest)
        .map_err(|e| InstallerError::Unpack(format!("extract {archive:?}: {e}")))?;
    Ok(())
}
