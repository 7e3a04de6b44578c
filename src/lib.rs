//! One-time, resumable installation of platform container images into a
//! cluster's image registry.
//!
//! The core is a condition-chain state machine
//! (Init → Download → Unpack → PushImage → Ready) driven by a persisted
//! status record and re-entered on every external reconciliation tick. Each
//! pass runs at most one stage, reports fractional progress while the stage
//! blocks, and classifies failures into "retry later" versus "mark failed
//! and let the operator decide".

pub mod conditions;
pub mod config;
pub mod distributor;
pub mod download;
pub mod engine;
pub mod error;
pub mod progress;
pub mod reconcile;
pub mod reference;
pub mod status;
pub mod unpack;

pub use conditions::{Condition, ConditionSet, ConditionStatus, Stage};
pub use config::{
    image_mappings, ClusterConfig, EngineConfig, ImageHub, ImageMapping, InstallMode,
    InstallerConfig, PackageSpec,
};
pub use distributor::Distributor;
pub use download::Downloader;
pub use engine::{encode_registry_auth, DockerEngine, ImageEngine, ImageSummary, StreamMessage};
pub use error::{InstallerError, Result};
pub use reconcile::{next_stage, PackageReconciler, Requeue};
pub use status::{MemoryStatusStore, PackageStatus, PushedImage, StatusHandle, StatusStore};
pub use unpack::{count_images, unpack_bundle};
