//! Installer configuration.
//!
//! Two read-only inputs per pass: the cluster configuration (install mode,
//! registries, versions, readiness signals) and the package descriptor
//! (bundle location, checksum, unpack directory). Loaded from
//! `installer.toml` when present, defaults otherwise.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Destination registry used when the cluster does not configure one.
pub const DEFAULT_IMAGE_REPOSITORY: &str = "registry.local/library";

/// Source repository used when the cluster does not configure a mirror.
pub const DEFAULT_IMAGE_MIRROR: &str = "platform";

/// Build-chain image version used when the cluster does not pin one.
pub const DEFAULT_CI_VERSION: &str = "v1.8.0";

/// How images reach the destination registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallMode {
    /// Pull each required image from a remote mirror and push it on.
    #[default]
    Online,
    /// Ship a tarball of pre-built images; load each and push it on.
    Offline,
}

impl std::str::FromStr for InstallMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "online" => Ok(InstallMode::Online),
            "offline" => Ok(InstallMode::Offline),
            _ => Err(format!("unknown install mode: {s}")),
        }
    }
}

/// Destination image registry (domain, optional namespace, optional creds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageHub {
    pub domain: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ImageHub {
    /// `domain` or `domain/namespace`, the prefix destination references
    /// are built under.
    pub fn registry_prefix(&self) -> String {
        match &self.namespace {
            Some(ns) if !ns.is_empty() => format!("{}/{}", self.domain, ns),
            _ => self.domain.clone(),
        }
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

/// Read-only cluster configuration for one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// The operator has finished filling in the cluster spec.
    #[serde(default)]
    pub config_completed: bool,
    /// External health signal: the destination registry answers.
    #[serde(default)]
    pub registry_ready: bool,
    #[serde(default)]
    pub install_mode: InstallMode,
    /// Source repository prefix images are pulled from in online mode.
    #[serde(default)]
    pub image_mirror: String,
    #[serde(default)]
    pub image_hub: Option<ImageHub>,
    #[serde(default)]
    pub install_version: String,
    /// Build-chain image version; falls back to [`DEFAULT_CI_VERSION`].
    #[serde(default)]
    pub ci_version: Option<String>,
}

impl ClusterConfig {
    /// True when this install mode ships a physical bundle that must be
    /// downloaded and unpacked.
    pub fn needs_bundle(&self) -> bool {
        self.install_mode == InstallMode::Offline
    }

    pub fn mirror_prefix(&self) -> &str {
        if self.image_mirror.is_empty() {
            DEFAULT_IMAGE_MIRROR
        } else {
            &self.image_mirror
        }
    }

    pub fn hub_prefix(&self) -> String {
        self.image_hub
            .as_ref()
            .map(|hub| hub.registry_prefix())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_IMAGE_REPOSITORY.to_string())
    }
}

/// One source → destination pair for the pull-and-push strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMapping {
    pub source: String,
    pub destination: String,
}

/// The fixed, versioned set of images a platform install requires, mapped
/// deterministically from the cluster configuration.
pub fn image_mappings(cluster: &ClusterConfig) -> Vec<ImageMapping> {
    let ci_version = cluster
        .ci_version
        .as_deref()
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_CI_VERSION);
    let version = &cluster.install_version;
    let mirror = cluster.mirror_prefix();
    let hub = cluster.hub_prefix();

    let required: [(&str, &str, &str); 5] = [
        ("builder", "builder", ci_version),
        ("runner", "runner", ci_version),
        ("init-probe", "init-probe", version),
        ("mesh-data-panel", "mesh-data-panel", version),
        // Gateway plugin ships on its own release train.
        ("plugins-gateway", "gateway", "v1.3.2"),
    ];

    required
        .iter()
        .map(|(source, dest, tag)| ImageMapping {
            source: format!("{mirror}/{source}:{tag}"),
            destination: format!("{hub}/{dest}:{tag}"),
        })
        .collect()
}

/// Package descriptor: immutable for the lifetime of one install run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageSpec {
    /// Where the bundle is fetched from in offline mode.
    #[serde(default)]
    pub bundle_url: String,
    /// Local path the bundle is saved to (and checked for resume).
    #[serde(default = "default_bundle_path")]
    pub bundle_path: PathBuf,
    /// Expected SHA-256 of the bundle, hex-encoded.
    #[serde(default)]
    pub bundle_sha256: String,
    /// Fixed directory the bundle is unpacked into.
    #[serde(default = "default_unpack_dir")]
    pub unpack_dir: PathBuf,
    /// Expected number of image files in the bundle; drives the unpack
    /// progress estimate.
    #[serde(default = "default_total_images")]
    pub total_images: u32,
    /// Credentials for the source mirror, if it requires auth.
    #[serde(default)]
    pub mirror_username: Option<String>,
    #[serde(default)]
    pub mirror_password: Option<String>,
}

fn default_bundle_path() -> PathBuf {
    PathBuf::from("/opt/platform/pkg/package.tgz")
}

fn default_unpack_dir() -> PathBuf {
    PathBuf::from("/opt/platform/pkg/files")
}

fn default_total_images() -> u32 {
    23
}

impl Default for PackageSpec {
    fn default() -> Self {
        Self {
            bundle_url: String::new(),
            bundle_path: default_bundle_path(),
            bundle_sha256: String::new(),
            unpack_dir: default_unpack_dir(),
            total_images: default_total_images(),
            mirror_username: None,
            mirror_password: None,
        }
    }
}

impl PackageSpec {
    pub fn mirror_credentials(&self) -> Option<(&str, &str)> {
        match (&self.mirror_username, &self.mirror_password) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

/// Image-engine endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_endpoint")]
    pub endpoint: String,
}

fn default_engine_endpoint() -> String {
    std::env::var("DOCKER_HOST").unwrap_or_else(|_| "http://localhost:2375".to_string())
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: default_engine_endpoint(),
        }
    }
}

/// Top-level configuration, loaded from `installer.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallerConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub package: PackageSpec,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl InstallerConfig {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file is absent.
    pub fn load(path: &std::path::Path) -> Result<Self, String> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read config file {path:?}: {e}"))?;
            let config: InstallerConfig = toml::from_str(&content)
                .map_err(|e| format!("Failed to parse config file {path:?}: {e}"))?;
            tracing::info!("Loaded installer config from {:?}", path);
            return Ok(config);
        }
        tracing::warn!("No installer.toml found at {:?}, using defaults", path);
        Ok(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_mode_parses_case_insensitively() {
        assert_eq!("Online".parse::<InstallMode>().unwrap(), InstallMode::Online);
        assert_eq!("OFFLINE".parse::<InstallMode>().unwrap(), InstallMode::Offline);
        assert!("hybrid".parse::<InstallMode>().is_err());
    }

    #[test]
    fn hub_prefix_includes_namespace() {
        let hub = ImageHub {
            domain: "dest.example".to_string(),
            namespace: Some("ns".to_string()),
            username: None,
            password: None,
        };
        assert_eq!(hub.registry_prefix(), "dest.example/ns");
    }

    #[test]
    fn image_mappings_are_deterministic() {
        let cluster = ClusterConfig {
            install_version: "v2.0.1".to_string(),
            image_mirror: "mirror.example/platform".to_string(),
            image_hub: Some(ImageHub {
                domain: "dest.example".to_string(),
                namespace: Some("infra".to_string()),
                username: None,
                password: None,
            }),
            ..Default::default()
        };
        let mappings = image_mappings(&cluster);
        assert_eq!(mappings.len(), 5);
        assert_eq!(
            mappings[0].source,
            format!("mirror.example/platform/builder:{DEFAULT_CI_VERSION}")
        );
        assert_eq!(
            mappings[2].destination,
            "dest.example/infra/init-probe:v2.0.1"
        );
        // Same input, same output.
        assert_eq!(mappings, image_mappings(&cluster));
    }

    #[test]
    fn defaults_apply_without_config() {
        let cluster = ClusterConfig::default();
        assert_eq!(cluster.mirror_prefix(), DEFAULT_IMAGE_MIRROR);
        assert_eq!(cluster.hub_prefix(), DEFAULT_IMAGE_REPOSITORY);
        assert!(!cluster.needs_bundle());
    }
}
