//! Image reference parsing and rewriting.

use crate::error::{InstallerError, Result};

/// Marker line the image engine emits once an archive has been loaded.
const LOADED_IMAGE_MARKER: &str = "Loaded image: ";

/// A normalized image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry domain, when the first path segment looks like one.
    pub registry: Option<String>,
    /// Repository path without the registry domain.
    pub repository: String,
    /// Last segment of the repository path.
    pub name: String,
    /// Tag; `latest` when the input carried none.
    pub tag: String,
}

impl ImageReference {
    /// Parse an image reference string. An untagged reference gets the
    /// implicit `latest` tag.
    pub fn parse(reference: &str) -> Result<Self> {
        if reference.is_empty() {
            return Err(InstallerError::Image("empty image reference".to_string()));
        }

        // A ':' after the last '/' is a tag separator; earlier ones belong
        // to a registry port.
        let (path, tag) = match reference.rsplit_once(':') {
            Some((path, tag)) if !tag.contains('/') => (path, tag.to_string()),
            _ => (reference, "latest".to_string()),
        };
        if path.is_empty() {
            return Err(InstallerError::Image(format!(
                "invalid image reference: {reference}"
            )));
        }

        let (registry, repository) = match path.split_once('/') {
            Some((first, rest)) if first.contains('.') || first.contains(':') || first == "localhost" => {
                (Some(first.to_string()), rest.to_string())
            }
            _ => (None, path.to_string()),
        };

        let name = repository
            .rsplit('/')
            .next()
            .unwrap_or(&repository)
            .to_string();
        if name.is_empty() {
            return Err(InstallerError::Image(format!(
                "invalid image reference: {reference}"
            )));
        }

        Ok(Self {
            registry,
            repository,
            name,
            tag,
        })
    }

    /// Build the destination reference under a new registry prefix,
    /// preserving the tag.
    pub fn with_registry(&self, prefix: &str) -> String {
        format!("{}/{}:{}", prefix.trim_end_matches('/'), self.name, self.tag)
    }

    /// The exact `name:tag` form used for registry-existence filtering.
    pub fn full_name(&self) -> String {
        match &self.registry {
            Some(registry) => format!("{}/{}:{}", registry, self.repository, self.tag),
            None => format!("{}:{}", self.repository, self.tag),
        }
    }
}

/// Strip an explicit `:latest` suffix; other tags pass through.
pub fn trim_latest(reference: &str) -> &str {
    reference.strip_suffix(":latest").unwrap_or(reference)
}

/// Extract the canonical image name from one engine stream line, if it is
/// the loaded-image marker. The trailing newline and an explicit `:latest`
/// are stripped.
pub fn parse_loaded_image(line: &str) -> Option<String> {
    let rest = line.trim().strip_prefix(LOADED_IMAGE_MARKER)?;
    let name = trim_latest(rest.trim());
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_registry_repository_and_tag() {
        let image = ImageReference::parse("registry.example/foo/bar:1.2").unwrap();
        assert_eq!(image.registry.as_deref(), Some("registry.example"));
        assert_eq!(image.repository, "foo/bar");
        assert_eq!(image.name, "bar");
        assert_eq!(image.tag, "1.2");
    }

    #[test]
    fn untagged_reference_defaults_to_latest() {
        let image = ImageReference::parse("platform/builder").unwrap();
        assert_eq!(image.registry, None);
        assert_eq!(image.tag, "latest");
        assert_eq!(image.full_name(), "platform/builder:latest");
    }

    #[test]
    fn registry_port_is_not_a_tag() {
        let image = ImageReference::parse("localhost:5000/foo/bar").unwrap();
        assert_eq!(image.registry.as_deref(), Some("localhost:5000"));
        assert_eq!(image.repository, "foo/bar");
        assert_eq!(image.tag, "latest");
    }

    #[test]
    fn destination_rewrite_round_trip() {
        let image = ImageReference::parse("registry.example/foo/bar:1.2").unwrap();
        assert_eq!(image.with_registry("dest.example/ns"), "dest.example/ns/bar:1.2");
    }

    #[test]
    fn loaded_image_marker_is_recognized() {
        assert_eq!(
            parse_loaded_image("Loaded image: registry.example/foo/bar:1.2\n").as_deref(),
            Some("registry.example/foo/bar:1.2")
        );
        assert_eq!(parse_loaded_image("Pulling fs layer"), None);
    }

    #[test]
    fn explicit_latest_is_trimmed_from_loaded_names() {
        assert_eq!(
            parse_loaded_image("Loaded image: platform/runner:latest\n").as_deref(),
            Some("platform/runner")
        );
        // A real tag is never trimmed.
        assert_eq!(trim_latest("platform/runner:v1.8.0"), "platform/runner:v1.8.0");
    }

    #[test]
    fn empty_reference_is_rejected() {
        assert!(ImageReference::parse("").is_err());
    }
}
