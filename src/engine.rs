//! Image-engine capability surface.
//!
//! The distributor only needs five operations: list, pull, push, load, tag.
//! They are abstracted behind [`ImageEngine`] so the retry and progress
//! logic can run against a fake that streams canned messages;
//! [`DockerEngine`] is the real implementation speaking the engine's REST
//! API, with pull/push/load surfaced as streams of newline-delimited JSON
//! messages.

use crate::error::{InstallerError, Result};
use crate::reference::ImageReference;
use async_trait::async_trait;
use base64::Engine as _;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio_stream::wrappers::LinesStream;

/// One structured progress message from a streaming engine operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamMessage {
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Non-empty when the operation failed mid-stream.
    #[serde(default)]
    pub error: Option<String>,
}

/// Summary entry returned by an image listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageSummary {
    #[serde(default, rename = "RepoTags")]
    pub repo_tags: Vec<String>,
}

/// Stream of decoded progress messages from a pull/push/load call.
pub type MessageStream = BoxStream<'static, Result<StreamMessage>>;

/// The image-engine operations the installer consumes.
#[async_trait]
pub trait ImageEngine: Send + Sync {
    /// List images filtered by an exact `name:tag` reference.
    async fn list_images(&self, reference: &str) -> Result<Vec<ImageSummary>>;

    /// Pull an image; `auth` is a pre-encoded registry auth token.
    async fn pull(&self, reference: &str, auth: Option<&str>) -> Result<MessageStream>;

    /// Push an image to its registry.
    async fn push(&self, reference: &str, auth: Option<&str>) -> Result<MessageStream>;

    /// Load an image archive into the local store.
    async fn load(&self, archive: &Path) -> Result<MessageStream>;

    /// Re-tag `source` as `target`.
    async fn tag(&self, source: &str, target: &str) -> Result<()>;
}

/// Serialize registry credentials the way the engine API expects: URL-safe
/// base64 over a JSON `{username, password}` document.
pub fn encode_registry_auth(username: &str, password: &str) -> Result<String> {
    let payload = serde_json::json!({
        "username": username,
        "password": password,
    });
    let bytes = serde_json::to_vec(&payload)
        .map_err(|e| InstallerError::Engine(format!("encode registry auth: {e}")))?;
    Ok(base64::engine::general_purpose::URL_SAFE.encode(bytes))
}

/// Engine implementation over the Docker Engine REST API.
pub struct DockerEngine {
    endpoint: String,
    client: reqwest::Client,
}

impl DockerEngine {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(InstallerError::Engine(format!(
            "engine returned {status}: {body}"
        )))
    }

    /// Adapt an NDJSON response body into a [`MessageStream`].
    fn message_stream(response: reqwest::Response) -> MessageStream {
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        let reader = tokio_util::io::StreamReader::new(bytes);
        let lines = LinesStream::new(tokio::io::AsyncBufReadExt::lines(
            tokio::io::BufReader::new(reader),
        ));
        lines
            .filter_map(|line| async move {
                match line {
                    Ok(line) if line.trim().is_empty() => None,
                    Ok(line) => Some(
                        serde_json::from_str::<StreamMessage>(&line).map_err(|e| {
                            InstallerError::Engine(format!("decode engine message: {e}"))
                        }),
                    ),
                    Err(e) => Some(Err(InstallerError::Io(e))),
                }
            })
            .boxed()
    }
}

#[async_trait]
impl ImageEngine for DockerEngine {
    async fn list_images(&self, reference: &str) -> Result<Vec<ImageSummary>> {
        let filters = serde_json::json!({ "reference": [reference] }).to_string();
        let response = self
            .client
            .get(self.url("/images/json"))
            .query(&[("filters", filters.as_str())])
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(response.json::<Vec<ImageSummary>>().await?)
    }

    async fn pull(&self, reference: &str, auth: Option<&str>) -> Result<MessageStream> {
        let image = ImageReference::parse(reference)?;
        let from_image = match &image.registry {
            Some(registry) => format!("{}/{}", registry, image.repository),
            None => image.repository.clone(),
        };
        let mut request = self
            .client
            .post(self.url("/images/create"))
            .query(&[("fromImage", from_image.as_str()), ("tag", image.tag.as_str())]);
        if let Some(token) = auth {
            request = request.header("X-Registry-Auth", token);
        }
        let response = Self::check_status(request.send().await?).await?;
        Ok(Self::message_stream(response))
    }

    async fn push(&self, reference: &str, auth: Option<&str>) -> Result<MessageStream> {
        let image = ImageReference::parse(reference)?;
        let name = match &image.registry {
            Some(registry) => format!("{}/{}", registry, image.repository),
            None => image.repository.clone(),
        };
        let request = self
            .client
            .post(self.url(&format!("/images/{name}/push")))
            .query(&[("tag", image.tag.as_str())])
            // The engine rejects pushes without the header, even anonymous
            // ones; "e30=" is the empty JSON document.
            .header("X-Registry-Auth", auth.unwrap_or("e30="));
        let response = Self::check_status(request.send().await?).await?;
        Ok(Self::message_stream(response))
    }

    async fn load(&self, archive: &Path) -> Result<MessageStream> {
        let file = tokio::fs::File::open(archive).await?;
        let body = reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(file));
        let response = self
            .client
            .post(self.url("/images/load"))
            .header("Content-Type", "application/x-tar")
            .body(body)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(Self::message_stream(response))
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        let source_image = ImageReference::parse(source)?;
        let target_image = ImageReference::parse(target)?;
        let source_name = source_image.full_name();
        let repo = match &target_image.registry {
            Some(registry) => format!("{}/{}", registry, target_image.repository),
            None => target_image.repository.clone(),
        };
        let response = self
            .client
            .post(self.url(&format!("/images/{source_name}/tag")))
            .query(&[("repo", repo.as_str()), ("tag", target_image.tag.as_str())])
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }
}
