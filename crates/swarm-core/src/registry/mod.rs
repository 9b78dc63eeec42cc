//! Registry client: login, push, pull, publish and list against an image registry.
//!
//! The client is provider-agnostic. Wire protocol details live behind
//! [`RegistryBackend`]; the client adds idempotence (a tag that already holds
//! the same content is not pushed again) and bounded retry of transport
//! failures.

pub mod docker;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use swarm_state::ImageRef;
use tracing::{debug, info};

use crate::domain::manifest::{RegistryConfig, RegistryKind};
use crate::metrics::METRICS;
use crate::retry::RetryPolicy;

pub use docker::DockerRegistryBackend;

/// Registry failures. `Transport` is the only retryable kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unauthorized at {registry}: {detail}")]
    Unauthorized { registry: String, detail: String },

    #[error("not found: {reference}")]
    NotFound { reference: String },

    #[error("conflict on {reference}: {detail}")]
    Conflict { reference: String, detail: String },

    #[error("transport failure: {detail}")]
    Transport { detail: String },
}

impl RegistryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Transport { .. })
    }

    pub fn transport(detail: impl Into<String>) -> Self {
        RegistryError::Transport {
            detail: detail.into(),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Authenticated (or anonymous) registry session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Registry host, or `None` for the engine's local image store.
    pub registry: Option<String>,
    /// Base URL of the registry HTTP API, scheme included.
    pub endpoint: Option<String>,
    pub kind: RegistryKind,
    pub credentials: Option<Credentials>,
}

impl Session {
    pub fn anonymous(config: &RegistryConfig) -> Self {
        Self {
            registry: config.host().map(str::to_string),
            endpoint: config.url.as_deref().map(|url| {
                let url = url.trim_end_matches('/');
                if url.starts_with("http://") || url.starts_with("https://") {
                    url.to_string()
                } else {
                    format!("https://{url}")
                }
            }),
            kind: config.kind,
            credentials: None,
        }
    }

    pub fn display_registry(&self) -> &str {
        self.registry.as_deref().unwrap_or("local")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        })
    }
}

/// One pushed image. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub image: ImageRef,
    pub pushed_at: DateTime<Utc>,
    pub visibility: Visibility,
    #[serde(default)]
    pub semantic_tag: Option<String>,
}

/// An image present in the local engine after a pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalImage {
    pub reference: String,
    pub image_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Repository to enumerate, e.g. `registry.example.com/demo/triage`.
    pub repository: String,
    pub tag_prefix: Option<String>,
}

impl ListFilter {
    pub fn repository(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag_prefix: None,
        }
    }

    pub fn with_tag_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tag_prefix = Some(prefix.into());
        self
    }

    pub fn matches(&self, entry: &RegistryEntry) -> bool {
        entry.image.repository == self.repository
            && self
                .tag_prefix
                .as_deref()
                .map_or(true, |p| entry.image.tag.starts_with(p))
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub entries: Vec<RegistryEntry>,
    /// Opaque cursor for the next page; `None` on the last page.
    pub next: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOptions {
    pub visibility: Visibility,
    /// Extra human-readable tag pointing at the same content.
    pub semantic_tag: Option<String>,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            visibility: Visibility::Private,
            semantic_tag: None,
        }
    }
}

/// Registry wire protocol (external collaborator).
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    async fn authenticate(
        &self,
        config: &RegistryConfig,
        credentials: Option<&Credentials>,
    ) -> Result<Session, RegistryError>;

    /// The entry currently held by `image`'s tag, if any.
    async fn lookup(
        &self,
        session: &Session,
        image: &ImageRef,
    ) -> Result<Option<RegistryEntry>, RegistryError>;

    /// Upload `image` under its tag.
    async fn upload(
        &self,
        session: &Session,
        image: &ImageRef,
        visibility: Visibility,
    ) -> Result<RegistryEntry, RegistryError>;

    /// Point `alias` at the content already pushed as `source`.
    async fn tag(
        &self,
        session: &Session,
        source: &ImageRef,
        alias: &ImageRef,
        visibility: Visibility,
    ) -> Result<RegistryEntry, RegistryError>;

    async fn download(&self, session: &Session, reference: &str)
        -> Result<LocalImage, RegistryError>;

    async fn list_page(
        &self,
        session: &Session,
        filter: &ListFilter,
        cursor: Option<String>,
    ) -> Result<Page, RegistryError>;
}

pub struct RegistryClient {
    backend: Arc<dyn RegistryBackend>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl RegistryClient {
    pub fn new(backend: Arc<dyn RegistryBackend>, retry: RetryPolicy) -> Self {
        Self {
            backend,
            retry,
            timeout: Duration::from_secs(10 * 60),
        }
    }

    /// Bound every single backend attempt by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn attempt<T, F>(&self, fut: F) -> Result<T, RegistryError>
    where
        F: std::future::Future<Output = Result<T, RegistryError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| RegistryError::transport(format!("timed out after {:?}", self.timeout)))?
    }

    pub async fn login(
        &self,
        config: &RegistryConfig,
        credentials: Option<&Credentials>,
    ) -> Result<Session, RegistryError> {
        let session = self
            .retry
            .run(
                "registry.login",
                |_| self.attempt(self.backend.authenticate(config, credentials)),
                RegistryError::is_transient,
                |_, _| {},
            )
            .await?;
        info!(registry = %session.display_registry(), "registry session established");
        Ok(session)
    }

    /// Push a content-addressed image. Re-pushing the same tag is a no-op.
    pub async fn push(
        &self,
        image: &ImageRef,
        session: &Session,
    ) -> Result<RegistryEntry, RegistryError> {
        self.push_with(image, session, PushOptions::default()).await
    }

    pub async fn push_with(
        &self,
        image: &ImageRef,
        session: &Session,
        options: PushOptions,
    ) -> Result<RegistryEntry, RegistryError> {
        let entry = match self.lookup(session, image).await? {
            Some(existing) => {
                debug!(image = %image, "content tag already present, not pushing");
                existing
            }
            None => self.upload(session, image, options.visibility).await?,
        };

        let Some(semantic) = options.semantic_tag else {
            return Ok(entry);
        };

        // A semantic tag may only ever point at one content digest.
        let alias = image.retagged(&semantic);
        if let Some(existing) = self.lookup(session, &alias).await? {
            // Both digests come from the same backend, so they are comparable.
            if existing.image.digest == entry.image.digest {
                debug!(image = %alias, "semantic tag already points at this content");
                return Ok(existing);
            }
            return Err(RegistryError::Conflict {
                reference: alias.tagged(),
                detail: format!(
                    "tag already holds {}, refusing to repoint it to {}",
                    existing.image.digest, entry.image.digest
                ),
            });
        }
        let visibility = options.visibility;
        let mut published = self
            .retry
            .run(
                "registry.tag",
                |_| self.attempt(self.backend.tag(session, image, &alias, visibility)),
                RegistryError::is_transient,
                |_, _| METRICS.inc_push_retries(),
            )
            .await?;
        METRICS.inc_pushes();
        info!(image = %alias, visibility = %visibility, "semantic tag published");
        published.semantic_tag = Some(semantic);
        Ok(published)
    }

    /// Push with a semantic tag and public visibility.
    pub async fn publish(
        &self,
        image: &ImageRef,
        session: &Session,
        semantic_tag: &str,
    ) -> Result<RegistryEntry, RegistryError> {
        self.push_with(
            image,
            session,
            PushOptions {
                visibility: Visibility::Public,
                semantic_tag: Some(semantic_tag.to_string()),
            },
        )
        .await
    }

    pub async fn pull(
        &self,
        reference: &str,
        session: &Session,
    ) -> Result<LocalImage, RegistryError> {
        self.retry
            .run(
                "registry.pull",
                |_| self.attempt(self.backend.download(session, reference)),
                RegistryError::is_transient,
                |_, _| {},
            )
            .await
    }

    /// Lazily stream every matching entry. Each call starts a fresh listing.
    pub fn list(
        &self,
        session: &Session,
        filter: ListFilter,
    ) -> BoxStream<'static, Result<RegistryEntry, RegistryError>> {
        enum Cursor {
            Start,
            Next(String),
            Done,
        }

        let backend = Arc::clone(&self.backend);
        let retry = self.retry.clone();
        let session = session.clone();

        stream::unfold(Cursor::Start, move |cursor| {
            let backend = Arc::clone(&backend);
            let retry = retry.clone();
            let session = session.clone();
            let filter = filter.clone();
            async move {
                let token = match cursor {
                    Cursor::Done => return None,
                    Cursor::Start => None,
                    Cursor::Next(token) => Some(token),
                };
                let page = retry
                    .run(
                        "registry.list",
                        |_| backend.list_page(&session, &filter, token.clone()),
                        RegistryError::is_transient,
                        |_, _| {},
                    )
                    .await;
                match page {
                    Ok(page) => {
                        let next = page.next.map_or(Cursor::Done, Cursor::Next);
                        let items: Vec<_> = page
                            .entries
                            .into_iter()
                            .filter(|e| filter.matches(e))
                            .map(Ok)
                            .collect();
                        Some((items, next))
                    }
                    Err(e) => Some((vec![Err(e)], Cursor::Done)),
                }
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }

    async fn lookup(
        &self,
        session: &Session,
        image: &ImageRef,
    ) -> Result<Option<RegistryEntry>, RegistryError> {
        self.retry
            .run(
                "registry.lookup",
                |_| self.attempt(self.backend.lookup(session, image)),
                RegistryError::is_transient,
                |_, _| {},
            )
            .await
    }

    async fn upload(
        &self,
        session: &Session,
        image: &ImageRef,
        visibility: Visibility,
    ) -> Result<RegistryEntry, RegistryError> {
        let entry = self
            .retry
            .run(
                "registry.push",
                |_| self.attempt(self.backend.upload(session, image, visibility)),
                RegistryError::is_transient,
                |_, _| METRICS.inc_push_retries(),
            )
            .await?;
        METRICS.inc_pushes();
        info!(image = %image, visibility = %visibility, "image pushed");
        Ok(entry)
    }
}
