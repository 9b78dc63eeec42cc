//! Registry backend using the docker CLI for transfers and the OCI
//! distribution HTTP API for lookups and listing.

use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, StatusCode, Url};
use serde::Deserialize;
use swarm_state::ImageRef;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{
    Credentials, ListFilter, LocalImage, Page, RegistryBackend, RegistryEntry, RegistryError,
    Session, Visibility,
};
use crate::domain::manifest::RegistryConfig;

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.docker.distribution.manifest.v2+json";

/// Map docker CLI stderr onto the registry error taxonomy.
pub fn classify_cli_error(registry: &str, reference: &str, stderr: &str) -> RegistryError {
    let lower = stderr.to_ascii_lowercase();
    let detail = stderr.trim().to_string();
    if lower.contains("unauthorized")
        || lower.contains("authentication required")
        || lower.contains("denied")
        || lower.contains("incorrect username or password")
    {
        RegistryError::Unauthorized {
            registry: registry.to_string(),
            detail,
        }
    } else if lower.contains("manifest unknown")
        || lower.contains("not found")
        || lower.contains("does not exist")
        || lower.contains("no such image")
    {
        RegistryError::NotFound {
            reference: reference.to_string(),
        }
    } else if lower.contains("tag invalid")
        || lower.contains("immutable")
        || lower.contains("already exists")
    {
        RegistryError::Conflict {
            reference: reference.to_string(),
            detail,
        }
    } else {
        RegistryError::Transport { detail }
    }
}

fn classify_status(registry: &str, reference: &str, status: StatusCode) -> RegistryError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RegistryError::Unauthorized {
            registry: registry.to_string(),
            detail: status.to_string(),
        },
        StatusCode::NOT_FOUND => RegistryError::NotFound {
            reference: reference.to_string(),
        },
        StatusCode::CONFLICT => RegistryError::Conflict {
            reference: reference.to_string(),
            detail: status.to_string(),
        },
        other => RegistryError::transport(format!("registry answered {other}")),
    }
}

/// `digest: sha256:...` from `docker push` output.
pub fn parse_push_digest(output: &str) -> Option<String> {
    output.lines().rev().find_map(|line| {
        let (_, rest) = line.split_once("digest: ")?;
        rest.split_whitespace().next().map(str::to_string)
    })
}

/// `last` cursor from an RFC 5988 `Link: <...?n=100&last=x>; rel="next"` header.
pub fn parse_next_cursor(base: &Url, link: &str) -> Option<String> {
    let (target, params) = link.split_once(';')?;
    if !params.contains("rel=\"next\"") && !params.contains("rel=next") {
        return None;
    }
    let target = target.trim().trim_start_matches('<').trim_end_matches('>');
    let url = base.join(target).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == "last")
        .map(|(_, v)| v.into_owned())
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

pub struct DockerRegistryBackend {
    binary: String,
    http: reqwest::Client,
    page_size: usize,
}

impl Default for DockerRegistryBackend {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerRegistryBackend {
    pub fn new(binary: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("aiswarm/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            binary: binary.into(),
            http,
            page_size: 100,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn run_cli(
        &self,
        session: &Session,
        reference: &str,
        args: &[&str],
    ) -> Result<String, RegistryError> {
        debug!(binary = %self.binary, ?args, "registry command");
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RegistryError::transport(format!("cannot run {}: {e}", self.binary)))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify_cli_error(
                session.display_registry(),
                reference,
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    fn api_url(&self, session: &Session, path: &str) -> Result<Url, RegistryError> {
        let endpoint = session.endpoint.as_deref().ok_or_else(|| {
            RegistryError::transport("registry has no HTTP endpoint configured")
        })?;
        Url::parse(&format!("{endpoint}{path}"))
            .map_err(|e| RegistryError::transport(format!("bad registry url: {e}")))
    }

    /// Repository name as the HTTP API expects it (registry host stripped).
    fn api_name<'a>(session: &Session, repository: &'a str) -> &'a str {
        session
            .registry
            .as_deref()
            .and_then(|host| repository.strip_prefix(host))
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(repository)
    }

    fn authorize(&self, session: &Session, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &session.credentials {
            Some(c) => req.basic_auth(&c.username, Some(c.password())),
            None => req,
        }
    }

    async fn local_lookup(
        &self,
        session: &Session,
        image: &ImageRef,
    ) -> Result<Option<RegistryEntry>, RegistryError> {
        let reference = image.tagged();
        match self
            .run_cli(
                session,
                &reference,
                &["image", "inspect", "--format", "{{.Id}}", &reference],
            )
            .await
        {
            Ok(_) => Ok(Some(RegistryEntry {
                image: image.clone(),
                pushed_at: Utc::now(),
                visibility: Visibility::Private,
                semantic_tag: None,
            })),
            Err(RegistryError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RegistryBackend for DockerRegistryBackend {
    async fn authenticate(
        &self,
        config: &RegistryConfig,
        credentials: Option<&Credentials>,
    ) -> Result<Session, RegistryError> {
        let mut session = Session::anonymous(config);
        let (Some(host), Some(creds)) = (session.registry.clone(), credentials) else {
            // Anonymous: rely on whatever the engine is already logged into.
            return Ok(session);
        };

        let mut child = Command::new(&self.binary)
            .args(["login", &host, "--username", &creds.username, "--password-stdin"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RegistryError::transport(format!("cannot run {}: {e}", self.binary)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(creds.password().as_bytes())
                .await
                .map_err(|e| RegistryError::transport(format!("login stdin: {e}")))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| RegistryError::transport(format!("login: {e}")))?;
        if !output.status.success() {
            return Err(classify_cli_error(
                &host,
                &host,
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        session.credentials = Some(creds.clone());
        Ok(session)
    }

    async fn lookup(
        &self,
        session: &Session,
        image: &ImageRef,
    ) -> Result<Option<RegistryEntry>, RegistryError> {
        if session.endpoint.is_none() {
            return self.local_lookup(session, image).await;
        }
        let name = Self::api_name(session, &image.repository);
        let url = self.api_url(session, &format!("/v2/{name}/manifests/{}", image.tag))?;
        let response = self
            .authorize(session, self.http.head(url))
            .header(header::ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await
            .map_err(|e| RegistryError::transport(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                let digest = response
                    .headers()
                    .get("docker-content-digest")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .unwrap_or_else(|| image.digest.clone());
                Ok(Some(RegistryEntry {
                    image: ImageRef::new(&image.repository, &image.tag, digest),
                    pushed_at: Utc::now(),
                    visibility: Visibility::Private,
                    semantic_tag: None,
                }))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(classify_status(
                session.display_registry(),
                &image.tagged(),
                status,
            )),
        }
    }

    async fn upload(
        &self,
        session: &Session,
        image: &ImageRef,
        visibility: Visibility,
    ) -> Result<RegistryEntry, RegistryError> {
        let reference = image.tagged();
        let digest = if session.endpoint.is_none() {
            // Local store: the build already put the image where it belongs.
            image.digest.clone()
        } else {
            let out = self.run_cli(session, &reference, &["push", &reference]).await?;
            parse_push_digest(&out).unwrap_or_else(|| image.digest.clone())
        };
        Ok(RegistryEntry {
            image: ImageRef::new(&image.repository, &image.tag, digest),
            pushed_at: Utc::now(),
            visibility,
            semantic_tag: None,
        })
    }

    async fn tag(
        &self,
        session: &Session,
        source: &ImageRef,
        alias: &ImageRef,
        visibility: Visibility,
    ) -> Result<RegistryEntry, RegistryError> {
        let src = source.tagged();
        let dst = alias.tagged();
        self.run_cli(session, &src, &["tag", &src, &dst]).await?;
        self.upload(session, alias, visibility).await
    }

    async fn download(
        &self,
        session: &Session,
        reference: &str,
    ) -> Result<LocalImage, RegistryError> {
        if session.endpoint.is_some() {
            self.run_cli(session, reference, &["pull", reference]).await?;
        }
        let id = self
            .run_cli(
                session,
                reference,
                &["image", "inspect", "--format", "{{.Id}}", reference],
            )
            .await?;
        Ok(LocalImage {
            reference: reference.to_string(),
            image_id: id.trim().to_string(),
        })
    }

    async fn list_page(
        &self,
        session: &Session,
        filter: &ListFilter,
        cursor: Option<String>,
    ) -> Result<Page, RegistryError> {
        if session.endpoint.is_none() {
            let out = self
                .run_cli(
                    session,
                    &filter.repository,
                    &["image", "ls", "--format", "{{.Tag}}", &filter.repository],
                )
                .await?;
            let entries = out
                .lines()
                .map(str::trim)
                .filter(|t| !t.is_empty() && *t != "<none>")
                .map(|tag| RegistryEntry {
                    image: ImageRef::new(&filter.repository, tag, ""),
                    pushed_at: Utc::now(),
                    visibility: Visibility::Private,
                    semantic_tag: None,
                })
                .collect();
            return Ok(Page {
                entries,
                next: None,
            });
        }

        let name = Self::api_name(session, &filter.repository);
        let mut url = self.api_url(session, &format!("/v2/{name}/tags/list"))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("n", &self.page_size.to_string());
            if let Some(last) = &cursor {
                query.append_pair("last", last);
            }
        }
        let response = self
            .authorize(session, self.http.get(url.clone()))
            .send()
            .await
            .map_err(|e| RegistryError::transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(classify_status(
                session.display_registry(),
                &filter.repository,
                response.status(),
            ));
        }
        let next = response
            .headers()
            .get(header::LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(|link| parse_next_cursor(&url, link));
        let body: TagList = response
            .json()
            .await
            .map_err(|e| RegistryError::transport(format!("bad tag list: {e}")))?;

        let entries = body
            .tags
            .unwrap_or_default()
            .into_iter()
            .map(|tag| RegistryEntry {
                image: ImageRef::new(&filter.repository, tag, ""),
                pushed_at: Utc::now(),
                visibility: Visibility::Private,
                semantic_tag: None,
            })
            .collect();
        Ok(Page { entries, next })
    }
}
