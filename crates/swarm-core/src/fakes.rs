//! In-memory fakes for the external collaborators (testing only)
//!
//! Provides `MemoryBuildEngine`, `MemoryRegistryBackend`,
//! `MemoryComposeRuntime` and `MemoryCloudApi`. Each counts the calls that
//! mutate something so tests can assert that a converged re-run makes none.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use swarm_state::ImageRef;

use crate::build::{BuildEngine, EngineFailure};
use crate::domain::manifest::RegistryConfig;
use crate::provider::{
    CloudApi, CloudRequest, CloudResource, ComposeRuntime, ComposeService, ProviderError,
    ServiceState,
};
use crate::registry::{
    Credentials, ListFilter, LocalImage, Page, RegistryBackend, RegistryEntry, RegistryError,
    Session, Visibility,
};

/// Take one unit from a countdown, returning whether one was available.
fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ---------------------------------------------------------------------------
// MemoryBuildEngine
// ---------------------------------------------------------------------------

/// Build engine that "builds" by remembering tags.
///
/// Builds fail for agents registered with [`MemoryBuildEngine::failing`],
/// matched on the build context directory's name.
#[derive(Debug, Default)]
pub struct MemoryBuildEngine {
    images: Mutex<HashSet<String>>,
    failing: HashSet<String>,
    delay: Duration,
    builds: AtomicUsize,
    built: Mutex<Vec<String>>,
}

impl MemoryBuildEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, agent: impl Into<String>) -> Self {
        self.failing.insert(agent.into());
        self
    }

    /// Every build takes `delay` (use with a paused clock).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of engine builds actually run.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Tags built, in completion order.
    pub fn built_tags(&self) -> Vec<String> {
        self.built.lock().unwrap().clone()
    }

    /// Forget every image, as if the engine's store were pruned.
    pub fn prune(&self) {
        self.images.lock().unwrap().clear();
    }
}

#[async_trait]
impl BuildEngine for MemoryBuildEngine {
    async fn build(
        &self,
        context_dir: &Path,
        tag: &str,
        _build_args: &BTreeMap<String, String>,
    ) -> Result<String, EngineFailure> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let agent = context_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.failing.contains(&agent) {
            return Err(EngineFailure::new(
                "process exited with status 1",
                format!("Step 1/3 : FROM python:3.11-slim\nStep 2/3 : RUN pip install\nerror: {agent} does not build"),
            ));
        }
        self.images.lock().unwrap().insert(tag.to_string());
        self.built.lock().unwrap().push(tag.to_string());
        Ok(format!("sha256:{:0>12}", self.builds()))
    }

    async fn exists(&self, tag: &str) -> Result<bool, EngineFailure> {
        Ok(self.images.lock().unwrap().contains(tag))
    }
}

// ---------------------------------------------------------------------------
// MemoryRegistryBackend
// ---------------------------------------------------------------------------

/// Registry keeping entries in a `BTreeMap<repository:tag, entry>`.
#[derive(Debug)]
pub struct MemoryRegistryBackend {
    entries: Mutex<BTreeMap<String, RegistryEntry>>,
    required: Option<Credentials>,
    page_size: usize,
    upload_failures: AtomicU32,
    list_failures: AtomicU32,
    uploads: AtomicUsize,
    tags: AtomicUsize,
}

impl Default for MemoryRegistryBackend {
    fn default() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            required: None,
            page_size: 100,
            upload_failures: AtomicU32::new(0),
            list_failures: AtomicU32::new(0),
            uploads: AtomicUsize::new(0),
            tags: AtomicUsize::new(0),
        }
    }
}

impl MemoryRegistryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject logins that do not present `credentials`.
    pub fn requiring(mut self, credentials: Credentials) -> Self {
        self.required = Some(credentials);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// The next `n` uploads fail with a transport error.
    pub fn fail_uploads(&self, n: u32) {
        self.upload_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` page requests fail with a transport error.
    pub fn fail_list_pages(&self, n: u32) {
        self.list_failures.store(n, Ordering::SeqCst);
    }

    /// Seed an entry as if pushed by someone else.
    pub fn insert(&self, entry: RegistryEntry) {
        self.entries
            .lock()
            .unwrap()
            .insert(entry.image.tagged(), entry);
    }

    /// Successful uploads.
    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Successful alias tags.
    pub fn tags(&self) -> usize {
        self.tags.load(Ordering::SeqCst)
    }

    pub fn entry(&self, reference: &str) -> Option<RegistryEntry> {
        self.entries.lock().unwrap().get(reference).cloned()
    }
}

#[async_trait]
impl RegistryBackend for MemoryRegistryBackend {
    async fn authenticate(
        &self,
        config: &RegistryConfig,
        credentials: Option<&Credentials>,
    ) -> Result<Session, RegistryError> {
        let mut session = Session::anonymous(config);
        if let Some(required) = &self.required {
            if credentials != Some(required) {
                return Err(RegistryError::Unauthorized {
                    registry: session.display_registry().to_string(),
                    detail: "invalid username or password".to_string(),
                });
            }
        }
        session.credentials = credentials.cloned();
        Ok(session)
    }

    async fn lookup(
        &self,
        _session: &Session,
        image: &ImageRef,
    ) -> Result<Option<RegistryEntry>, RegistryError> {
        Ok(self.entries.lock().unwrap().get(&image.tagged()).cloned())
    }

    async fn upload(
        &self,
        _session: &Session,
        image: &ImageRef,
        visibility: Visibility,
    ) -> Result<RegistryEntry, RegistryError> {
        if take(&self.upload_failures) {
            return Err(RegistryError::transport("connection reset by peer"));
        }
        let entry = RegistryEntry {
            image: image.clone(),
            pushed_at: Utc::now(),
            visibility,
            semantic_tag: None,
        };
        self.insert(entry.clone());
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(entry)
    }

    async fn tag(
        &self,
        _session: &Session,
        source: &ImageRef,
        alias: &ImageRef,
        visibility: Visibility,
    ) -> Result<RegistryEntry, RegistryError> {
        let digest = self
            .entry(&source.tagged())
            .map(|e| e.image.digest)
            .ok_or_else(|| RegistryError::NotFound {
                reference: source.tagged(),
            })?;
        let entry = RegistryEntry {
            image: ImageRef::new(&alias.repository, &alias.tag, digest),
            pushed_at: Utc::now(),
            visibility,
            semantic_tag: Some(alias.tag.clone()),
        };
        self.insert(entry.clone());
        self.tags.fetch_add(1, Ordering::SeqCst);
        Ok(entry)
    }

    async fn download(
        &self,
        _session: &Session,
        reference: &str,
    ) -> Result<LocalImage, RegistryError> {
        self.entry(reference)
            .map(|e| LocalImage {
                reference: reference.to_string(),
                image_id: e.image.digest,
            })
            .ok_or_else(|| RegistryError::NotFound {
                reference: reference.to_string(),
            })
    }

    async fn list_page(
        &self,
        _session: &Session,
        filter: &ListFilter,
        cursor: Option<String>,
    ) -> Result<Page, RegistryError> {
        if take(&self.list_failures) {
            return Err(RegistryError::transport("503 service unavailable"));
        }
        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| RegistryError::transport(format!("bad cursor {c}")))?,
            None => 0,
        };
        let all: Vec<RegistryEntry> = self
            .entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.image.repository == filter.repository)
            .cloned()
            .collect();
        let end = (offset + self.page_size).min(all.len());
        let entries = all.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        Ok(Page {
            entries,
            next: (end < all.len()).then(|| end.to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryComposeRuntime
// ---------------------------------------------------------------------------

/// Compose runtime where services come up instantly.
#[derive(Debug, Default)]
pub struct MemoryComposeRuntime {
    services: Mutex<HashMap<String, ServiceState>>,
    upped: Mutex<Vec<String>>,
    ups: AtomicUsize,
    downs: AtomicUsize,
    failing_ups: AtomicU32,
    degraded_ups: AtomicU32,
}

impl MemoryComposeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` `up` calls fail as if the daemon were unreachable.
    pub fn fail_next_ups(&self, n: u32) {
        self.failing_ups.store(n, Ordering::SeqCst);
    }

    /// The next `n` `up` calls start one replica fewer than requested.
    pub fn degrade_next_ups(&self, n: u32) {
        self.degraded_ups.store(n, Ordering::SeqCst);
    }

    /// Calls to `up`, including failed ones.
    pub fn ups(&self) -> usize {
        self.ups.load(Ordering::SeqCst)
    }

    pub fn downs(&self) -> usize {
        self.downs.load(Ordering::SeqCst)
    }

    /// Service names in the order they were brought up.
    pub fn upped(&self) -> Vec<String> {
        self.upped.lock().unwrap().clone()
    }

    pub fn service(&self, name: &str) -> Option<ServiceState> {
        self.services.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl ComposeRuntime for MemoryComposeRuntime {
    async fn up(&self, service: &ComposeService) -> Result<(), ProviderError> {
        self.ups.fetch_add(1, Ordering::SeqCst);
        if take(&self.failing_ups) {
            return Err(ProviderError::unavailable(
                "Cannot connect to the Docker daemon",
            ));
        }
        let running = if take(&self.degraded_ups) {
            service.replicas.saturating_sub(1)
        } else {
            service.replicas
        };
        {
            let mut services = self.services.lock().unwrap();
            // Compose scaled to zero leaves no containers behind for `ps`.
            if service.replicas == 0 {
                services.remove(&service.name);
            } else {
                services.insert(
                    service.name.clone(),
                    ServiceState {
                        running,
                        image: Some(service.image.clone()),
                    },
                );
            }
        }
        self.upped.lock().unwrap().push(service.name.clone());
        Ok(())
    }

    async fn ps(&self, name: &str) -> Result<Option<ServiceState>, ProviderError> {
        Ok(self.service(name))
    }

    async fn down(&self, name: &str) -> Result<bool, ProviderError> {
        let existed = self.services.lock().unwrap().remove(name).is_some();
        if existed {
            self.downs.fetch_add(1, Ordering::SeqCst);
        }
        Ok(existed)
    }
}

// ---------------------------------------------------------------------------
// MemoryCloudApi
// ---------------------------------------------------------------------------

/// Control plane keeping resources in a `HashMap<resource_id, resource>`.
#[derive(Debug, Default)]
pub struct MemoryCloudApi {
    resources: Mutex<HashMap<String, CloudResource>>,
    requests: Mutex<Vec<CloudRequest>>,
    failing_puts: AtomicU32,
    degraded_puts: AtomicU32,
}

impl MemoryCloudApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_puts(&self, n: u32) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// The next `n` puts report no ready replicas.
    pub fn degrade_next_puts(&self, n: u32) {
        self.degraded_puts.store(n, Ordering::SeqCst);
    }

    /// Every successful put, in order.
    pub fn requests(&self) -> Vec<CloudRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn puts(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn resource(&self, resource_id: &str) -> Option<CloudResource> {
        self.resources.lock().unwrap().get(resource_id).cloned()
    }
}

#[async_trait]
impl CloudApi for MemoryCloudApi {
    async fn describe(&self, resource_id: &str) -> Result<Option<CloudResource>, ProviderError> {
        Ok(self.resource(resource_id))
    }

    async fn put(&self, request: &CloudRequest) -> Result<CloudResource, ProviderError> {
        if take(&self.failing_puts) {
            return Err(ProviderError::unavailable("503 Service Unavailable"));
        }
        let ready_replicas = if take(&self.degraded_puts) {
            0
        } else {
            request.replicas
        };
        let resource = CloudResource {
            resource_id: request.resource_id.clone(),
            ready_replicas,
            image: Some(request.image.clone()),
        };
        self.resources
            .lock()
            .unwrap()
            .insert(request.resource_id.clone(), resource.clone());
        self.requests.lock().unwrap().push(request.clone());
        Ok(resource)
    }

    async fn delete(&self, resource_id: &str) -> Result<bool, ProviderError> {
        Ok(self.resources.lock().unwrap().remove(resource_id).is_some())
    }
}
