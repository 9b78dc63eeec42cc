//! Registry client: sessions, idempotent pushes, semantic tags and listing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use swarm_core::fakes::MemoryRegistryBackend;
use swarm_core::registry::{
    Credentials, ListFilter, RegistryClient, RegistryEntry, RegistryError, Session, Visibility,
};
use swarm_core::{RegistryConfig, RegistryKind, RetryPolicy};
use swarm_state::ImageRef;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const REPO: &str = "registry.example.com/demo/triage";

fn config() -> RegistryConfig {
    RegistryConfig {
        url: Some("https://registry.example.com".to_string()),
        kind: RegistryKind::DockerRegistry,
    }
}

fn image(tag: &str) -> ImageRef {
    ImageRef::new(REPO, tag, format!("sha256:{tag}ffff"))
}

fn client(backend: Arc<MemoryRegistryBackend>) -> RegistryClient {
    RegistryClient::new(backend, RetryPolicy::new(3, Duration::from_millis(1)))
}

async fn session(client: &RegistryClient) -> Session {
    client.login(&config(), None).await.expect("login")
}

// ---------------------------------------------------------------------------
// Login
// ---------------------------------------------------------------------------

#[tokio::test]
async fn anonymous_login_targets_configured_registry() {
    let client = client(Arc::new(MemoryRegistryBackend::new()));
    let session = session(&client).await;
    assert_eq!(session.display_registry(), "registry.example.com");
    assert_eq!(
        session.endpoint.as_deref(),
        Some("https://registry.example.com")
    );
    assert!(session.credentials.is_none());
}

#[tokio::test]
async fn bad_credentials_are_rejected_without_retry() {
    let creds = Credentials::new("ci", "s3cret");
    let client = client(Arc::new(MemoryRegistryBackend::new().requiring(creds.clone())));

    let err = client
        .login(&config(), Some(&Credentials::new("ci", "nope")))
        .await
        .expect_err("unauthorized");
    assert!(matches!(err, RegistryError::Unauthorized { .. }));
    assert!(!err.is_transient());

    let session = client.login(&config(), Some(&creds)).await.expect("login");
    assert_eq!(session.credentials.as_ref().map(|c| c.username.as_str()), Some("ci"));
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repush_of_same_content_is_a_noop() {
    let backend = Arc::new(MemoryRegistryBackend::new());
    let client = client(backend.clone());
    let session = session(&client).await;

    let first = client.push(&image("0123456789ab"), &session).await.expect("push");
    let second = client.push(&image("0123456789ab"), &session).await.expect("push");
    assert_eq!(first, second);
    assert_eq!(backend.uploads(), 1);
    assert_eq!(first.visibility, Visibility::Private);
}

#[tokio::test]
async fn transient_upload_failures_are_retried() {
    let backend = Arc::new(MemoryRegistryBackend::new());
    backend.fail_uploads(2);
    let client = client(backend.clone());
    let session = session(&client).await;

    client.push(&image("0123456789ab"), &session).await.expect("push");
    assert_eq!(backend.uploads(), 1);
}

#[tokio::test]
async fn retries_are_bounded() {
    let backend = Arc::new(MemoryRegistryBackend::new());
    backend.fail_uploads(10);
    let client = client(backend.clone());
    let session = session(&client).await;

    let err = client
        .push(&image("0123456789ab"), &session)
        .await
        .expect_err("exhausted");
    assert!(err.is_transient());
    assert_eq!(backend.uploads(), 0);
}

// ---------------------------------------------------------------------------
// Publish
// ---------------------------------------------------------------------------

#[tokio::test]
async fn publish_adds_public_semantic_tag() {
    let backend = Arc::new(MemoryRegistryBackend::new());
    let client = client(backend.clone());
    let session = session(&client).await;
    let img = image("0123456789ab");

    let entry = client.publish(&img, &session, "v1.0.0").await.expect("publish");
    assert_eq!(entry.semantic_tag.as_deref(), Some("v1.0.0"));
    assert_eq!(entry.visibility, Visibility::Public);
    assert_eq!(entry.image.digest, img.digest);

    let alias = backend
        .entry(&format!("{REPO}:v1.0.0"))
        .expect("alias stored");
    assert_eq!(alias.image.digest, img.digest);

    // Same tag, same content: accepted again without a second alias.
    client.publish(&img, &session, "v1.0.0").await.expect("republish");
    assert_eq!(backend.tags(), 1);
}

#[tokio::test]
async fn semantic_tag_cannot_be_repointed() {
    let backend = Arc::new(MemoryRegistryBackend::new());
    let client = client(backend.clone());
    let session = session(&client).await;

    client
        .publish(&image("0123456789ab"), &session, "v1.0.0")
        .await
        .expect("publish");
    let err = client
        .publish(&image("ba9876543210"), &session, "v1.0.0")
        .await
        .expect_err("conflict");
    assert!(matches!(err, RegistryError::Conflict { .. }));
    assert_eq!(
        backend
            .entry(&format!("{REPO}:v1.0.0"))
            .map(|e| e.image.digest),
        Some("sha256:0123456789abffff".to_string())
    );
}

// ---------------------------------------------------------------------------
// Pull
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pull_existing_and_missing() {
    let backend = Arc::new(MemoryRegistryBackend::new());
    let client = client(backend.clone());
    let session = session(&client).await;
    client.push(&image("0123456789ab"), &session).await.expect("push");

    let reference = format!("{REPO}:0123456789ab");
    let local = client.pull(&reference, &session).await.expect("pull");
    assert_eq!(local.reference, reference);

    let err = client
        .pull(&format!("{REPO}:missing"), &session)
        .await
        .expect_err("missing");
    assert!(matches!(err, RegistryError::NotFound { .. }));
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

fn seed(backend: &MemoryRegistryBackend, tags: &[&str]) {
    for tag in tags {
        backend.insert(RegistryEntry {
            image: image(tag),
            pushed_at: Utc::now(),
            visibility: Visibility::Private,
            semantic_tag: None,
        });
    }
}

#[tokio::test]
async fn list_walks_every_page() {
    let backend = Arc::new(MemoryRegistryBackend::new().with_page_size(2));
    seed(&backend, &["aaaa", "bbbb", "cccc", "dddd", "eeee"]);
    backend.insert(RegistryEntry {
        image: ImageRef::new("registry.example.com/demo/other", "ffff", "sha256:ffff"),
        pushed_at: Utc::now(),
        visibility: Visibility::Private,
        semantic_tag: None,
    });
    let client = client(backend);
    let session = session(&client).await;

    let entries: Vec<RegistryEntry> = client
        .list(&session, ListFilter::repository(REPO))
        .map(|e| e.expect("entry"))
        .collect()
        .await;
    let tags: Vec<&str> = entries.iter().map(|e| e.image.tag.as_str()).collect();
    assert_eq!(tags, vec!["aaaa", "bbbb", "cccc", "dddd", "eeee"]);
}

#[tokio::test]
async fn list_filters_by_tag_prefix() {
    let backend = Arc::new(MemoryRegistryBackend::new().with_page_size(2));
    seed(&backend, &["v1.0.0", "v1.1.0", "v2.0.0", "0123456789ab"]);
    let client = client(backend);
    let session = session(&client).await;

    let count = client
        .list(&session, ListFilter::repository(REPO).with_tag_prefix("v1"))
        .filter(|e| futures::future::ready(e.is_ok()))
        .count()
        .await;
    assert_eq!(count, 2);
}

#[tokio::test]
async fn failed_listing_can_be_restarted() {
    let backend = Arc::new(MemoryRegistryBackend::new().with_page_size(2));
    seed(&backend, &["aaaa", "bbbb", "cccc"]);
    let client = client(backend.clone());
    let session = session(&client).await;

    backend.fail_list_pages(3);
    let broken: Vec<_> = client
        .list(&session, ListFilter::repository(REPO))
        .collect()
        .await;
    assert_eq!(broken.len(), 1);
    assert!(broken[0].is_err());

    let fresh: Vec<_> = client
        .list(&session, ListFilter::repository(REPO))
        .collect()
        .await;
    assert_eq!(fresh.len(), 3);
    assert!(fresh.iter().all(Result::is_ok));
}

#[tokio::test]
async fn transient_page_failure_is_retried_mid_listing() {
    let backend = Arc::new(MemoryRegistryBackend::new().with_page_size(1));
    seed(&backend, &["aaaa", "bbbb"]);
    let client = client(backend.clone());
    let session = session(&client).await;

    let mut stream = client.list(&session, ListFilter::repository(REPO));
    let first = stream.next().await.expect("first").expect("ok");
    assert_eq!(first.image.tag, "aaaa");
    backend.fail_list_pages(1);
    let second = stream.next().await.expect("second").expect("ok after retry");
    assert_eq!(second.image.tag, "bbbb");
    assert!(stream.next().await.is_none());
}
