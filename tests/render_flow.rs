mod support;

use std::{sync::Arc, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use mermaid_render::{
    application::{
        orchestrator::{Delivery, Payload, RenderCallError, RenderOptions, ServedFrom},
        render::RenderFailure,
    },
    cache::Visibility,
    domain::request::{OutputFormat, RenderRequestDraft},
    infra::object_store::MemoryObjectStore,
};
use support::{PUBLIC_BASE, STUB_SVG, StubLauncher, harness};
use tempfile::TempDir;

const FLOW: &str = "graph TD\n  A[Start] --> B{Ok?}\n  B -->|yes| C[Done]";

fn options(format: OutputFormat, delivery: Delivery) -> RenderOptions {
    RenderOptions {
        draft: RenderRequestDraft::new(FLOW).format(format),
        delivery,
        ..Default::default()
    }
}

#[tokio::test]
async fn cold_cache_renders_once_then_serves_locally() {
    let dir = TempDir::new().expect("temp dir");
    let h = harness(dir.path(), StubLauncher::new(), None);

    let first = h
        .orchestrator
        .handle(options(OutputFormat::Svg, Delivery::Raw))
        .await
        .expect("cold render");
    assert_eq!(first.served_from, ServedFrom::Rendered);
    assert_eq!(first.content_type(), "image/svg+xml");
    assert_eq!(first.payload, Payload::Raw(STUB_SVG.as_bytes().to_vec().into()));
    assert_eq!(h.launcher.passes(), 1);

    let second = h
        .orchestrator
        .handle(options(OutputFormat::Svg, Delivery::Raw))
        .await
        .expect("warm render");
    assert_eq!(second.served_from, ServedFrom::Local);
    assert_eq!(second.fingerprint, first.fingerprint);
    assert_eq!(second.payload, first.payload);
    assert_eq!(h.launcher.passes(), 1, "warm hit must not touch the engine");
    assert_eq!(h.pool.status().active_sessions, 0);
}

#[tokio::test]
async fn raster_at_higher_scale_runs_a_second_pass() {
    let dir = TempDir::new().expect("temp dir");
    let h = harness(dir.path(), StubLauncher::new(), None);

    let mut request = options(OutputFormat::Png, Delivery::Raw);
    request.draft = request.draft.scale(3);
    let response = h.orchestrator.handle(request).await.expect("render");

    assert_eq!(response.payload, Payload::Raw(b"PNG@3x".to_vec().into()));
    assert_eq!(h.launcher.passes(), 2);
}

#[tokio::test]
async fn base64_delivery_encodes_the_cached_bytes() {
    let dir = TempDir::new().expect("temp dir");
    let h = harness(dir.path(), StubLauncher::new(), None);

    let response = h
        .orchestrator
        .handle(options(OutputFormat::Pdf, Delivery::Base64))
        .await
        .expect("render");

    let Payload::Base64(data) = response.payload else {
        panic!("expected base64 payload, got {:?}", response.payload);
    };
    assert_eq!(STANDARD.decode(data).expect("valid base64"), b"%PDF-1.7 stub");
}

#[tokio::test]
async fn durable_url_short_circuits_on_a_shared_remote_hit() {
    let store = Arc::new(MemoryObjectStore::new());

    let first_dir = TempDir::new().expect("temp dir");
    let first = harness(first_dir.path(), StubLauncher::new(), Some(store.clone()));
    let uploaded = first
        .orchestrator
        .handle(options(OutputFormat::Svg, Delivery::Url))
        .await
        .expect("upload");
    let Payload::Url {
        key,
        url,
        already_present,
    } = uploaded.payload
    else {
        panic!("expected url payload");
    };
    assert!(!already_present);
    assert_eq!(url.url, format!("{PUBLIC_BASE}/{key}"));
    assert_eq!(
        store.get(&key).expect("object stored").content_type,
        "image/svg+xml"
    );

    // A second instance with a cold local cache finds the object remotely.
    let second_dir = TempDir::new().expect("temp dir");
    let second = harness(second_dir.path(), StubLauncher::new(), Some(store.clone()));
    let hit = second
        .orchestrator
        .handle(options(OutputFormat::Svg, Delivery::Url))
        .await
        .expect("remote hit");

    assert_eq!(hit.served_from, ServedFrom::Remote);
    assert_eq!(second.launcher.passes(), 0);
    assert!(!second.pool.status().engine_connected);
    assert_eq!(store.put_count(), 1);
}

#[tokio::test]
async fn local_and_remote_tiers_hold_identical_bytes() {
    let dir = TempDir::new().expect("temp dir");
    let store = Arc::new(MemoryObjectStore::new());
    let h = harness(dir.path(), StubLauncher::new(), Some(store.clone()));

    let uploaded = h
        .orchestrator
        .handle(options(OutputFormat::Png, Delivery::Url))
        .await
        .expect("upload");
    let Payload::Url { key, .. } = &uploaded.payload else {
        panic!("expected url payload");
    };
    let remote = store.get(key).expect("object stored").bytes;
    let local = h
        .orchestrator
        .local()
        .expect("local tier enabled")
        .get(&uploaded.fingerprint, OutputFormat::Png)
        .await
        .expect("persisted locally")
        .bytes;
    assert_eq!(local, remote);

    let raw = h
        .orchestrator
        .handle(options(OutputFormat::Png, Delivery::Raw))
        .await
        .expect("local hit");
    assert_eq!(raw.served_from, ServedFrom::Local);
    assert_eq!(raw.fingerprint, uploaded.fingerprint);
    assert_eq!(raw.payload, Payload::Raw(remote));
    assert_eq!(h.launcher.passes(), 1);
}

#[tokio::test]
async fn concurrent_identical_uploads_leave_one_object() {
    let dir = TempDir::new().expect("temp dir");
    let store = Arc::new(MemoryObjectStore::with_latency(Duration::from_millis(20)));
    let h = harness(
        dir.path(),
        StubLauncher::slow(Duration::from_millis(30)),
        Some(store.clone()),
    );

    let (a, b) = tokio::join!(
        h.orchestrator.handle(options(OutputFormat::Png, Delivery::Url)),
        h.orchestrator.handle(options(OutputFormat::Png, Delivery::Url)),
    );
    let (a, b) = (a.expect("first"), b.expect("second"));

    assert_eq!(a.fingerprint, b.fingerprint);
    assert_eq!(store.len(), 1);
    let urls: Vec<String> = [a.payload, b.payload]
        .into_iter()
        .map(|payload| match payload {
            Payload::Url { url, .. } => url.url,
            other => panic!("expected url payload, got {other:?}"),
        })
        .collect();
    assert_eq!(urls[0], urls[1]);
}

#[tokio::test]
async fn signed_delivery_reports_expiry() {
    let dir = TempDir::new().expect("temp dir");
    let store = Arc::new(MemoryObjectStore::new());
    let h = harness(dir.path(), StubLauncher::new(), Some(store.clone()));

    let mut request = options(OutputFormat::Svg, Delivery::Url);
    request.visibility = Visibility::Signed;
    request.expires_in = Some(600);
    let response = h.orchestrator.handle(request).await.expect("signed");

    let Payload::Url { key, url, .. } = response.payload else {
        panic!("expected url payload");
    };
    assert_eq!(url.url, format!("memory://{key}?expires_in=600"));
    assert!(url.expires_at.is_some());
    assert_eq!(
        store.get(&key).expect("stored").visibility,
        Visibility::Signed
    );
}

#[tokio::test]
async fn url_delivery_without_remote_is_rejected_before_rendering() {
    let dir = TempDir::new().expect("temp dir");
    let h = harness(dir.path(), StubLauncher::new(), None);

    let err = h
        .orchestrator
        .handle(options(OutputFormat::Svg, Delivery::Url))
        .await
        .expect_err("no remote");

    assert!(matches!(err, RenderCallError::RemoteUnavailable));
    assert_eq!(h.launcher.passes(), 0);
}

#[tokio::test]
async fn render_errors_are_not_cached_and_release_the_session() {
    let dir = TempDir::new().expect("temp dir");
    let h = harness(
        dir.path(),
        StubLauncher::rejecting("Parse error on line 2"),
        None,
    );

    for _ in 0..2 {
        let err = h
            .orchestrator
            .handle(options(OutputFormat::Svg, Delivery::Raw))
            .await
            .expect_err("syntax error");
        match err {
            RenderCallError::Render(RenderFailure::Render { message }) => {
                assert_eq!(message, "Parse error on line 2");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    assert_eq!(h.launcher.passes(), 2, "failures are never served from cache");
    assert_eq!(h.pool.status().active_sessions, 0);
}

#[tokio::test]
async fn invalid_requests_fail_validation() {
    let dir = TempDir::new().expect("temp dir");
    let h = harness(dir.path(), StubLauncher::new(), None);

    let mut request = options(OutputFormat::Svg, Delivery::Raw);
    request.draft = request.draft.scale(11);
    let err = h.orchestrator.handle(request).await.expect_err("scale");

    assert!(matches!(err, RenderCallError::Validation(_)));
    assert_eq!(h.launcher.launches.load(std::sync::atomic::Ordering::SeqCst), 0);
}
