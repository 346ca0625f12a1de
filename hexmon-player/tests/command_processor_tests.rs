//! Command processor integration tests
//!
//! Cover per-type rate limiting, unknown-command acks, at-most-once
//! processing, cache-clear effects, and ack fallback into the persistent
//! request queue.

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hexmon_common::events::EventBus;
use hexmon_player::cache::CacheManager;
use hexmon_player::commands::{CommandContext, CommandProcessor};
use hexmon_player::http::{Backend, HttpClient};
use hexmon_player::renderer::{LogRendererSink, RebootHandle, ScreenshotCapture, UnsupportedScreenshot};
use hexmon_player::request_queue::RequestQueue;
use hexmon_player::snapshot::SnapshotManager;

struct NoopReboot;

impl RebootHandle for NoopReboot {
    fn schedule_relaunch(&self, _delay: Duration) {}
}

struct FixedScreenshot;

#[async_trait::async_trait]
impl ScreenshotCapture for FixedScreenshot {
    async fn capture_and_upload(&self) -> hexmon_common::Result<String> {
        Ok("screens/dev-1/0001.png".to_string())
    }
}

struct Fixture {
    server: MockServer,
    processor: Arc<CommandProcessor>,
    cache: Arc<CacheManager>,
    queue: Arc<RequestQueue>,
    _dir: tempfile::TempDir,
}

async fn fixture(screenshot: Arc<dyn ScreenshotCapture>) -> Fixture {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(EventBus::new(64));
    let cache = Arc::new(CacheManager::new(dir.path(), 100_000_000, 3).unwrap());
    let backend = Arc::new(Backend::new(HttpClient::new(&server.uri()).unwrap()));
    let queue = Arc::new(RequestQueue::load(dir.path()).unwrap());
    let snapshots = Arc::new(SnapshotManager::new(
        backend.clone(),
        cache.clone(),
        bus,
        dir.path(),
        Duration::from_secs(300),
        Some("dev-1".to_string()),
    ));

    let processor = Arc::new(CommandProcessor::new(
        backend,
        queue.clone(),
        CommandContext {
            cache: cache.clone(),
            snapshots,
            renderer: Arc::new(LogRendererSink),
            screenshot,
            reboot: Arc::new(NoopReboot),
        },
        "dev-1".to_string(),
        Duration::from_secs(30),
    ));

    Fixture {
        server,
        processor,
        cache,
        queue,
        _dir: dir,
    }
}

async fn mount_commands(server: &MockServer, commands: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/v1/device/dev-1/commands"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "commands": commands
        })))
        .mount(server)
        .await;
}

fn ack_mock(command_id: &str, expected: serde_json::Value) -> Mock {
    Mock::given(method("POST"))
        .and(path(format!("/v1/device/dev-1/commands/{command_id}/ack")))
        .and(body_partial_json(expected))
        .respond_with(ResponseTemplate::new(200))
}

#[tokio::test]
async fn test_ping_acks_uptime_and_version() {
    let f = fixture(Arc::new(UnsupportedScreenshot)).await;
    mount_commands(
        &f.server,
        serde_json::json!([{"id": "c1", "type": "PING"}]),
    )
    .await;
    ack_mock("c1", serde_json::json!({"success": true}))
        .expect(1)
        .mount(&f.server)
        .await;

    f.processor.poll_once().await;

    let history = f.processor.history().await;
    assert_eq!(history.len(), 1);
    assert!(history[0].success);
    let data = history[0].data.as_ref().unwrap();
    assert!(data.get("uptime").is_some());
    assert_eq!(data["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_same_type_rate_limited_within_window() {
    let f = fixture(Arc::new(FixedScreenshot)).await;
    // Two screenshot commands in the same poll, ten seconds apart in
    // spirit; the second must be rejected but still acked.
    mount_commands(
        &f.server,
        serde_json::json!([
            {"id": "c1", "type": "SCREENSHOT"},
            {"id": "c2", "type": "SCREENSHOT"}
        ]),
    )
    .await;
    ack_mock("c1", serde_json::json!({"success": true}))
        .expect(1)
        .mount(&f.server)
        .await;
    ack_mock(
        "c2",
        serde_json::json!({"success": false, "error": "Rate limited"}),
    )
    .expect(1)
    .mount(&f.server)
    .await;

    f.processor.poll_once().await;

    let history = f.processor.history().await;
    assert_eq!(history.len(), 2);
    assert!(history[0].success);
    assert_eq!(
        history[0].data.as_ref().unwrap()["objectKey"],
        "screens/dev-1/0001.png"
    );
    assert!(!history[1].success);
    assert_eq!(history[1].error.as_deref(), Some("Rate limited"));
}

#[tokio::test]
async fn test_unknown_command_acked_as_failure() {
    let f = fixture(Arc::new(UnsupportedScreenshot)).await;
    mount_commands(
        &f.server,
        serde_json::json!([{"id": "c9", "type": "SELF_DESTRUCT"}]),
    )
    .await;
    ack_mock(
        "c9",
        serde_json::json!({
            "success": false,
            "error": "Unknown command type: SELF_DESTRUCT"
        }),
    )
    .expect(1)
    .mount(&f.server)
    .await;

    f.processor.poll_once().await;
    let history = f.processor.history().await;
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
}

#[tokio::test]
async fn test_duplicate_command_id_processed_once() {
    let f = fixture(Arc::new(UnsupportedScreenshot)).await;
    mount_commands(
        &f.server,
        serde_json::json!([{"id": "dup", "type": "PING"}]),
    )
    .await;
    ack_mock("dup", serde_json::json!({"success": true}))
        .expect(1)
        .mount(&f.server)
        .await;

    // The backend keeps returning the command until acked; two polls must
    // still process it exactly once.
    f.processor.poll_once().await;
    f.processor.poll_once().await;

    assert_eq!(f.processor.history().await.len(), 1);
}

#[tokio::test]
async fn test_clear_cache_command_clears_cache() {
    let f = fixture(Arc::new(UnsupportedScreenshot)).await;

    // Seed the cache with one entry
    Mock::given(method("GET"))
        .and(path("/m/a.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 16]))
        .mount(&f.server)
        .await;
    f.cache
        .add("a", &format!("{}/m/a.png", f.server.uri()), None)
        .await
        .unwrap();
    assert!(f.cache.has("a").await);

    mount_commands(
        &f.server,
        serde_json::json!([{"id": "cc", "type": "CLEAR_CACHE", "params": {"force": true}}]),
    )
    .await;
    ack_mock("cc", serde_json::json!({"success": true}))
        .expect(1)
        .mount(&f.server)
        .await;

    f.processor.poll_once().await;
    assert!(!f.cache.has("a").await);
}

#[tokio::test]
async fn test_failed_ack_lands_in_retry_queue() {
    let f = fixture(Arc::new(UnsupportedScreenshot)).await;
    mount_commands(
        &f.server,
        serde_json::json!([{"id": "c3", "type": "PING"}]),
    )
    .await;
    // No ack mock mounted: the POST fails with 404
    f.processor.poll_once().await;

    assert_eq!(f.processor.history().await.len(), 1);
    assert_eq!(f.queue.depth().await, 1, "failed ack must be queued");
}

#[tokio::test]
async fn test_screenshot_unsupported_acks_failure() {
    let f = fixture(Arc::new(UnsupportedScreenshot)).await;
    mount_commands(
        &f.server,
        serde_json::json!([{"id": "cs", "type": "SCREENSHOT"}]),
    )
    .await;
    ack_mock("cs", serde_json::json!({"success": false}))
        .expect(1)
        .mount(&f.server)
        .await;

    f.processor.poll_once().await;
    let history = f.processor.history().await;
    assert!(!history[0].success);
    assert!(history[0].error.as_ref().unwrap().contains("screenshot"));
}
