//! Renderer channel and collaborator contracts
//!
//! The core never renders pixels. It hands prepared timeline items and
//! status records to a [`RendererSink`], proof-of-play records to a
//! [`ProofOfPlaySink`], and current-media updates to a [`TelemetrySink`].
//! The kiosk host supplies real implementations; the defaults here keep
//! the runtime headless-capable and deterministic in tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use hexmon_common::model::{DefaultMediaDoc, PlayerStatus, TimelineItem};
use hexmon_common::Result;

use crate::request_queue::RequestQueue;

/// Messages pushed to the renderer process
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RendererMessage {
    /// A new item takes the screen
    MediaChange { item: TimelineItem },
    /// Playback presentation update
    PlaybackUpdate(PlaybackUpdate),
    /// Composite player status record
    PlayerStatus { status: PlayerStatus },
    /// CMS-level default media changed
    DefaultMediaChanged { media: DefaultMediaDoc },
    /// Pairing code for the on-screen pairing UI
    PairingCode {
        code: String,
        expires_at: DateTime<Utc>,
    },
}

/// Presentation-level updates inside a running playlist
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PlaybackUpdate {
    TransitionStart { duration_ms: u64 },
    ShowFallback { reason: String },
    TestPattern { params: serde_json::Value },
}

/// Sink for renderer-bound messages
#[async_trait]
pub trait RendererSink: Send + Sync {
    async fn send(&self, message: RendererMessage) -> Result<()>;
}

/// Proof-of-play recording: start/end pairs per displayed item
#[async_trait]
pub trait ProofOfPlaySink: Send + Sync {
    async fn record_start(&self, schedule_id: Option<&str>, media_id: &str);
    async fn record_end(&self, schedule_id: Option<&str>, media_id: &str, completed: bool);
}

/// Device telemetry collaborator
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn set_current_media(&self, media_id: Option<&str>);
    async fn heartbeat(&self, status: &PlayerStatus);
}

/// Screenshot capture and upload collaborator
#[async_trait]
pub trait ScreenshotCapture: Send + Sync {
    /// Capture the screen, upload it, and return the stored object key
    async fn capture_and_upload(&self) -> Result<String>;
}

/// Process relaunch collaborator (REBOOT command)
pub trait RebootHandle: Send + Sync {
    fn schedule_relaunch(&self, delay: std::time::Duration);
}

// ---------------------------------------------------------------------
// Default implementations
// ---------------------------------------------------------------------

/// Logs renderer traffic; used when no kiosk host is attached
pub struct LogRendererSink;

#[async_trait]
impl RendererSink for LogRendererSink {
    async fn send(&self, message: RendererMessage) -> Result<()> {
        debug!("renderer <- {message:?}");
        Ok(())
    }
}

/// Proof-of-play sink that posts records through the persistent request
/// queue, so records survive restarts and network outages.
pub struct BackendProofOfPlay {
    queue: Arc<RequestQueue>,
    api_base: String,
    device_id: String,
}

impl BackendProofOfPlay {
    pub fn new(queue: Arc<RequestQueue>, api_base: &str, device_id: &str) -> Self {
        Self {
            queue,
            api_base: api_base.trim_end_matches('/').to_string(),
            device_id: device_id.to_string(),
        }
    }

    async fn post(&self, event: &str, schedule_id: Option<&str>, media_id: &str, completed: Option<bool>) {
        let url = format!("{}/v1/device/{}/proof-of-play", self.api_base, self.device_id);
        let mut payload = serde_json::json!({
            "event": event,
            "scheduleId": schedule_id,
            "mediaId": media_id,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Some(completed) = completed {
            payload["completed"] = serde_json::Value::Bool(completed);
        }
        self.queue.enqueue("POST", &url, payload, None).await;
    }
}

#[async_trait]
impl ProofOfPlaySink for BackendProofOfPlay {
    async fn record_start(&self, schedule_id: Option<&str>, media_id: &str) {
        self.post("start", schedule_id, media_id, None).await;
    }

    async fn record_end(&self, schedule_id: Option<&str>, media_id: &str, completed: bool) {
        self.post("end", schedule_id, media_id, Some(completed)).await;
    }
}

/// No-op telemetry for headless operation
pub struct NoopTelemetry;

#[async_trait]
impl TelemetrySink for NoopTelemetry {
    async fn set_current_media(&self, _media_id: Option<&str>) {}
    async fn heartbeat(&self, _status: &PlayerStatus) {}
}

/// Screenshot collaborator for hosts without capture support
pub struct UnsupportedScreenshot;

#[async_trait]
impl ScreenshotCapture for UnsupportedScreenshot {
    async fn capture_and_upload(&self) -> Result<String> {
        Err(hexmon_common::Error::Internal(
            "screenshot capture not supported on this host".to_string(),
        ))
    }
}

/// Relaunch by exiting and letting the process supervisor restart us
pub struct SupervisedReboot;

impl RebootHandle for SupervisedReboot {
    fn schedule_relaunch(&self, delay: std::time::Duration) {
        info!("Relaunch scheduled in {delay:?}");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!("Exiting for supervised relaunch");
            std::process::exit(0);
        });
    }
}
