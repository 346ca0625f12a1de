//! CMS-level default media poller
//!
//! Independent poll loop fetching the account fallback media. Emits
//! `DefaultMediaChanged` only when a renderer-visible field actually
//! differs, persists the last known value for instant post-restart
//! availability, and collapses concurrent refresh requests onto a single
//! in-flight future.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hexmon_common::events::{EventBus, PlayerEvent};
use hexmon_common::fsutil;
use hexmon_common::model::{DefaultMediaDoc, DefaultMediaInfo};

use crate::http::Backend;
use crate::snapshot::parser::opt_str;

type RefreshFuture = Shared<BoxFuture<'static, Option<DefaultMediaDoc>>>;

/// Default-media poll service
pub struct DefaultMediaService {
    backend: Arc<Backend>,
    bus: Arc<EventBus>,
    path: PathBuf,
    poll_interval: Duration,
    last: RwLock<Option<DefaultMediaDoc>>,
    in_flight: Mutex<Option<RefreshFuture>>,
}

impl DefaultMediaService {
    pub fn new(
        backend: Arc<Backend>,
        bus: Arc<EventBus>,
        cache_dir: &std::path::Path,
        poll_interval: Duration,
    ) -> Self {
        Self {
            backend,
            bus,
            path: cache_dir.join("default-media.json"),
            poll_interval,
            last: RwLock::new(None),
            in_flight: Mutex::new(None),
        }
    }

    pub async fn current(&self) -> Option<DefaultMediaDoc> {
        self.last.read().await.clone()
    }

    /// Restore the persisted document and announce it, so the renderer has
    /// a fallback before the first poll succeeds.
    pub async fn load_persisted(&self) {
        match fsutil::read_json::<DefaultMediaDoc>(&self.path) {
            Ok(Some(doc)) => {
                info!("Restored persisted default media");
                *self.last.write().await = Some(doc.clone());
                self.bus.emit_lossy(PlayerEvent::DefaultMediaChanged {
                    media: doc,
                    timestamp: Utc::now(),
                });
            }
            Ok(None) => {}
            Err(e) => warn!("Unreadable persisted default media: {e}"),
        }
    }

    /// Poll loop until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            self.refresh().await;
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => {
                    debug!("Default media service stopping");
                    return;
                }
            }
        }
    }

    /// Fetch the current default media.
    ///
    /// Concurrent callers share one in-flight request and observe the same
    /// outcome.
    pub async fn refresh(self: &Arc<Self>) -> Option<DefaultMediaDoc> {
        let future = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(existing) = in_flight.as_ref() {
                existing.clone()
            } else {
                let this = Arc::clone(self);
                let future: RefreshFuture = async move {
                    let result = this.fetch_and_apply().await;
                    *this.in_flight.lock().await = None;
                    result
                }
                .boxed()
                .shared();
                *in_flight = Some(future.clone());
                future
            }
        };
        future.await
    }

    async fn fetch_and_apply(&self) -> Option<DefaultMediaDoc> {
        let client = self.backend.client().await;
        let body = match client.get_json("/api/v1/settings/default-media").await {
            Ok(body) => body,
            Err(e) => {
                debug!("Default media fetch failed: {e}");
                return self.last.read().await.clone();
            }
        };

        let doc = normalize_default_media(&body);
        let changed = {
            let last = self.last.read().await;
            match last.as_ref() {
                Some(previous) => previous.differs_from(&doc),
                None => true,
            }
        };

        if changed {
            info!("Default media changed");
            *self.last.write().await = Some(doc.clone());
            if let Err(e) = fsutil::atomic_write_json(&self.path, &doc) {
                warn!("Failed to persist default media: {e}");
            }
            self.bus.emit_lossy(PlayerEvent::DefaultMediaChanged {
                media: doc.clone(),
                timestamp: Utc::now(),
            });
        }

        Some(doc)
    }
}

/// Normalize the backend default-media payload.
///
/// Idempotent: normalizing an already-normalized document yields the same
/// value.
pub fn normalize_default_media(value: &serde_json::Value) -> DefaultMediaDoc {
    let media = value
        .get("media")
        .filter(|m| m.is_object())
        .map(|m| DefaultMediaInfo {
            id: opt_str(m, &["id", "media_id", "mediaId"]),
            name: opt_str(m, &["name", "title"]),
            media_type: opt_str(m, &["type", "media_type", "mediaType"])
                .map(|t| t.to_ascii_uppercase()),
            media_url: opt_str(m, &["media_url", "mediaUrl", "url"]),
            source_content_type: opt_str(m, &["source_content_type", "sourceContentType"]),
        });

    DefaultMediaDoc {
        media_id: opt_str(value, &["media_id", "mediaId"]),
        media,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_tolerates_both_casings() {
        let snake = json!({
            "media_id": "m1",
            "media": {"id": "m1", "name": "Lobby", "type": "image",
                       "media_url": "https://u/l.png"}
        });
        let camel = json!({
            "mediaId": "m1",
            "media": {"id": "m1", "name": "Lobby", "mediaType": "image",
                       "mediaUrl": "https://u/l.png"}
        });

        let a = normalize_default_media(&snake);
        let b = normalize_default_media(&camel);
        assert_eq!(a, b);
        assert_eq!(a.media_id.as_deref(), Some("m1"));
        let media = a.media.unwrap();
        // Type is normalized to the upper-case vocabulary
        assert_eq!(media.media_type.as_deref(), Some("IMAGE"));
        assert_eq!(media.media_url.as_deref(), Some("https://u/l.png"));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let raw = json!({
            "media_id": "m2",
            "media": {"id": "m2", "name": "Promo", "type": "VIDEO",
                       "media_url": "https://u/p.mp4",
                       "source_content_type": "video/mp4"}
        });
        let once = normalize_default_media(&raw);
        let again = normalize_default_media(&serde_json::to_value(&once).unwrap());
        assert_eq!(once, again);
    }

    #[test]
    fn test_normalize_empty_payload() {
        let doc = normalize_default_media(&json!({}));
        assert!(doc.media_id.is_none());
        assert!(doc.media.is_none());
    }
}
