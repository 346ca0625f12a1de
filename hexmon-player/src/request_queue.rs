//! Persistent retry queue for fire-and-forget POSTs
//!
//! Command acknowledgements and proof-of-play records must not be lost to
//! a restart or an offline window. Every enqueued request is persisted
//! atomically; a background worker drains the queue in order with
//! exponential backoff and drops an item only after its retry budget is
//! exhausted.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use hexmon_common::{fsutil, Result};

use crate::http::Backend;

/// Default retry budget per queued request
const DEFAULT_MAX_RETRIES: u32 = 10;

/// Exponential backoff: base 1 s, doubling, capped at 60 s
fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.saturating_sub(1).min(6);
    Duration::from_secs(secs.min(60))
}

/// One queued outbound request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub id: Uuid,
    pub method: String,
    pub url: String,
    pub payload: serde_json::Value,
    pub max_retries: u32,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Append-only persistent queue with a draining worker
pub struct RequestQueue {
    path: PathBuf,
    entries: Mutex<VecDeque<QueuedRequest>>,
    notify: Notify,
}

impl RequestQueue {
    /// Load the persisted queue (or start empty)
    pub fn load(data_dir: &std::path::Path) -> Result<Self> {
        let path = data_dir.join("request-queue.json");
        let entries: VecDeque<QueuedRequest> =
            fsutil::read_json(&path)?.unwrap_or_default();
        if !entries.is_empty() {
            debug!("Restored {} queued requests", entries.len());
        }
        Ok(Self {
            path,
            entries: Mutex::new(entries),
            notify: Notify::new(),
        })
    }

    /// Append a request; never blocks on the network
    pub async fn enqueue(
        &self,
        method: &str,
        url: &str,
        payload: serde_json::Value,
        max_retries: Option<u32>,
    ) {
        let request = QueuedRequest {
            id: Uuid::new_v4(),
            method: method.to_string(),
            url: url.to_string(),
            payload,
            max_retries: max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            attempts: 0,
            enqueued_at: Utc::now(),
        };

        let mut entries = self.entries.lock().await;
        entries.push_back(request);
        self.persist(&entries);
        drop(entries);
        self.notify.notify_one();
    }

    pub async fn depth(&self) -> usize {
        self.entries.lock().await.len()
    }

    fn persist(&self, entries: &VecDeque<QueuedRequest>) {
        if let Err(e) = fsutil::atomic_write_json(&self.path, entries) {
            warn!("Failed to persist request queue: {e}");
        }
    }

    /// Drain the queue until cancelled.
    ///
    /// Requests are retried in order; a failing head request backs off
    /// exponentially and is dropped once its retry budget is spent.
    pub async fn run_worker(self: Arc<Self>, backend: Arc<Backend>, cancel: CancellationToken) {
        loop {
            let head = { self.entries.lock().await.front().cloned() };

            let Some(request) = head else {
                tokio::select! {
                    _ = self.notify.notified() => continue,
                    _ = cancel.cancelled() => return,
                }
            };

            let client = backend.client().await;
            match client.post_absolute(&request.url, &request.payload).await {
                Ok(()) => {
                    debug!("Delivered queued {} {}", request.method, request.url);
                    let mut entries = self.entries.lock().await;
                    entries.pop_front();
                    self.persist(&entries);
                }
                Err(e) => {
                    let attempts = request.attempts + 1;
                    if attempts > request.max_retries {
                        warn!(
                            "Dropping queued {} {} after {} attempts: {e}",
                            request.method, request.url, request.attempts
                        );
                        let mut entries = self.entries.lock().await;
                        entries.pop_front();
                        self.persist(&entries);
                        continue;
                    }

                    {
                        let mut entries = self.entries.lock().await;
                        if let Some(front) = entries.front_mut() {
                            front.attempts = attempts;
                        }
                        self.persist(&entries);
                    }

                    let delay = backoff_delay(attempts);
                    debug!(
                        "Queued {} {} failed (attempt {attempts}): {e}; retrying in {delay:?}",
                        request.method, request.url
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
            }

            if cancel.is_cancelled() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpClient;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_backoff_progression() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(6), Duration::from_secs(32));
        // Capped at 60 s
        assert_eq!(backoff_delay(7), Duration::from_secs(60));
        assert_eq!(backoff_delay(30), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_enqueue_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let queue = RequestQueue::load(dir.path()).unwrap();
            queue
                .enqueue(
                    "POST",
                    "https://backend/v1/device/d/ack",
                    serde_json::json!({"ok": true}),
                    None,
                )
                .await;
            assert_eq!(queue.depth().await, 1);
        }

        // A fresh instance restores the pending request
        let reloaded = RequestQueue::load(dir.path()).unwrap();
        assert_eq!(reloaded.depth().await, 1);
    }

    #[tokio::test]
    async fn test_worker_delivers_and_removes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/device/d/ack"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(RequestQueue::load(dir.path()).unwrap());
        queue
            .enqueue(
                "POST",
                &format!("{}/v1/device/d/ack", server.uri()),
                serde_json::json!({"ok": true}),
                None,
            )
            .await;

        let backend = Arc::new(Backend::new(HttpClient::new(&server.uri()).unwrap()));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(queue.clone().run_worker(backend, cancel.clone()));

        // Wait for delivery
        for _ in 0..50 {
            if queue.depth().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(queue.depth().await, 0);

        cancel.cancel();
        let _ = worker.await;
    }

    #[tokio::test]
    async fn test_worker_drops_after_retry_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(RequestQueue::load(dir.path()).unwrap());
        // Zero retries: dropped after the first failure
        queue
            .enqueue(
                "POST",
                &format!("{}/v1/x", server.uri()),
                serde_json::json!({}),
                Some(0),
            )
            .await;

        let backend = Arc::new(Backend::new(HttpClient::new(&server.uri()).unwrap()));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(queue.clone().run_worker(backend, cancel.clone()));

        for _ in 0..50 {
            if queue.depth().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(queue.depth().await, 0);

        cancel.cancel();
        let _ = worker.await;
    }
}
