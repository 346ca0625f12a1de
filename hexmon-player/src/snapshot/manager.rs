//! Snapshot polling loop and playlist production
//!
//! Each cycle fetches the device snapshot, persists the raw payload for
//! offline restarts, prefetches every referenced media object into the
//! cache, and emits a `PlaylistUpdated` event carrying only items whose
//! media is locally present.
//!
//! The device must keep playing through backend outages: any fetch failure
//! degrades to the last persisted snapshot instead of surfacing an error,
//! and on process start the persisted snapshot is replayed before the
//! first network call.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hexmon_common::events::{EventBus, PlayerEvent};
use hexmon_common::model::{NormalizedSnapshot, PlaybackPlaylist, PlaylistMode, TimelineItem};
use hexmon_common::{fsutil, Error, Result};

use crate::cache::CacheManager;
use crate::http::Backend;
use crate::snapshot::parser::parse_snapshot_response;

/// Snapshot poll loop (one per device)
pub struct SnapshotManager {
    backend: Arc<Backend>,
    cache: Arc<CacheManager>,
    bus: Arc<EventBus>,
    snapshot_path: PathBuf,
    poll_interval: Duration,
    device_id: RwLock<Option<String>>,
    refresh_notify: Notify,
    /// Snapshot processing is strictly sequential per device
    cycle_lock: Mutex<()>,
    last_snapshot: RwLock<Option<NormalizedSnapshot>>,
    last_playlist: RwLock<PlaybackPlaylist>,
}

impl SnapshotManager {
    pub fn new(
        backend: Arc<Backend>,
        cache: Arc<CacheManager>,
        bus: Arc<EventBus>,
        cache_dir: &std::path::Path,
        poll_interval: Duration,
        device_id: Option<String>,
    ) -> Self {
        Self {
            backend,
            cache,
            bus,
            snapshot_path: cache_dir.join("last-snapshot.json"),
            poll_interval,
            device_id: RwLock::new(device_id),
            refresh_notify: Notify::new(),
            cycle_lock: Mutex::new(()),
            last_snapshot: RwLock::new(None),
            last_playlist: RwLock::new(PlaybackPlaylist::empty()),
        }
    }

    pub async fn set_device_id(&self, device_id: String) {
        *self.device_id.write().await = Some(device_id);
    }

    pub async fn current_playlist(&self) -> PlaybackPlaylist {
        self.last_playlist.read().await.clone()
    }

    pub async fn schedule_id(&self) -> Option<String> {
        self.last_snapshot.read().await.as_ref()?.schedule_id.clone()
    }

    pub async fn last_snapshot_at(&self) -> Option<DateTime<Utc>> {
        self.last_snapshot
            .read()
            .await
            .as_ref()
            .map(|s| s.fetched_at)
    }

    /// Replay the persisted snapshot so the device starts playing before
    /// any network call succeeds.
    pub async fn load_persisted(&self) {
        let raw = match fsutil::read_json::<serde_json::Value>(&self.snapshot_path) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("No persisted snapshot at {}", self.snapshot_path.display());
                return;
            }
            Err(e) => {
                warn!("Unreadable persisted snapshot: {e}");
                return;
            }
        };

        match parse_snapshot_response(&raw) {
            Ok(snapshot) => {
                info!("Restored persisted snapshot, {} items", snapshot.items.len());
                *self.last_snapshot.write().await = Some(snapshot.clone());
                self.build_and_emit(&snapshot, PlaylistMode::Offline).await;
            }
            Err(e) => warn!("Persisted snapshot failed to parse: {e}"),
        }
    }

    /// Run the periodic poll loop until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            self.run_cycle().await;
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.refresh_notify.notified() => {
                    debug!("Snapshot refresh requested");
                }
                _ = cancel.cancelled() => {
                    debug!("Snapshot manager stopping");
                    return;
                }
            }
        }
    }

    /// Wake the poll loop for an immediate refresh
    pub fn refresh_now(&self) {
        self.refresh_notify.notify_one();
    }

    /// Run one snapshot cycle immediately (REFRESH_SCHEDULE command path)
    pub async fn refresh_once(&self) {
        self.run_cycle().await;
    }

    async fn run_cycle(&self) {
        let _guard = self.cycle_lock.lock().await;

        let Some(device_id) = self.device_id.read().await.clone() else {
            debug!("Skipping snapshot cycle: device not paired");
            return;
        };

        let client = self.backend.client().await;
        let path = format!("/api/v1/device/{device_id}/snapshot?include_urls=true");

        let mut body = match client.get_json(&path).await {
            Ok(body) => body,
            Err(e) => {
                self.apply_fallback(&e).await;
                return;
            }
        };

        // A single retry is allowed when a cached signed URL turns out to
        // be expired; a second expiry in the same cycle is not retried.
        let mut retried = false;
        loop {
            let snapshot = match parse_snapshot_response(&body) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Snapshot payload unusable: {e}");
                    self.apply_fallback(&e).await;
                    return;
                }
            };

            if let Err(e) = fsutil::atomic_write_json(&self.snapshot_path, &snapshot.raw) {
                warn!("Failed to persist snapshot: {e}");
            }

            match self.prefetch_snapshot(&snapshot).await {
                Err(Error::UrlExpired { status }) if !retried => {
                    info!("Signed URL expired (status {status}); refetching snapshot");
                    retried = true;
                    body = match client.get_json(&path).await {
                        Ok(body) => body,
                        Err(e) => {
                            self.apply_fallback(&e).await;
                            return;
                        }
                    };
                    continue;
                }
                Err(e) => {
                    // Items whose media stayed uncached are dropped below
                    warn!("Media prefetch incomplete: {e}");
                }
                Ok(()) => {}
            }

            *self.last_snapshot.write().await = Some(snapshot.clone());
            self.build_and_emit(&snapshot, PlaylistMode::Empty).await;
            return;
        }
    }

    /// Cache every media object the snapshot references, including the
    /// emergency and default items.
    async fn prefetch_snapshot(&self, snapshot: &NormalizedSnapshot) -> Result<()> {
        let mut items: Vec<TimelineItem> = snapshot.items.clone();
        if let Some(emergency) = &snapshot.emergency_item {
            items.push(emergency.clone());
        }
        if let Some(default_item) = &snapshot.default_item {
            items.push(default_item.clone());
        }
        self.cache.prefetch(&items).await
    }

    /// Degrade to the last known good snapshot, or an empty playlist when
    /// none exists.
    async fn apply_fallback(&self, error: &Error) {
        let cached = self.last_snapshot.read().await.clone();
        match cached {
            Some(snapshot) => {
                warn!("Snapshot fetch failed ({error}); replaying cached snapshot");
                self.build_and_emit(&snapshot, PlaylistMode::Offline).await;
            }
            None => {
                warn!("Snapshot fetch failed ({error}) with no cached snapshot");
                self.emit_playlist(PlaybackPlaylist::empty()).await;
            }
        }
    }

    async fn build_and_emit(&self, snapshot: &NormalizedSnapshot, fallback: PlaylistMode) {
        let playlist = self.build_playlist(snapshot, fallback).await;
        self.emit_playlist(playlist).await;
    }

    /// Apply the mode precedence rule and keep only items whose media is
    /// locally present.
    async fn build_playlist(
        &self,
        snapshot: &NormalizedSnapshot,
        fallback: PlaylistMode,
    ) -> PlaybackPlaylist {
        let mut scheduled = Vec::with_capacity(snapshot.items.len());
        for item in &snapshot.items {
            match self.attach_local_media(item).await {
                Some(attached) => scheduled.push(attached),
                None => debug!("Dropping item {} (media not cached)", item.id),
            }
        }

        let emergency = match &snapshot.emergency_item {
            Some(item) => self.attach_local_media(item).await,
            None => None,
        };
        let default_item = match &snapshot.default_item {
            Some(item) => self.attach_local_media(item).await,
            None => None,
        };

        let mode = PlaylistMode::derive(
            emergency.is_some(),
            scheduled.len(),
            default_item.is_some(),
            fallback,
        );

        let items = match (mode, emergency, default_item) {
            (PlaylistMode::Emergency, Some(item), _) => vec![item],
            (PlaylistMode::Normal, _, _) => scheduled,
            (PlaylistMode::Default, _, Some(item)) => vec![item],
            _ => Vec::new(),
        };

        PlaybackPlaylist {
            mode,
            items,
            schedule_id: snapshot.schedule_id.clone(),
            snapshot_id: snapshot.snapshot_id.clone(),
            last_snapshot_at: Some(snapshot.fetched_at),
        }
    }

    /// Fill `local_path`/`local_url` from the cache; None when the item's
    /// media is not present. Items without media (live URL widgets) pass
    /// through unchanged.
    async fn attach_local_media(&self, item: &TimelineItem) -> Option<TimelineItem> {
        let Some(media_id) = &item.media_id else {
            return Some(item.clone());
        };
        let path = self.cache.get(media_id).await?;
        let mut attached = item.clone();
        attached.local_url = Some(format!("file://{}", path.display()));
        attached.local_path = Some(path);
        Some(attached)
    }

    async fn emit_playlist(&self, playlist: PlaybackPlaylist) {
        info!(
            "Playlist updated: mode {:?}, {} items",
            playlist.mode,
            playlist.items.len()
        );
        *self.last_playlist.write().await = playlist.clone();
        self.bus.emit_lossy(PlayerEvent::PlaylistUpdated {
            playlist,
            timestamp: Utc::now(),
        });
    }
}
