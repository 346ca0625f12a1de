//! Playback engine
//!
//! Binds the timeline scheduler to the renderer, proof-of-play and
//! telemetry collaborators. Applies playlist updates (stop, then start
//! with the new items), pins the on-screen media against cache eviction,
//! and enforces the consecutive-error budget: transient play errors show
//! the fallback slide, more than five in a row stop playback.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use hexmon_common::model::{PlaybackPlaylist, PlaylistMode};
use hexmon_common::Error;

use crate::cache::CacheManager;
use crate::renderer::{
    PlaybackUpdate, ProofOfPlaySink, RendererMessage, RendererSink, TelemetrySink,
};
use crate::timeline::{JitterStats, SchedulerEvent, TimelineScheduler};

/// Consecutive play errors tolerated before playback stops
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Playing,
    Emergency,
    Error,
}

/// Scheduler-to-renderer binding with error budget
pub struct PlaybackEngine {
    cache: Arc<CacheManager>,
    renderer: Arc<dyn RendererSink>,
    proof_of_play: Arc<dyn ProofOfPlaySink>,
    telemetry: Arc<dyn TelemetrySink>,
    state: RwLock<EngineState>,
    schedule_id: RwLock<Option<String>>,
    current_media: RwLock<Option<String>>,
    last_error: RwLock<Option<String>>,
    consecutive_errors: AtomicU32,
    scheduler: Mutex<Option<TimelineScheduler>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackEngine {
    pub fn new(
        cache: Arc<CacheManager>,
        renderer: Arc<dyn RendererSink>,
        proof_of_play: Arc<dyn ProofOfPlaySink>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            cache,
            renderer,
            proof_of_play,
            telemetry,
            state: RwLock::new(EngineState::Idle),
            schedule_id: RwLock::new(None),
            current_media: RwLock::new(None),
            last_error: RwLock::new(None),
            consecutive_errors: AtomicU32::new(0),
            scheduler: Mutex::new(None),
            consumer: Mutex::new(None),
        }
    }

    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    pub async fn current_media_id(&self) -> Option<String> {
        self.current_media.read().await.clone()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    /// Scheduler drift statistics of the running timeline
    pub async fn jitter(&self) -> Option<JitterStats> {
        let scheduler = self.scheduler.lock().await;
        match scheduler.as_ref() {
            Some(s) => Some(s.jitter().await),
            None => None,
        }
    }

    /// Stop the current timeline and start the new playlist.
    ///
    /// Resets the error budget; a playlist update is the recovery path out
    /// of the error state.
    pub async fn apply_playlist(self: &Arc<Self>, playlist: &PlaybackPlaylist) {
        self.stop().await;

        self.consecutive_errors.store(0, Ordering::Relaxed);
        *self.last_error.write().await = None;
        *self.schedule_id.write().await = playlist.schedule_id.clone();

        if !playlist.mode.is_playable() || playlist.items.is_empty() {
            info!("Playlist not playable (mode {:?}); engine idle", playlist.mode);
            *self.state.write().await = EngineState::Idle;
            return;
        }

        *self.state.write().await = if playlist.mode == PlaylistMode::Emergency {
            EngineState::Emergency
        } else {
            EngineState::Playing
        };

        let (scheduler, events_rx) = TimelineScheduler::start(playlist.items.clone());
        *self.scheduler.lock().await = Some(scheduler);

        let engine = Arc::clone(self);
        let handle = tokio::spawn(engine.consume_events(events_rx));
        *self.consumer.lock().await = Some(handle);

        info!(
            "Playback started: mode {:?}, {} items",
            playlist.mode,
            playlist.items.len()
        );
    }

    /// Stop playback, cancel timers, release the now-playing pin
    pub async fn stop(&self) {
        if let Some(scheduler) = self.scheduler.lock().await.take() {
            scheduler.stop().await;
        }
        if let Some(consumer) = self.consumer.lock().await.take() {
            let _ = consumer.await;
        }
        if let Some(media_id) = self.current_media.write().await.take() {
            self.cache.unmark_now_playing(&media_id).await;
        }
        self.telemetry.set_current_media(None).await;
        *self.state.write().await = EngineState::Idle;
    }

    async fn consume_events(self: Arc<Self>, mut events_rx: mpsc::Receiver<SchedulerEvent>) {
        while let Some(event) = events_rx.recv().await {
            match event {
                SchedulerEvent::PlayItem { item } => {
                    if !self.handle_play_item(&item).await {
                        return;
                    }
                }
                SchedulerEvent::TransitionStart { duration_ms, .. } => {
                    let update = RendererMessage::PlaybackUpdate(PlaybackUpdate::TransitionStart {
                        duration_ms,
                    });
                    if let Err(e) = self.renderer.send(update).await {
                        warn!("Transition update not delivered: {e}");
                    }
                }
                SchedulerEvent::ItemComplete { item } => {
                    if let Some(media_id) = &item.media_id {
                        self.cache.unmark_now_playing(media_id).await;
                        let schedule_id = self.schedule_id.read().await.clone();
                        self.proof_of_play
                            .record_end(schedule_id.as_deref(), media_id, true)
                            .await;
                    }
                }
                SchedulerEvent::TimelineComplete => {
                    debug!("Timeline wrapped");
                }
            }
        }
    }

    /// Returns false when the error budget is exhausted and the consumer
    /// must terminate.
    async fn handle_play_item(self: &Arc<Self>, item: &hexmon_common::model::TimelineItem) -> bool {
        let result = self.play_item(item).await;
        match result {
            Ok(()) => {
                self.consecutive_errors.store(0, Ordering::Relaxed);
                true
            }
            Err(e) => self.handle_play_error(&item.id, e).await,
        }
    }

    async fn play_item(&self, item: &hexmon_common::model::TimelineItem) -> hexmon_common::Result<()> {
        if item.media_id.is_some() && item.local_path.is_none() {
            return Err(Error::Playback(format!(
                "item {} has no cached media",
                item.id
            )));
        }

        if let Some(media_id) = &item.media_id {
            self.cache.mark_now_playing(media_id).await;
            let schedule_id = self.schedule_id.read().await.clone();
            self.proof_of_play
                .record_start(schedule_id.as_deref(), media_id)
                .await;
            self.telemetry.set_current_media(Some(media_id)).await;
        }
        *self.current_media.write().await = item.media_id.clone();

        self.renderer
            .send(RendererMessage::MediaChange { item: item.clone() })
            .await
    }

    async fn handle_play_error(self: &Arc<Self>, item_id: &str, e: Error) -> bool {
        let errors = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
        warn!("Play error on item {item_id} ({errors} consecutive): {e}");

        if errors > MAX_CONSECUTIVE_ERRORS {
            let playback_error = Error::Playback("Max errors reached".to_string());
            error!("{playback_error}; stopping playback");
            *self.last_error.write().await = Some(playback_error.to_string());
            *self.state.write().await = EngineState::Error;
            // Stop the scheduler without awaiting our own task
            if let Some(scheduler) = self.scheduler.lock().await.take() {
                scheduler.stop().await;
            }
            return false;
        }

        let fallback = RendererMessage::PlaybackUpdate(PlaybackUpdate::ShowFallback {
            reason: e.to_string(),
        });
        if let Err(send_error) = self.renderer.send(fallback).await {
            warn!("Fallback slide not delivered: {send_error}");
        }
        true
    }
}
