//! Playback engine integration tests
//!
//! Bind the engine to recording collaborator sinks and verify renderer
//! traffic, proof-of-play ordering, now-playing pinning, and the
//! consecutive-error budget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use hexmon_common::model::{PlaybackPlaylist, PlaylistMode, TimelineItem};
use hexmon_common::{Error, Result};
use hexmon_player::cache::CacheManager;
use hexmon_player::playback::{EngineState, PlaybackEngine};
use hexmon_player::renderer::{
    NoopTelemetry, ProofOfPlaySink, RendererMessage, RendererSink,
};

/// Records every renderer message; optionally fails media changes
struct RecordingRenderer {
    messages: Mutex<Vec<String>>,
    fail_media_change: bool,
}

impl RecordingRenderer {
    fn new(fail_media_change: bool) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            fail_media_change,
        }
    }

    async fn labels(&self) -> Vec<String> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl RendererSink for RecordingRenderer {
    async fn send(&self, message: RendererMessage) -> Result<()> {
        let label = match &message {
            RendererMessage::MediaChange { item } => {
                if self.fail_media_change {
                    return Err(Error::Playback("renderer crashed".to_string()));
                }
                format!("media-change:{}", item.id)
            }
            RendererMessage::PlaybackUpdate(update) => format!("playback-update:{update:?}"),
            RendererMessage::PlayerStatus { .. } => "player-status".to_string(),
            RendererMessage::DefaultMediaChanged { .. } => "default-media".to_string(),
            RendererMessage::PairingCode { .. } => "pairing-code".to_string(),
        };
        self.messages.lock().await.push(label);
        Ok(())
    }
}

/// Records proof-of-play start/end pairs in order
#[derive(Default)]
struct RecordingProofOfPlay {
    events: Mutex<Vec<(String, String, bool)>>,
}

#[async_trait]
impl ProofOfPlaySink for RecordingProofOfPlay {
    async fn record_start(&self, schedule_id: Option<&str>, media_id: &str) {
        self.events.lock().await.push((
            "start".to_string(),
            format!("{}:{media_id}", schedule_id.unwrap_or("-")),
            false,
        ));
    }

    async fn record_end(&self, schedule_id: Option<&str>, media_id: &str, completed: bool) {
        self.events.lock().await.push((
            "end".to_string(),
            format!("{}:{media_id}", schedule_id.unwrap_or("-")),
            completed,
        ));
    }
}

fn cached_item(id: &str, media_id: &str, display_ms: u64, dir: &std::path::Path) -> TimelineItem {
    let local = dir.join(format!("{media_id}.png"));
    std::fs::write(&local, b"pixels").unwrap();
    let mut item = TimelineItem::new(id, Some(media_id.to_string()), display_ms);
    item.local_url = Some(format!("file://{}", local.display()));
    item.local_path = Some(local);
    item
}

fn playlist(mode: PlaylistMode, items: Vec<TimelineItem>) -> PlaybackPlaylist {
    PlaybackPlaylist {
        mode,
        items,
        schedule_id: Some("s1".to_string()),
        snapshot_id: None,
        last_snapshot_at: None,
    }
}

struct Fixture {
    engine: Arc<PlaybackEngine>,
    renderer: Arc<RecordingRenderer>,
    proof: Arc<RecordingProofOfPlay>,
    _dir: tempfile::TempDir,
}

fn fixture(fail_media_change: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(CacheManager::new(dir.path(), 100_000_000, 3).unwrap());
    let renderer = Arc::new(RecordingRenderer::new(fail_media_change));
    let proof = Arc::new(RecordingProofOfPlay::default());
    let engine = Arc::new(PlaybackEngine::new(
        cache,
        renderer.clone(),
        proof.clone(),
        Arc::new(NoopTelemetry),
    ));
    Fixture {
        engine,
        renderer,
        proof,
        _dir: dir,
    }
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_play_emits_media_change_and_proof_of_play() {
    let f = fixture(false);
    let dir = f._dir.path().to_path_buf();
    let items = vec![
        cached_item("i1", "m1", 80, &dir),
        cached_item("i2", "m2", 80, &dir),
    ];

    f.engine
        .apply_playlist(&playlist(PlaylistMode::Normal, items))
        .await;
    assert_eq!(f.engine.state().await, EngineState::Playing);

    // Wait until the second item took the screen
    let renderer = f.renderer.clone();
    wait_for(|| {
        let renderer = renderer.clone();
        async move {
            renderer
                .labels()
                .await
                .iter()
                .any(|l| l == "media-change:i2")
        }
    })
    .await;

    f.engine.stop().await;

    // recordStart precedes recordEnd for the same occurrence
    let events = f.proof.events.lock().await.clone();
    let m1_events: Vec<_> = events.iter().filter(|e| e.1 == "s1:m1").collect();
    assert!(m1_events.len() >= 2);
    assert_eq!(m1_events[0].0, "start");
    assert_eq!(m1_events[1].0, "end");
    assert!(m1_events[1].2, "completed item ends with completed=true");
}

#[tokio::test]
async fn test_now_playing_pinned_during_display() {
    let f = fixture(false);
    let dir = f._dir.path().to_path_buf();
    let items = vec![cached_item("i1", "m1", 60_000, &dir)];

    f.engine
        .apply_playlist(&playlist(PlaylistMode::Normal, items))
        .await;

    let renderer = f.renderer.clone();
    wait_for(|| {
        let renderer = renderer.clone();
        async move { !renderer.labels().await.is_empty() }
    })
    .await;

    assert_eq!(f.engine.current_media_id().await.as_deref(), Some("m1"));
    f.engine.stop().await;
    // Stop released the pin
    assert!(f.engine.current_media_id().await.is_none());
}

#[tokio::test]
async fn test_error_budget_stops_playback() {
    // Renderer fails every media-change; after more than five consecutive
    // errors the engine stops and surfaces the playback error.
    let f = fixture(true);
    let dir = f._dir.path().to_path_buf();
    let items = vec![
        cached_item("i1", "m1", 30, &dir),
        cached_item("i2", "m2", 30, &dir),
    ];

    f.engine
        .apply_playlist(&playlist(PlaylistMode::Normal, items))
        .await;

    let engine = f.engine.clone();
    wait_for(|| {
        let engine = engine.clone();
        async move { engine.state().await == EngineState::Error }
    })
    .await;

    let error = f.engine.last_error().await.unwrap();
    assert!(error.contains("Max errors reached"));

    // A fresh playlist resets the engine and the error counter
    let recovery = vec![TimelineItem::new("web", None, 60_000)];
    f.engine
        .apply_playlist(&playlist(PlaylistMode::Normal, recovery))
        .await;
    assert_eq!(f.engine.state().await, EngineState::Playing);
    assert!(f.engine.last_error().await.is_none());

    f.engine.stop().await;
}

#[tokio::test]
async fn test_transient_errors_show_fallback_and_continue() {
    let f = fixture(true);
    let dir = f._dir.path().to_path_buf();
    // Long display so only the first play fires quickly
    let items = vec![cached_item("i1", "m1", 60_000, &dir)];

    f.engine
        .apply_playlist(&playlist(PlaylistMode::Normal, items))
        .await;

    let renderer = f.renderer.clone();
    wait_for(|| {
        let renderer = renderer.clone();
        async move {
            renderer
                .labels()
                .await
                .iter()
                .any(|l| l.contains("ShowFallback"))
        }
    })
    .await;

    // One failure is far below the budget; playback continues
    assert_eq!(f.engine.state().await, EngineState::Playing);
    f.engine.stop().await;
}

#[tokio::test]
async fn test_emergency_mode_sets_engine_state() {
    let f = fixture(false);
    let dir = f._dir.path().to_path_buf();
    let items = vec![cached_item("em", "em1", 60_000, &dir)];

    f.engine
        .apply_playlist(&playlist(PlaylistMode::Emergency, items))
        .await;
    assert_eq!(f.engine.state().await, EngineState::Emergency);
    f.engine.stop().await;
}

#[tokio::test]
async fn test_unplayable_playlist_idles_engine() {
    let f = fixture(false);
    f.engine
        .apply_playlist(&playlist(PlaylistMode::Empty, Vec::new()))
        .await;
    assert_eq!(f.engine.state().await, EngineState::Idle);

    f.engine
        .apply_playlist(&playlist(PlaylistMode::Offline, Vec::new()))
        .await;
    assert_eq!(f.engine.state().await, EngineState::Idle);
}

#[tokio::test]
async fn test_playlist_update_restarts_scheduler() {
    let f = fixture(false);
    let dir = f._dir.path().to_path_buf();

    f.engine
        .apply_playlist(&playlist(
            PlaylistMode::Normal,
            vec![cached_item("old", "m-old", 60_000, &dir)],
        ))
        .await;

    let renderer = f.renderer.clone();
    wait_for(|| {
        let renderer = renderer.clone();
        async move {
            renderer
                .labels()
                .await
                .iter()
                .any(|l| l == "media-change:old")
        }
    })
    .await;

    // New playlist replaces the old timeline
    f.engine
        .apply_playlist(&playlist(
            PlaylistMode::Normal,
            vec![cached_item("new", "m-new", 60_000, &dir)],
        ))
        .await;

    let renderer = f.renderer.clone();
    wait_for(|| {
        let renderer = renderer.clone();
        async move {
            renderer
                .labels()
                .await
                .iter()
                .any(|l| l == "media-change:new")
        }
    })
    .await;

    // Old media is no longer marked as current
    assert_eq!(f.engine.current_media_id().await.as_deref(), Some("m-new"));
    f.engine.stop().await;
}
