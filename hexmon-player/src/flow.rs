//! Top-level player flow
//!
//! The device-level state machine binding every subsystem:
//!
//! ```text
//! BOOT -> NEED_PAIRING -> PAIRING_REQUESTED -> WAITING_CONFIRMATION
//!              ^                                     |  (backend 404: new code)
//!              |                                     v
//!              +------------------------------- CERT_ISSUED
//! BOOT -> [has certs] ----------------------------> PLAYBACK_RUNNING
//! PLAYBACK_RUNNING <-> OFFLINE_FALLBACK  (driven by playlist mode)
//! ```
//!
//! All services are wired here once at startup and passed by reference;
//! there are no process-wide singletons, which keeps init order explicit
//! and tests deterministic.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hexmon_common::config::Config;
use hexmon_common::events::{EventBus, PlayerEvent};
use hexmon_common::model::{PlayerState, PlayerStatus, PlaylistMode};
use hexmon_common::Result;

use crate::cache::{CacheManager, CacheStats};
use crate::certs::CertificateManager;
use crate::commands::{CommandContext, CommandProcessor};
use crate::default_media::DefaultMediaService;
use crate::http::{Backend, HttpClient};
use crate::pairing::{DeviceInfo, PairingService};
use crate::playback::PlaybackEngine;
use crate::renderer::{
    BackendProofOfPlay, LogRendererSink, NoopTelemetry, RebootHandle, RendererMessage,
    RendererSink, ScreenshotCapture, SupervisedReboot, TelemetrySink, UnsupportedScreenshot,
};
use crate::request_queue::RequestQueue;
use crate::snapshot::SnapshotManager;
use crate::timeline::JitterStats;

/// Host-supplied collaborator implementations
pub struct Collaborators {
    pub renderer: Arc<dyn RendererSink>,
    pub screenshot: Arc<dyn ScreenshotCapture>,
    pub reboot: Arc<dyn RebootHandle>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            renderer: Arc::new(LogRendererSink),
            screenshot: Arc::new(UnsupportedScreenshot),
            reboot: Arc::new(SupervisedReboot),
            telemetry: Arc::new(NoopTelemetry),
        }
    }
}

/// On-demand diagnostics snapshot for the renderer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsReport {
    pub state: PlayerState,
    pub mode: PlaylistMode,
    pub online: bool,
    pub uptime_s: u64,
    pub cache: CacheStats,
    pub scheduler_jitter: Option<JitterStats>,
    pub cert_present: bool,
    pub cert_expires_at: Option<DateTime<Utc>>,
    pub cert_needs_renewal: bool,
    pub queue_depth: usize,
    pub command_history_len: usize,
    /// The polled command channel is the only control path
    pub ws_state: &'static str,
}

/// Top-level state machine over all subsystems
pub struct PlayerFlow {
    config: RwLock<Config>,
    config_path: PathBuf,
    cache_dir: PathBuf,
    bus: Arc<EventBus>,
    backend: Arc<Backend>,
    certs: Arc<CertificateManager>,
    cache: Arc<CacheManager>,
    queue: Arc<RequestQueue>,
    snapshots: Arc<SnapshotManager>,
    default_media: Arc<DefaultMediaService>,
    collaborators: Collaborators,
    state: RwLock<PlayerState>,
    online: AtomicBool,
    engine: Mutex<Option<Arc<PlaybackEngine>>>,
    commands: Mutex<Option<Arc<CommandProcessor>>>,
    cancel: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

impl PlayerFlow {
    /// Wire all subsystems from a validated configuration.
    ///
    /// Nothing is polled or played until [`PlayerFlow::start`].
    pub fn new(
        config: Config,
        config_path: PathBuf,
        data_dir: &std::path::Path,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>> {
        let cache_dir = config
            .cache
            .path
            .clone()
            .unwrap_or_else(|| data_dir.join("cache"));
        // Credential files follow the configured certificate location when
        // one is given, otherwise live under the data directory.
        let cert_dir = config
            .mtls
            .cert_path
            .as_ref()
            .and_then(|p| p.parent().map(std::path::Path::to_path_buf))
            .unwrap_or_else(|| data_dir.join("certs"));
        std::fs::create_dir_all(&cert_dir)?;

        let bus = Arc::new(EventBus::new(256));
        let backend = Arc::new(Backend::new(HttpClient::new(&config.api_base)?));
        let certs = Arc::new(CertificateManager::new(cert_dir));
        let cache = Arc::new(CacheManager::new(
            &cache_dir,
            config.cache.max_bytes,
            config.cache.prefetch_concurrency,
        )?);
        let queue = Arc::new(RequestQueue::load(data_dir)?);
        let snapshots = Arc::new(SnapshotManager::new(
            backend.clone(),
            cache.clone(),
            bus.clone(),
            &cache_dir,
            Duration::from_millis(config.intervals.schedule_poll_ms),
            config.device_id.clone(),
        ));
        let default_media = Arc::new(DefaultMediaService::new(
            backend.clone(),
            bus.clone(),
            &cache_dir,
            Duration::from_millis(config.intervals.default_media_poll_ms),
        ));

        Ok(Arc::new(Self {
            config: RwLock::new(config),
            config_path,
            cache_dir,
            bus,
            backend,
            certs,
            cache,
            queue,
            snapshots,
            default_media,
            collaborators,
            state: RwLock::new(PlayerState::Boot),
            online: AtomicBool::new(false),
            engine: Mutex::new(None),
            commands: Mutex::new(None),
            cancel: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        }))
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub async fn state(&self) -> PlayerState {
        *self.state.read().await
    }

    /// Start the device: straight into playback when credentials are
    /// present and valid, otherwise through the pairing workflow.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.set_state(PlayerState::Boot).await;

        let device_id = self.config.read().await.device_id.clone();
        let credentials = match &device_id {
            Some(id) => self.certs.load_credentials(id)?,
            None => None,
        };

        match (device_id, credentials) {
            (Some(device_id), Some(credentials)) => {
                info!("Valid credentials found for device {device_id}");
                let api_base = self.config.read().await.api_base.clone();
                self.backend
                    .replace(HttpClient::with_credentials(&api_base, &credentials)?)
                    .await;
                self.snapshots.set_device_id(device_id.clone()).await;
                self.enter_playback_running(device_id).await?;
            }
            _ => {
                info!("No usable credentials; entering pairing");
                self.set_state(PlayerState::NeedPairing).await;
                let flow = Arc::clone(self);
                let cancel = self.root_cancel().await;
                self.tasks
                    .lock()
                    .await
                    .push(tokio::spawn(flow.pairing_loop(cancel)));
            }
        }
        Ok(())
    }

    /// Stop all services in reverse start order. Cleanup failures are
    /// logged, never propagated.
    pub async fn stop(&self) {
        info!("Player stopping");
        if let Some(cancel) = self.cancel.lock().await.take() {
            cancel.cancel();
        }
        if let Some(engine) = self.engine.lock().await.take() {
            engine.stop().await;
        }
        let mut tasks = self.tasks.lock().await;
        while let Some(task) = tasks.pop() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Task ended abnormally during shutdown: {e}");
                }
            }
        }
    }

    async fn root_cancel(&self) -> CancellationToken {
        let mut guard = self.cancel.lock().await;
        match guard.as_ref() {
            Some(token) => token.clone(),
            None => {
                let token = CancellationToken::new();
                *guard = Some(token.clone());
                token
            }
        }
    }

    // -----------------------------------------------------------------
    // Pairing
    // -----------------------------------------------------------------

    async fn pairing_loop(self: Arc<Self>, cancel: CancellationToken) {
        let pairing = PairingService::new(self.backend.client().await, self.certs.clone());
        let info = device_info();

        loop {
            if cancel.is_cancelled() {
                return;
            }

            self.set_state(PlayerState::PairingRequested).await;
            let code = match pairing.request_pairing_code(&info).await {
                Ok(code) => code,
                Err(e) => {
                    warn!("Pairing code request failed: {e}");
                    self.set_state(PlayerState::NeedPairing).await;
                    if sleep_or_cancel(Duration::from_secs(10), &cancel).await {
                        return;
                    }
                    continue;
                }
            };

            let _ = self
                .collaborators
                .renderer
                .send(RendererMessage::PairingCode {
                    code: code.pairing_code.clone(),
                    expires_at: code.expires_at,
                })
                .await;
            self.set_state(PlayerState::WaitingConfirmation).await;

            // Poll until confirmed, expired, or cancelled
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                if code.is_expired() {
                    info!("Pairing code expired locally; requesting a new one");
                    self.set_state(PlayerState::NeedPairing).await;
                    break;
                }

                match pairing.fetch_pairing_status(&code).await {
                    Ok(true) => match pairing.submit_pairing(&code).await {
                        Ok(credentials) => {
                            self.set_state(PlayerState::CertIssued).await;
                            if let Err(e) =
                                self.adopt_credentials(code.device_id.clone(), &credentials).await
                            {
                                warn!("Failed to adopt new credentials: {e}");
                                self.set_state(PlayerState::NeedPairing).await;
                                break;
                            }
                            if let Err(e) =
                                self.enter_playback_running(code.device_id.clone()).await
                            {
                                warn!("Failed to start playback: {e}");
                            }
                            return;
                        }
                        Err(e) => {
                            warn!("Pairing completion failed: {e}");
                            self.set_state(PlayerState::NeedPairing).await;
                            break;
                        }
                    },
                    Ok(false) => {
                        if sleep_or_cancel(Duration::from_secs(5), &cancel).await {
                            return;
                        }
                    }
                    Err(hexmon_common::Error::NotFound(_)) => {
                        info!("Pairing code unknown to backend; requesting a new one");
                        self.set_state(PlayerState::NeedPairing).await;
                        break;
                    }
                    Err(e) => {
                        warn!("Pairing status poll failed: {e}");
                        if sleep_or_cancel(Duration::from_secs(5), &cancel).await {
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn adopt_credentials(
        &self,
        device_id: String,
        credentials: &crate::certs::DeviceCredentials,
    ) -> Result<()> {
        let api_base = {
            let mut config = self.config.write().await;
            config.device_id = Some(device_id.clone());
            if let Err(e) = config.save(&self.config_path) {
                warn!("Failed to persist device id: {e}");
            }
            config.api_base.clone()
        };

        self.backend
            .replace(HttpClient::with_credentials(&api_base, credentials)?)
            .await;
        self.snapshots.set_device_id(device_id).await;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Playback services
    // -----------------------------------------------------------------

    async fn enter_playback_running(self: &Arc<Self>, device_id: String) -> Result<()> {
        let cancel = self.root_cancel().await;
        let config = self.config.read().await.clone();

        // Subscribe before anything can emit, so the replayed persisted
        // playlist is not lost to an unsubscribed bus.
        let events = self.bus.subscribe();

        // Replay persisted documents before the first network call so the
        // device starts rendering immediately.
        self.snapshots.load_persisted().await;
        self.default_media.load_persisted().await;

        let proof_of_play = Arc::new(BackendProofOfPlay::new(
            self.queue.clone(),
            &config.api_base,
            &device_id,
        ));
        let engine = Arc::new(PlaybackEngine::new(
            self.cache.clone(),
            self.collaborators.renderer.clone(),
            proof_of_play,
            self.collaborators.telemetry.clone(),
        ));
        *self.engine.lock().await = Some(engine.clone());

        let commands = Arc::new(CommandProcessor::new(
            self.backend.clone(),
            self.queue.clone(),
            CommandContext {
                cache: self.cache.clone(),
                snapshots: self.snapshots.clone(),
                renderer: self.collaborators.renderer.clone(),
                screenshot: self.collaborators.screenshot.clone(),
                reboot: self.collaborators.reboot.clone(),
            },
            device_id,
            Duration::from_millis(config.intervals.command_poll_ms),
        ));
        *self.commands.lock().await = Some(commands.clone());

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(
            Arc::clone(self).bus_listener(engine, events, cancel.clone()),
        ));
        tasks.push(tokio::spawn(
            self.snapshots.clone().run(cancel.clone()),
        ));
        tasks.push(tokio::spawn(commands.run(cancel.clone())));
        tasks.push(tokio::spawn(
            self.default_media.clone().run(cancel.clone()),
        ));
        tasks.push(tokio::spawn(
            self.queue
                .clone()
                .run_worker(self.backend.clone(), cancel.clone()),
        ));
        tasks.push(tokio::spawn(Arc::clone(self).screenshot_loop(
            Duration::from_millis(config.intervals.screenshot_ms),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(Arc::clone(self).health_loop(
            Duration::from_millis(config.intervals.health_check_ms.max(1_000)),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(Arc::clone(self).heartbeat_loop(
            Duration::from_millis(config.intervals.heartbeat_ms),
            cancel,
        )));
        drop(tasks);

        self.set_state(PlayerState::PlaybackRunning).await;
        Ok(())
    }

    /// Forward bus events into the engine and renderer, and track the
    /// running/offline split from playlist modes.
    async fn bus_listener(
        self: Arc<Self>,
        engine: Arc<PlaybackEngine>,
        mut events: tokio::sync::broadcast::Receiver<PlayerEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = cancel.cancelled() => return,
            };

            match event {
                Ok(PlayerEvent::PlaylistUpdated { playlist, .. }) => {
                    engine.apply_playlist(&playlist).await;
                    let state = if playlist.mode.is_playable() {
                        PlayerState::PlaybackRunning
                    } else {
                        PlayerState::OfflineFallback
                    };
                    self.set_state(state).await;
                }
                Ok(PlayerEvent::DefaultMediaChanged { media, .. }) => {
                    let _ = self
                        .collaborators
                        .renderer
                        .send(RendererMessage::DefaultMediaChanged { media })
                        .await;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Bus listener lagged, {missed} events dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn screenshot_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        loop {
            if sleep_or_cancel(interval, &cancel).await {
                return;
            }
            match self.collaborators.screenshot.capture_and_upload().await {
                Ok(key) => debug!("Periodic screenshot uploaded as {key}"),
                Err(e) => debug!("Periodic screenshot skipped: {e}"),
            }
        }
    }

    async fn health_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        loop {
            let report = self.backend.client().await.check_connectivity().await;
            let was_online = self.online.swap(report.online, Ordering::Relaxed);
            if was_online != report.online {
                info!(
                    "Connectivity changed: online={} (status {:?})",
                    report.online, report.status
                );
                self.push_status().await;
            }

            let config = self.config.read().await.clone();
            if config.mtls.auto_renew && self.certs.needs_renewal(config.mtls.renew_before_days) {
                warn!(
                    "Client certificate is inside the {}-day renewal window; re-pair to renew",
                    config.mtls.renew_before_days
                );
            }

            if sleep_or_cancel(interval, &cancel).await {
                return;
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        loop {
            if sleep_or_cancel(interval, &cancel).await {
                return;
            }
            let status = self.status().await;
            self.collaborators.telemetry.heartbeat(&status).await;
        }
    }

    // -----------------------------------------------------------------
    // Status and diagnostics
    // -----------------------------------------------------------------

    async fn set_state(&self, state: PlayerState) {
        {
            let mut current = self.state.write().await;
            if *current == state {
                return;
            }
            debug!("Player state {:?} -> {state:?}", *current);
            *current = state;
        }
        self.push_status().await;
    }

    async fn push_status(&self) {
        let status = self.status().await;
        self.bus.emit_lossy(PlayerEvent::PlayerStatusChanged {
            status: status.clone(),
            timestamp: Utc::now(),
        });
        let _ = self
            .collaborators
            .renderer
            .send(RendererMessage::PlayerStatus { status })
            .await;
    }

    /// Composite status record exposed to the renderer
    pub async fn status(&self) -> PlayerStatus {
        let playlist = self.snapshots.current_playlist().await;
        let engine = self.engine.lock().await.clone();
        let (current_media_id, error) = match &engine {
            Some(engine) => (engine.current_media_id().await, engine.last_error().await),
            None => (None, None),
        };

        PlayerStatus {
            state: *self.state.read().await,
            mode: playlist.mode,
            online: self.online.load(Ordering::Relaxed),
            device_id: self.config.read().await.device_id.clone(),
            schedule_id: playlist.schedule_id,
            last_snapshot_at: self.snapshots.last_snapshot_at().await,
            current_media_id,
            error,
        }
    }

    /// Assemble the diagnostics report for the renderer's diagnostics view
    pub async fn diagnostics(&self) -> DiagnosticsReport {
        let status = self.status().await;
        let engine = self.engine.lock().await.clone();
        let scheduler_jitter = match &engine {
            Some(engine) => engine.jitter().await,
            None => None,
        };
        let cert_meta = self.certs.metadata().ok().flatten();
        let config = self.config.read().await.clone();
        let commands = self.commands.lock().await.clone();
        let command_history_len = match &commands {
            Some(commands) => commands.history_len().await,
            None => 0,
        };

        DiagnosticsReport {
            state: status.state,
            mode: status.mode,
            online: status.online,
            uptime_s: self.started_at.elapsed().as_secs(),
            cache: self.cache.stats().await,
            scheduler_jitter,
            cert_present: self.certs.verify_certificate(),
            cert_expires_at: cert_meta.map(|m| m.valid_to),
            cert_needs_renewal: self.certs.needs_renewal(config.mtls.renew_before_days),
            queue_depth: self.queue.depth().await,
            command_history_len,
            ws_state: "disconnected",
        }
    }

    /// Cache directory in use (diagnostics and tests)
    pub fn cache_dir(&self) -> &std::path::Path {
        &self.cache_dir
    }
}

/// True when the cancel fired during the sleep
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancel.cancelled() => true,
    }
}

/// Device description for the pairing request, from the host environment
fn device_info() -> DeviceInfo {
    DeviceInfo {
        device_label: std::env::var("HOSTNAME").unwrap_or_else(|_| "hexmon-player".to_string()),
        width: 1920,
        height: 1080,
        orientation: "landscape".to_string(),
        aspect_ratio: "16:9".to_string(),
        model: std::env::var("HEXMON_MODEL").unwrap_or_else(|_| "generic".to_string()),
        codecs: vec!["h264".to_string(), "vp9".to_string()],
    }
}
