//! Remote command processing
//!
//! Polls the backend for pending commands and dispatches them in receive
//! order. Guarantees:
//!
//! - at-most-once processing (in-flight set plus completed history)
//! - per-type rate limiting: one execution per 60 s window, rejected
//!   attempts still ack with `success:false`
//! - every outcome lands in a bounded history (last 100 results)
//! - acknowledgements that fail to POST are queued for retried delivery
//!
//! Command failures never crash the process; they ack as failures.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hexmon_common::model::{Command, CommandResult, CommandType};

use crate::cache::CacheManager;
use crate::http::Backend;
use crate::renderer::{PlaybackUpdate, RebootHandle, RendererMessage, RendererSink, ScreenshotCapture};
use crate::request_queue::RequestQueue;
use crate::snapshot::SnapshotManager;

/// Minimum spacing between two executions of the same command type
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Bounded history size
const HISTORY_LIMIT: usize = 100;

/// Delay before a commanded relaunch
const REBOOT_DELAY: Duration = Duration::from_secs(2);

/// Effect targets a command dispatch can reach
pub struct CommandContext {
    pub cache: Arc<CacheManager>,
    pub snapshots: Arc<SnapshotManager>,
    pub renderer: Arc<dyn RendererSink>,
    pub screenshot: Arc<dyn ScreenshotCapture>,
    pub reboot: Arc<dyn RebootHandle>,
}

/// Polled remote-command channel
pub struct CommandProcessor {
    backend: Arc<Backend>,
    queue: Arc<RequestQueue>,
    context: CommandContext,
    device_id: String,
    poll_interval: Duration,
    started_at: Instant,
    in_flight: Mutex<HashSet<String>>,
    last_run: Mutex<HashMap<String, Instant>>,
    history: Mutex<VecDeque<CommandResult>>,
}

impl CommandProcessor {
    pub fn new(
        backend: Arc<Backend>,
        queue: Arc<RequestQueue>,
        context: CommandContext,
        device_id: String,
        poll_interval: Duration,
    ) -> Self {
        Self {
            backend,
            queue,
            context,
            device_id,
            poll_interval,
            started_at: Instant::now(),
            in_flight: Mutex::new(HashSet::new()),
            last_run: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn history_len(&self) -> usize {
        self.history.lock().await.len()
    }

    pub async fn history(&self) -> Vec<CommandResult> {
        self.history.lock().await.iter().cloned().collect()
    }

    /// Poll loop until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            self.poll_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => {
                    debug!("Command processor stopping");
                    return;
                }
            }
        }
    }

    /// Fetch and process pending commands, sequentially in receive order
    pub async fn poll_once(&self) {
        let client = self.backend.client().await;
        let path = format!("/v1/device/{}/commands", self.device_id);
        let body = match client.get_json(&path).await {
            Ok(body) => body,
            Err(e) => {
                debug!("Command poll failed: {e}");
                return;
            }
        };

        let raw_commands = body
            .get("commands")
            .and_then(|v| v.as_array())
            .cloned()
            .or_else(|| body.as_array().cloned())
            .unwrap_or_default();

        for raw in &raw_commands {
            let Some(command) = Command::from_value(raw) else {
                warn!("Ignoring malformed command object");
                continue;
            };
            self.process(command).await;
        }
    }

    async fn process(&self, command: Command) {
        // At-most-once: skip ids currently in flight or already completed
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(command.id.clone()) {
                debug!("Skipping in-flight command {}", command.id);
                return;
            }
        }
        if self.already_completed(&command.id).await {
            self.in_flight.lock().await.remove(&command.id);
            debug!("Skipping already-completed command {}", command.id);
            return;
        }

        let type_key = command.command_type.as_str().to_string();
        let rate_limited = {
            let last_run = self.last_run.lock().await;
            last_run
                .get(&type_key)
                .is_some_and(|at| at.elapsed() < RATE_LIMIT_WINDOW)
        };

        let result = if rate_limited {
            info!("Command {} ({type_key}) rate limited", command.id);
            CommandResult::failed(&command, "Rate limited")
        } else {
            self.dispatch(&command).await
        };

        self.push_history(result.clone()).await;
        self.ack(&result).await;
        // The rate-limit window is consumed only once the result is
        // recorded and acknowledged
        if !rate_limited {
            self.last_run.lock().await.insert(type_key, Instant::now());
        }
        self.in_flight.lock().await.remove(&command.id);
    }

    async fn dispatch(&self, command: &Command) -> CommandResult {
        info!(
            "Dispatching command {} ({})",
            command.id,
            command.command_type.as_str()
        );
        match &command.command_type {
            CommandType::Reboot => {
                self.context.reboot.schedule_relaunch(REBOOT_DELAY);
                CommandResult::ok(
                    command,
                    Some(serde_json::json!({
                        "relaunchInMs": REBOOT_DELAY.as_millis() as u64
                    })),
                )
            }
            CommandType::RefreshSchedule => {
                self.context.snapshots.refresh_once().await;
                CommandResult::ok(command, None)
            }
            CommandType::Screenshot => {
                match self.context.screenshot.capture_and_upload().await {
                    Ok(object_key) => CommandResult::ok(
                        command,
                        Some(serde_json::json!({ "objectKey": object_key })),
                    ),
                    Err(e) => CommandResult::failed(command, e.to_string()),
                }
            }
            CommandType::TestPattern => {
                let message = RendererMessage::PlaybackUpdate(PlaybackUpdate::TestPattern {
                    params: command.params.clone(),
                });
                match self.context.renderer.send(message).await {
                    Ok(()) => CommandResult::ok(command, None),
                    Err(e) => CommandResult::failed(command, e.to_string()),
                }
            }
            CommandType::ClearCache => {
                let force = command.params.get("force").and_then(|v| v.as_bool()) == Some(true);
                match self.context.cache.clear(force).await {
                    Ok(()) => CommandResult::ok(command, None),
                    Err(e) => CommandResult::failed(command, e.to_string()),
                }
            }
            CommandType::Ping => CommandResult::ok(
                command,
                Some(serde_json::json!({
                    "uptime": self.started_at.elapsed().as_secs(),
                    "version": env!("CARGO_PKG_VERSION"),
                })),
            ),
            CommandType::Unknown(other) => {
                CommandResult::failed(command, format!("Unknown command type: {other}"))
            }
        }
    }

    async fn already_completed(&self, command_id: &str) -> bool {
        self.history
            .lock()
            .await
            .iter()
            .any(|r| r.command_id == command_id)
    }

    async fn push_history(&self, result: CommandResult) {
        let mut history = self.history.lock().await;
        if history.len() >= HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(result);
    }

    /// Acknowledge a result; failures fall back to the persistent queue
    async fn ack(&self, result: &CommandResult) {
        let payload = match serde_json::to_value(result) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Unserializable command result: {e}");
                return;
            }
        };

        let client = self.backend.client().await;
        let path = format!(
            "/v1/device/{}/commands/{}/ack",
            self.device_id, result.command_id
        );
        if let Err(e) = client.post_json(&path, &payload).await {
            warn!(
                "Ack for command {} failed ({e}); queueing for retry",
                result.command_id
            );
            let url = format!("{}{}", client.base(), path);
            self.queue.enqueue("POST", &url, payload, None).await;
        }
    }
}
