//! Timeline scheduler
//!
//! Plays an ordered, non-empty item sequence forward on a monotonic clock,
//! looping indefinitely. Per item the scheduler emits:
//!
//! - `PlayItem` at the scheduled start
//! - `TransitionStart` at `start + display - transition` (only when the
//!   item declares a transition), guaranteed to precede `ItemComplete`
//! - `ItemComplete` at `start + display`
//! - `TimelineComplete` when the sequence wraps
//!
//! Events flow over an mpsc channel to the playback engine. Pause cancels
//! the outstanding timer and preserves the remainder of the current item's
//! display budget; resume continues from there. Per-tick drift is
//! accumulated into jitter statistics for diagnostics.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use hexmon_common::model::TimelineItem;

/// Scheduler output events, in guaranteed order per item
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    PlayItem {
        item: TimelineItem,
    },
    TransitionStart {
        from: TimelineItem,
        to: Option<TimelineItem>,
        duration_ms: u64,
    },
    ItemComplete {
        item: TimelineItem,
    },
    TimelineComplete,
}

enum Ctrl {
    Pause,
    Resume,
    Stop,
}

/// Tick drift statistics
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct JitterStats {
    pub ticks: u64,
    pub mean_us: u64,
    pub max_us: u64,
}

#[derive(Default)]
struct JitterAccum {
    ticks: u64,
    sum_us: u64,
    max_us: u64,
}

impl JitterAccum {
    fn record(&mut self, drift: Duration) {
        let us = drift.as_micros() as u64;
        self.ticks += 1;
        self.sum_us += us;
        self.max_us = self.max_us.max(us);
    }

    fn stats(&self) -> JitterStats {
        JitterStats {
            ticks: self.ticks,
            mean_us: if self.ticks > 0 {
                self.sum_us / self.ticks
            } else {
                0
            },
            max_us: self.max_us,
        }
    }
}

enum WaitOutcome {
    Completed,
    Stopped,
}

/// Handle over a running timeline task
pub struct TimelineScheduler {
    ctrl_tx: mpsc::UnboundedSender<Ctrl>,
    jitter: Arc<Mutex<JitterAccum>>,
    handle: JoinHandle<()>,
}

impl TimelineScheduler {
    /// Start playing `items` in order, looping indefinitely.
    ///
    /// `items` must be non-empty; the returned receiver carries the
    /// scheduler events.
    pub fn start(items: Vec<TimelineItem>) -> (Self, mpsc::Receiver<SchedulerEvent>) {
        debug_assert!(!items.is_empty(), "timeline requires at least one item");

        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(32);
        let jitter = Arc::new(Mutex::new(JitterAccum::default()));

        let handle = tokio::spawn(run_timeline(items, ctrl_rx, events_tx, jitter.clone()));

        (
            Self {
                ctrl_tx,
                jitter,
                handle,
            },
            events_rx,
        )
    }

    /// Freeze the current item; timers are cancelled, no events fire
    pub fn pause(&self) {
        let _ = self.ctrl_tx.send(Ctrl::Pause);
    }

    /// Continue with the remainder of the current item's display budget
    pub fn resume(&self) {
        let _ = self.ctrl_tx.send(Ctrl::Resume);
    }

    /// Cancel all outstanding timers and end the timeline task
    pub async fn stop(mut self) {
        let _ = self.ctrl_tx.send(Ctrl::Stop);
        // JoinHandle is Unpin, so poll it in place; Drop re-sends Stop on
        // a closed channel, which is harmless.
        let _ = (&mut self.handle).await;
    }

    pub async fn jitter(&self) -> JitterStats {
        self.jitter.lock().await.stats()
    }
}

impl Drop for TimelineScheduler {
    fn drop(&mut self) {
        // Ensure the task exits when the handle is dropped without stop()
        let _ = self.ctrl_tx.send(Ctrl::Stop);
    }
}

async fn run_timeline(
    items: Vec<TimelineItem>,
    mut ctrl_rx: mpsc::UnboundedReceiver<Ctrl>,
    events_tx: mpsc::Sender<SchedulerEvent>,
    jitter: Arc<Mutex<JitterAccum>>,
) {
    if items.is_empty() {
        return;
    }
    let len = items.len();
    let mut index = 0usize;

    loop {
        let item = items[index].clone();
        let next = items[(index + 1) % len].clone();

        if events_tx
            .send(SchedulerEvent::PlayItem { item: item.clone() })
            .await
            .is_err()
        {
            return;
        }

        let start = Instant::now();
        let display = Duration::from_millis(item.display_ms.max(1));
        let transition =
            Duration::from_millis(item.transition_duration_ms.min(item.display_ms));

        // Pauses during this item extend both deadlines by the paused time
        let mut shift = Duration::ZERO;

        if !transition.is_zero() {
            let deadline = start + display - transition;
            match wait_until(deadline, &mut ctrl_rx, &mut shift, &jitter).await {
                WaitOutcome::Stopped => return,
                WaitOutcome::Completed => {
                    if events_tx
                        .send(SchedulerEvent::TransitionStart {
                            from: item.clone(),
                            to: Some(next),
                            duration_ms: transition.as_millis() as u64,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }

        match wait_until(start + display, &mut ctrl_rx, &mut shift, &jitter).await {
            WaitOutcome::Stopped => return,
            WaitOutcome::Completed => {}
        }

        if events_tx
            .send(SchedulerEvent::ItemComplete { item })
            .await
            .is_err()
        {
            return;
        }

        index += 1;
        if index == len {
            index = 0;
            debug!("Timeline wrapped after {len} items");
            if events_tx
                .send(SchedulerEvent::TimelineComplete)
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

/// Sleep until `deadline + *shift`, handling pause/resume/stop.
///
/// Time spent paused is added to `*shift` so the caller's later deadlines
/// move by the same amount.
async fn wait_until(
    deadline: Instant,
    ctrl_rx: &mut mpsc::UnboundedReceiver<Ctrl>,
    shift: &mut Duration,
    jitter: &Arc<Mutex<JitterAccum>>,
) -> WaitOutcome {
    let mut deadline = deadline + *shift;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                let drift = Instant::now().saturating_duration_since(deadline);
                jitter.lock().await.record(drift);
                return WaitOutcome::Completed;
            }
            msg = ctrl_rx.recv() => match msg {
                Some(Ctrl::Pause) => {
                    let pause_start = Instant::now();
                    loop {
                        match ctrl_rx.recv().await {
                            Some(Ctrl::Resume) => {
                                let paused = pause_start.elapsed();
                                deadline += paused;
                                *shift += paused;
                                break;
                            }
                            Some(Ctrl::Pause) => continue,
                            Some(Ctrl::Stop) | None => return WaitOutcome::Stopped,
                        }
                    }
                }
                Some(Ctrl::Resume) => continue,
                Some(Ctrl::Stop) | None => return WaitOutcome::Stopped,
            }
        }
    }
}
