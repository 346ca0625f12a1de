//! Event system for the signage player
//!
//! The runtime uses hybrid communication:
//! - **EventBus** (tokio::broadcast): one-to-many, fire-and-forget events
//!   (`PlaylistUpdated`, `PlayerStatusChanged`, `DefaultMediaChanged`)
//! - **mpsc channels**: scheduler -> playback engine internal events
//! - **Shared state** (`Arc<RwLock<T>>`): read-heavy status access
//!
//! Emission never blocks producers; a lagging subscriber drops old events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{DefaultMediaDoc, PlaybackPlaylist, PlayerStatus};

/// Broadcast events crossing component boundaries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlayerEvent {
    /// Snapshot manager produced a new playlist
    PlaylistUpdated {
        playlist: PlaybackPlaylist,
        timestamp: DateTime<Utc>,
    },

    /// Device-level status record changed
    PlayerStatusChanged {
        status: PlayerStatus,
        timestamp: DateTime<Utc>,
    },

    /// CMS-level default media changed
    DefaultMediaChanged {
        media: DefaultMediaDoc,
        timestamp: DateTime<Utc>,
    },

    /// A remote command finished processing
    CommandCompleted {
        command_id: String,
        command_type: String,
        success: bool,
        timestamp: DateTime<Utc>,
    },
}

/// One-to-many event broadcaster
///
/// Thin wrapper over `tokio::sync::broadcast` so emitting with zero
/// subscribers is a non-event rather than an error at every call site.
pub struct EventBus {
    tx: broadcast::Sender<PlayerEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a new EventBus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; returns the subscriber count, Err when nobody listens
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: PlayerEvent,
    ) -> Result<usize, broadcast::error::SendError<PlayerEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring whether anyone is listening
    pub fn emit_lossy(&self, event: PlayerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playlist_event() -> PlayerEvent {
        PlayerEvent::PlaylistUpdated {
            playlist: PlaybackPlaylist::empty(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_eventbus_new() {
        let bus = EventBus::new(64);
        assert_eq!(bus.capacity(), 64);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_emit_with_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        assert!(bus.emit(playlist_event()).is_ok());
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, PlayerEvent::PlaylistUpdated { .. }));
    }

    #[test]
    fn test_emit_lossy_without_subscribers() {
        let bus = EventBus::new(16);
        // Must not panic or error when nobody listens
        bus.emit_lossy(playlist_event());
        assert!(bus.emit(playlist_event()).is_err());
    }
}
