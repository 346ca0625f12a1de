//! Domain model for the signage player
//!
//! Types crossing component boundaries: timeline items produced by the
//! snapshot parser, playlists emitted to the playback engine, remote
//! commands, and the device-level state exposed to the renderer.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Display duration applied when the backend omits or zeroes `display_ms`
pub const DEFAULT_DISPLAY_MS: u64 = 10_000;

/// Media kind of a timeline item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Image,
    Video,
    Pdf,
    Url,
}

impl ItemType {
    /// Infer the media kind from a URL path extension.
    ///
    /// Explicit backend `type` fields take precedence over this inference;
    /// unknown extensions default to `Image`.
    pub fn infer_from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let ext = path
            .rsplit('.')
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        match ext.as_str() {
            "mp4" | "webm" | "mov" | "m4v" => ItemType::Video,
            "pdf" => ItemType::Pdf,
            _ => ItemType::Image,
        }
    }
}

/// How media is fitted into the display area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    #[default]
    Contain,
    Cover,
    Stretch,
}

impl FitMode {
    /// Normalize a backend-provided fit string, defaulting to `Contain`
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cover" => FitMode::Cover,
            "stretch" => FitMode::Stretch,
            _ => FitMode::Contain,
        }
    }
}

/// One scheduled entry of the playback timeline
///
/// Items are immutable once produced by the snapshot parser; the snapshot
/// manager only fills `local_path`/`local_url` after the media is cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineItem {
    /// Backend item identifier
    pub id: String,
    /// Media object identifier (None for inline URL items)
    pub media_id: Option<String>,
    /// Media kind
    #[serde(rename = "type")]
    pub item_type: ItemType,
    /// Signed download URL, when the item references remote media
    pub remote_url: Option<String>,
    /// Path of the cached media file, filled after caching
    pub local_path: Option<PathBuf>,
    /// file:// URL of the cached media, filled after caching
    pub local_url: Option<String>,
    /// Display duration in milliseconds (>= 1)
    pub display_ms: u64,
    /// Fit mode for the renderer
    pub fit: FitMode,
    /// Whether video audio is muted
    pub muted: bool,
    /// Expected SHA-256 of the media bytes, when the backend provides one
    pub sha256: Option<String>,
    /// Transition duration into the next item, in milliseconds
    pub transition_duration_ms: u64,
    /// Opaque backend metadata passed through to the renderer
    pub meta: serde_json::Value,
}

impl TimelineItem {
    /// Minimal item used where only id/media/duration matter
    pub fn new(id: impl Into<String>, media_id: Option<String>, display_ms: u64) -> Self {
        Self {
            id: id.into(),
            media_id,
            item_type: ItemType::Image,
            remote_url: None,
            local_path: None,
            local_url: None,
            display_ms,
            fit: FitMode::Contain,
            muted: false,
            sha256: None,
            transition_duration_ms: 0,
            meta: serde_json::Value::Null,
        }
    }
}

/// Snapshot document normalized from the backend payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedSnapshot {
    /// Backend snapshot identifier
    pub snapshot_id: Option<String>,
    /// Backend schedule identifier
    pub schedule_id: Option<String>,
    /// Scheduled items in the backend's declared order
    pub items: Vec<TimelineItem>,
    /// Active emergency override item, when present
    pub emergency_item: Option<TimelineItem>,
    /// CMS-level default media item, when present
    pub default_item: Option<TimelineItem>,
    /// media_id -> signed URL map
    pub media_url_map: HashMap<String, String>,
    /// When the snapshot was fetched (or loaded from disk)
    pub fetched_at: DateTime<Utc>,
    /// Raw backend payload, persisted verbatim for offline restart
    pub raw: serde_json::Value,
}

/// Active content mode of the player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaylistMode {
    Normal,
    Emergency,
    Default,
    Offline,
    Empty,
}

impl PlaylistMode {
    /// Derive the playlist mode with strict precedence:
    /// emergency, then normal (non-empty items), then default, then the
    /// offline/empty fallback supplied by the caller.
    pub fn derive(
        has_emergency: bool,
        item_count: usize,
        has_default: bool,
        fallback: PlaylistMode,
    ) -> Self {
        if has_emergency {
            PlaylistMode::Emergency
        } else if item_count > 0 {
            PlaylistMode::Normal
        } else if has_default {
            PlaylistMode::Default
        } else {
            fallback
        }
    }

    /// True for modes with playable content
    pub fn is_playable(&self) -> bool {
        matches!(
            self,
            PlaylistMode::Normal | PlaylistMode::Emergency | PlaylistMode::Default
        )
    }
}

/// Playlist handed to the playback engine
///
/// `items` contain only entries whose media is present in the local cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackPlaylist {
    pub mode: PlaylistMode,
    pub items: Vec<TimelineItem>,
    pub schedule_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub last_snapshot_at: Option<DateTime<Utc>>,
}

impl PlaybackPlaylist {
    /// Empty playlist for devices with nothing to play
    pub fn empty() -> Self {
        Self {
            mode: PlaylistMode::Empty,
            items: Vec::new(),
            schedule_id: None,
            snapshot_id: None,
            last_snapshot_at: None,
        }
    }
}

/// Remote command type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandType {
    Reboot,
    RefreshSchedule,
    Screenshot,
    TestPattern,
    ClearCache,
    Ping,
    /// Preserved verbatim so unknown commands can still be acknowledged
    Unknown(String),
}

impl CommandType {
    pub fn parse(s: &str) -> Self {
        match s {
            "REBOOT" => CommandType::Reboot,
            "REFRESH_SCHEDULE" => CommandType::RefreshSchedule,
            "SCREENSHOT" => CommandType::Screenshot,
            "TEST_PATTERN" => CommandType::TestPattern,
            "CLEAR_CACHE" => CommandType::ClearCache,
            "PING" => CommandType::Ping,
            other => CommandType::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            CommandType::Reboot => "REBOOT",
            CommandType::RefreshSchedule => "REFRESH_SCHEDULE",
            CommandType::Screenshot => "SCREENSHOT",
            CommandType::TestPattern => "TEST_PATTERN",
            CommandType::ClearCache => "CLEAR_CACHE",
            CommandType::Ping => "PING",
            CommandType::Unknown(s) => s,
        }
    }
}

/// Remote command received from the backend
#[derive(Debug, Clone)]
pub struct Command {
    /// Unique command identifier, used for at-most-once processing
    pub id: String,
    pub command_type: CommandType,
    /// Command-specific parameters
    pub params: serde_json::Value,
}

impl Command {
    /// Parse one command object from the backend commands payload.
    ///
    /// Returns None when the object has no usable id.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;
        let id = obj.get("id").and_then(|v| v.as_str())?.to_string();
        let type_str = obj
            .get("type")
            .or_else(|| obj.get("command_type"))
            .or_else(|| obj.get("commandType"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let params = obj
            .get("params")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        Some(Self {
            id,
            command_type: CommandType::parse(type_str),
            params,
        })
    }
}

/// Outcome of one processed command, kept in the bounded history and sent
/// as the ack payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub command_type: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub completed_at: DateTime<Utc>,
}

impl CommandResult {
    pub fn ok(command: &Command, data: Option<serde_json::Value>) -> Self {
        Self {
            command_id: command.id.clone(),
            command_type: command.command_type.as_str().to_string(),
            success: true,
            error: None,
            data,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(command: &Command, error: impl Into<String>) -> Self {
        Self {
            command_id: command.id.clone(),
            command_type: command.command_type.as_str().to_string(),
            success: false,
            error: Some(error.into()),
            data: None,
            completed_at: Utc::now(),
        }
    }
}

/// Device-level player state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerState {
    Boot,
    NeedPairing,
    PairingRequested,
    WaitingConfirmation,
    CertIssued,
    PlaybackRunning,
    OfflineFallback,
}

/// Composite status record exposed to the renderer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerStatus {
    pub state: PlayerState,
    pub mode: PlaylistMode,
    pub online: bool,
    pub device_id: Option<String>,
    pub schedule_id: Option<String>,
    pub last_snapshot_at: Option<DateTime<Utc>>,
    pub current_media_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PlayerStatus {
    pub fn booting() -> Self {
        Self {
            state: PlayerState::Boot,
            mode: PlaylistMode::Empty,
            online: false,
            device_id: None,
            schedule_id: None,
            last_snapshot_at: None,
            current_media_id: None,
            error: None,
        }
    }
}

/// CMS-level default media document (C12)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultMediaDoc {
    pub media_id: Option<String>,
    pub media: Option<DefaultMediaInfo>,
}

/// Media descriptor inside a default-media document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultMediaInfo {
    pub id: Option<String>,
    pub name: Option<String>,
    /// IMAGE, VIDEO or DOCUMENT
    #[serde(rename = "type")]
    pub media_type: Option<String>,
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_content_type: Option<String>,
}

impl DefaultMediaDoc {
    /// True when any renderer-visible field differs from `other`.
    ///
    /// Drives the `changed` event: identical documents re-fetched on a poll
    /// cycle must stay silent.
    pub fn differs_from(&self, other: &DefaultMediaDoc) -> bool {
        self != other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_type_inference() {
        assert_eq!(ItemType::infer_from_url("https://u/a.mp4"), ItemType::Video);
        assert_eq!(
            ItemType::infer_from_url("https://u/a.webm?sig=x"),
            ItemType::Video
        );
        assert_eq!(ItemType::infer_from_url("https://u/a.mov"), ItemType::Video);
        assert_eq!(ItemType::infer_from_url("https://u/a.m4v"), ItemType::Video);
        assert_eq!(ItemType::infer_from_url("https://u/a.pdf"), ItemType::Pdf);
        assert_eq!(ItemType::infer_from_url("https://u/a.png"), ItemType::Image);
        // Unknown extensions default to image
        assert_eq!(ItemType::infer_from_url("https://u/a"), ItemType::Image);
    }

    #[test]
    fn test_fit_mode_normalization() {
        assert_eq!(FitMode::parse("cover"), FitMode::Cover);
        assert_eq!(FitMode::parse("STRETCH"), FitMode::Stretch);
        assert_eq!(FitMode::parse("contain"), FitMode::Contain);
        assert_eq!(FitMode::parse("garbage"), FitMode::Contain);
    }

    #[test]
    fn test_mode_precedence() {
        // Emergency wins over everything
        assert_eq!(
            PlaylistMode::derive(true, 5, true, PlaylistMode::Empty),
            PlaylistMode::Emergency
        );
        // Non-empty items -> normal
        assert_eq!(
            PlaylistMode::derive(false, 2, true, PlaylistMode::Empty),
            PlaylistMode::Normal
        );
        // Default media when nothing scheduled
        assert_eq!(
            PlaylistMode::derive(false, 0, true, PlaylistMode::Empty),
            PlaylistMode::Default
        );
        // Fallback mode otherwise
        assert_eq!(
            PlaylistMode::derive(false, 0, false, PlaylistMode::Offline),
            PlaylistMode::Offline
        );
        assert_eq!(
            PlaylistMode::derive(false, 0, false, PlaylistMode::Empty),
            PlaylistMode::Empty
        );
    }

    #[test]
    fn test_command_type_roundtrip() {
        for s in [
            "REBOOT",
            "REFRESH_SCHEDULE",
            "SCREENSHOT",
            "TEST_PATTERN",
            "CLEAR_CACHE",
            "PING",
        ] {
            assert_eq!(CommandType::parse(s).as_str(), s);
        }
        let unknown = CommandType::parse("SELF_DESTRUCT");
        assert_eq!(unknown, CommandType::Unknown("SELF_DESTRUCT".to_string()));
        assert_eq!(unknown.as_str(), "SELF_DESTRUCT");
    }

    #[test]
    fn test_command_from_value() {
        let v = serde_json::json!({"id": "c1", "type": "PING", "params": {"x": 1}});
        let cmd = Command::from_value(&v).unwrap();
        assert_eq!(cmd.id, "c1");
        assert_eq!(cmd.command_type, CommandType::Ping);
        assert_eq!(cmd.params["x"], 1);

        // camelCase alias
        let v = serde_json::json!({"id": "c2", "commandType": "REBOOT"});
        let cmd = Command::from_value(&v).unwrap();
        assert_eq!(cmd.command_type, CommandType::Reboot);

        // Missing id is unusable
        assert!(Command::from_value(&serde_json::json!({"type": "PING"})).is_none());
    }

    #[test]
    fn test_default_media_change_detection() {
        let a = DefaultMediaDoc {
            media_id: Some("m1".into()),
            media: Some(DefaultMediaInfo {
                id: Some("m1".into()),
                name: Some("Lobby".into()),
                media_type: Some("IMAGE".into()),
                media_url: Some("https://u/l.png".into()),
                source_content_type: None,
            }),
        };
        let same = a.clone();
        assert!(!a.differs_from(&same));

        let mut renamed = a.clone();
        renamed.media.as_mut().unwrap().name = Some("Lobby v2".into());
        assert!(a.differs_from(&renamed));
    }
}
