//! Player configuration loading and validation
//!
//! Configuration is a single JSON document at `{configDir}/config.json`
//! (0600). It is loaded once at process start and validated before any
//! component is constructed; an invalid configuration is the only fatal
//! startup error.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fsutil;

/// Minimum cache capacity (100 MiB)
pub const MIN_CACHE_BYTES: u64 = 100 * 1024 * 1024;

/// Player configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Backend base URL (required)
    pub api_base: String,
    /// WebSocket URL; derived from `api_base` when absent. The polled
    /// command channel is the only control path, so this is recorded for
    /// diagnostics only.
    pub ws_url: Option<String>,
    /// Device identifier assigned during pairing
    pub device_id: Option<String>,
    pub mtls: MtlsConfig,
    pub cache: CacheConfig,
    pub intervals: IntervalsConfig,
    pub log: LogConfig,
    pub power: PowerConfig,
    pub security: SecurityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            ws_url: None,
            device_id: None,
            mtls: MtlsConfig::default(),
            cache: CacheConfig::default(),
            intervals: IntervalsConfig::default(),
            log: LogConfig::default(),
            power: PowerConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

/// Mutual-TLS credential settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MtlsConfig {
    pub enabled: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub auto_renew: bool,
    /// Renewal window in days before `validTo`
    pub renew_before_days: i64,
}

impl Default for MtlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cert_path: None,
            key_path: None,
            ca_path: None,
            auto_renew: true,
            renew_before_days: 30,
        }
    }
}

/// Content cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Cache directory; `{dataDir}/cache` when absent
    pub path: Option<PathBuf>,
    /// Byte capacity bound
    pub max_bytes: u64,
    /// Concurrent prefetch downloads, 1..=10
    pub prefetch_concurrency: usize,
    /// Soft download bandwidth budget; advisory, 0 = unlimited
    pub bandwidth_budget_mbps: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_bytes: 1024 * 1024 * 1024, // 1 GiB
            prefetch_concurrency: 3,
            bandwidth_budget_mbps: 0,
        }
    }
}

/// Polling and timer intervals, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntervalsConfig {
    pub heartbeat_ms: u64,
    pub command_poll_ms: u64,
    pub schedule_poll_ms: u64,
    pub default_media_poll_ms: u64,
    pub health_check_ms: u64,
    pub screenshot_ms: u64,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 30_000,
            command_poll_ms: 30_000,
            schedule_poll_ms: 300_000,
            default_media_poll_ms: 300_000,
            health_check_ms: 60_000,
            screenshot_ms: 300_000,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// Shipping policy label, consumed by the log-shipping collaborator
    pub ship_policy: String,
    pub rotation_size_mb: u32,
    pub rotation_interval_hours: u32,
    pub compression_enabled: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ship_policy: "on-error".to_string(),
            rotation_size_mb: 50,
            rotation_interval_hours: 24,
            compression_enabled: true,
        }
    }
}

/// Display power management settings (applied by the kiosk host)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PowerConfig {
    pub dpms_enabled: bool,
    pub prevent_blanking: bool,
    pub schedule_enabled: bool,
    /// HH:MM, 24h clock
    pub on_time: Option<String>,
    /// HH:MM, 24h clock
    pub off_time: Option<String>,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            dpms_enabled: true,
            prevent_blanking: true,
            schedule_enabled: false,
            on_time: None,
            off_time: None,
        }
    }
}

/// Renderer hardening settings (applied by the kiosk host)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityConfig {
    pub csp: Option<String>,
    pub allowed_domains: Vec<String>,
    pub context_isolation: bool,
    pub sandbox: bool,
    pub node_integration: bool,
    pub disable_eval: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            csp: None,
            allowed_domains: Vec::new(),
            context_isolation: true,
            sandbox: true,
            node_integration: false,
            disable_eval: true,
        }
    }
}

impl Config {
    /// Load configuration from `path`.
    ///
    /// A missing file yields the defaults (which then fail validation until
    /// `api_base` is provided another way).
    pub fn load(path: &Path) -> Result<Self> {
        match fsutil::read_json::<Config>(path)? {
            Some(config) => Ok(config),
            None => Ok(Config::default()),
        }
    }

    /// Persist the configuration atomically with owner-only permissions
    pub fn save(&self, path: &Path) -> Result<()> {
        fsutil::atomic_write_json_sensitive(path, self)
    }

    /// Derive the WebSocket URL from `api_base` when not explicitly set
    pub fn effective_ws_url(&self) -> Option<String> {
        if let Some(ws) = &self.ws_url {
            return Some(ws.clone());
        }
        if self.api_base.is_empty() {
            return None;
        }
        Some(
            self.api_base
                .replacen("https://", "wss://", 1)
                .replacen("http://", "ws://", 1),
        )
    }

    /// Validate every configured value; refuses startup on the first batch
    /// of violations.
    pub fn validate(&self) -> Result<()> {
        let mut problems: Vec<String> = Vec::new();

        if self.api_base.is_empty() {
            problems.push("apiBase is required".to_string());
        } else if !self.api_base.starts_with("http://") && !self.api_base.starts_with("https://") {
            problems.push(format!("apiBase must be an HTTP(S) URL: {}", self.api_base));
        }

        if self.cache.max_bytes < MIN_CACHE_BYTES {
            problems.push(format!(
                "cache.maxBytes must be >= {} (got {})",
                MIN_CACHE_BYTES, self.cache.max_bytes
            ));
        }
        if !(1..=10).contains(&self.cache.prefetch_concurrency) {
            problems.push(format!(
                "cache.prefetchConcurrency must be in 1..=10 (got {})",
                self.cache.prefetch_concurrency
            ));
        }

        let iv = &self.intervals;
        for (name, value, min) in [
            ("intervals.heartbeatMs", iv.heartbeat_ms, 10_000),
            ("intervals.commandPollMs", iv.command_poll_ms, 5_000),
            ("intervals.schedulePollMs", iv.schedule_poll_ms, 10_000),
            (
                "intervals.defaultMediaPollMs",
                iv.default_media_poll_ms,
                10_000,
            ),
            ("intervals.screenshotMs", iv.screenshot_ms, 10_000),
        ] {
            if value < min {
                problems.push(format!("{name} must be >= {min} (got {value})"));
            }
        }

        match self.log.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => problems.push(format!("log.level is not a valid level: {other}")),
        }

        if self.mtls.renew_before_days < 0 {
            problems.push(format!(
                "mtls.renewBeforeDays must be >= 0 (got {})",
                self.mtls.renew_before_days
            ));
        }

        for (name, value) in [
            ("power.onTime", &self.power.on_time),
            ("power.offTime", &self.power.off_time),
        ] {
            if let Some(t) = value {
                if !is_valid_hh_mm(t) {
                    problems.push(format!("{name} must match HH:MM (got {t})"));
                }
            }
        }
        if self.power.schedule_enabled
            && (self.power.on_time.is_none() || self.power.off_time.is_none())
        {
            problems.push("power.scheduleEnabled requires onTime and offTime".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }
}

/// Validate an HH:MM 24-hour clock string
fn is_valid_hh_mm(s: &str) -> bool {
    let mut parts = s.split(':');
    let (Some(h), Some(m), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    if h.len() != 2 || m.len() != 2 {
        return false;
    }
    let (Ok(h), Ok(m)) = (h.parse::<u32>(), m.parse::<u32>()) else {
        return false;
    };
    h < 24 && m < 60
}

/// Resolve the player data directory, in priority order:
/// 1. Command-line argument
/// 2. `HEXMON_DATA_DIR` environment variable
/// 3. OS-dependent default (`~/.local/share/hexmon` on Linux)
pub fn resolve_data_dir(cli_arg: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("HEXMON_DATA_DIR") {
        return PathBuf::from(path);
    }
    dirs::data_local_dir()
        .map(|d| d.join("hexmon"))
        .unwrap_or_else(|| PathBuf::from("./hexmon-data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            api_base: "https://cms.example.com".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults_fail_without_api_base() {
        let err = Config::default().validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn test_interval_minimums() {
        let mut config = valid_config();
        config.intervals.command_poll_ms = 1_000;
        assert!(config.validate().is_err());

        config.intervals.command_poll_ms = 5_000;
        config.validate().unwrap();
    }

    #[test]
    fn test_cache_bounds() {
        let mut config = valid_config();
        config.cache.max_bytes = 1024;
        assert!(config.validate().is_err());

        config.cache.max_bytes = MIN_CACHE_BYTES;
        config.cache.prefetch_concurrency = 0;
        assert!(config.validate().is_err());
        config.cache.prefetch_concurrency = 11;
        assert!(config.validate().is_err());
        config.cache.prefetch_concurrency = 10;
        config.validate().unwrap();
    }

    #[test]
    fn test_power_schedule_times() {
        let mut config = valid_config();
        config.power.schedule_enabled = true;
        // Missing times are rejected
        assert!(config.validate().is_err());

        config.power.on_time = Some("07:30".to_string());
        config.power.off_time = Some("22:00".to_string());
        config.validate().unwrap();

        config.power.off_time = Some("25:00".to_string());
        assert!(config.validate().is_err());
        config.power.off_time = Some("9:5".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ws_url_derivation() {
        let mut config = valid_config();
        assert_eq!(
            config.effective_ws_url().unwrap(),
            "wss://cms.example.com".to_string()
        );

        config.ws_url = Some("wss://other.example.com/ws".to_string());
        assert_eq!(
            config.effective_ws_url().unwrap(),
            "wss://other.example.com/ws".to_string()
        );
    }

    #[test]
    fn test_camel_case_keys() {
        let json = r#"{
            "apiBase": "https://cms.example.com",
            "cache": {"maxBytes": 209715200, "prefetchConcurrency": 2},
            "intervals": {"schedulePollMs": 60000}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.cache.max_bytes, 209_715_200);
        assert_eq!(config.cache.prefetch_concurrency, 2);
        assert_eq!(config.intervals.schedule_poll_ms, 60_000);
        // Unspecified sections keep defaults
        assert_eq!(config.intervals.command_poll_ms, 30_000);
        config.validate().unwrap();
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = valid_config();
        config.device_id = Some("dev-42".to_string());
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.device_id.as_deref(), Some("dev-42"));
        assert_eq!(loaded.api_base, config.api_base);
    }
}
