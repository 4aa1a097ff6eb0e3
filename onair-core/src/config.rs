use crate::error::{CoreError, Result};
use const_format::concatcp;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Default channel the station publishes track changes on
pub const DEFAULT_CHANNEL: &str = "stream-updates";
/// Default notification event name
pub const DEFAULT_EVENT: &str = "track-changed";
/// Default window for a push subscription to confirm (5 seconds)
pub const DEFAULT_CONFIRMATION_TIMEOUT_MS: u64 = 5_000;
/// Default fallback polling interval (10 seconds)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnAirConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    pub player: PlayerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the status API; endpoint paths are joined onto it
    pub base_url: String,
    /// Public API key sent with every request
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

const fn default_request_timeout() -> u64 {
    10
}

const fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Websocket endpoint of the realtime service. Empty disables push
    /// delivery, leaving every resolver on polling.
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default = "default_event")]
    pub event: String,
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_ms: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// How long the socket waits for a join reply before rejoining. Kept
    /// longer than the confirmation window so late confirmations still land.
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,
    /// First delay before reconnecting a lost channel, doubled per failure
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_ms: u64,
}

fn default_channel() -> String {
    DEFAULT_CHANNEL.to_string()
}

fn default_event() -> String {
    DEFAULT_EVENT.to_string()
}

const fn default_confirmation_timeout() -> u64 {
    DEFAULT_CONFIRMATION_TIMEOUT_MS
}

const fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

const fn default_heartbeat_interval() -> u64 {
    30_000
}

const fn default_join_timeout() -> u64 {
    10_000
}

const fn default_reconnect_delay() -> u64 {
    1_000
}

const fn default_reconnect_max_delay() -> u64 {
    30_000
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            channel: default_channel(),
            event: default_event(),
            confirmation_timeout_ms: default_confirmation_timeout(),
            poll_interval_ms: default_poll_interval(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            join_timeout_ms: default_join_timeout(),
            reconnect_delay_ms: default_reconnect_delay(),
            reconnect_max_delay_ms: default_reconnect_max_delay(),
        }
    }
}

impl RealtimeConfig {
    /// Whether push delivery is configured
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.url.trim().is_empty()
    }

    #[must_use]
    pub const fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub const fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Initial and maximum reconnect delay
    #[must_use]
    pub fn reconnect_backoff(&self) -> (Duration, Duration) {
        let initial = Duration::from_millis(self.reconnect_delay_ms.max(1));
        let max = Duration::from_millis(self.reconnect_max_delay_ms).max(initial);
        (initial, max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Live stream URL
    pub stream_url: String,
    #[serde(default = "default_metadata_refresh")]
    pub metadata_refresh_interval_ms: u64,
    #[serde(default = "default_progress_tick")]
    pub progress_tick_ms: u64,
    #[serde(default = "default_visualizer_fps")]
    pub visualizer_fps: u32,
    #[serde(default = "default_frequency_bins")]
    pub frequency_bins: usize,
    /// How long the stream may go silent before it counts as stalled
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_ms: u64,
    /// Start playing as soon as the app launches
    #[serde(default)]
    pub autoplay: bool,
}

const fn default_metadata_refresh() -> u64 {
    10_000
}

const fn default_progress_tick() -> u64 {
    1_000
}

const fn default_visualizer_fps() -> u32 {
    60
}

const fn default_frequency_bins() -> usize {
    64
}

const fn default_stall_timeout() -> u64 {
    8_000
}

impl PlayerConfig {
    /// Config for a stream URL with every other field at its default
    pub fn with_stream_url(stream_url: impl Into<String>) -> Self {
        Self {
            stream_url: stream_url.into(),
            metadata_refresh_interval_ms: default_metadata_refresh(),
            progress_tick_ms: default_progress_tick(),
            visualizer_fps: default_visualizer_fps(),
            frequency_bins: default_frequency_bins(),
            stall_timeout_ms: default_stall_timeout(),
            autoplay: false,
        }
    }

    /// Parse the stream URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is malformed.
    pub fn stream_url(&self) -> Result<Url> {
        parse_url("player.stream_url", &self.stream_url)
    }

    #[must_use]
    pub const fn metadata_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.metadata_refresh_interval_ms)
    }

    #[must_use]
    pub const fn progress_tick(&self) -> Duration {
        Duration::from_millis(self.progress_tick_ms)
    }

    #[must_use]
    pub const fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    /// Interval between visualizer samples
    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.visualizer_fps.max(1)))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Also write logs to a file in the cache directory
    #[serde(default)]
    pub enabled: bool,
}

/// Parse a URL-valued config field.
///
/// # Errors
///
/// Returns [`CoreError::ConfigMissingField`] for empty values and
/// [`CoreError::ConfigInvalidUrl`] for malformed ones.
pub fn parse_url(field: &str, value: &str) -> Result<Url> {
    if value.trim().is_empty() {
        return Err(CoreError::ConfigMissingField {
            field: field.to_string(),
        });
    }
    Url::parse(value.trim()).map_err(|e| CoreError::ConfigInvalidUrl {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

impl OnAirConfig {
    /// Get the configuration directory path (~/.config/onair/)
    #[must_use]
    pub fn config_dir() -> PathBuf {
        crate::paths::config_dir()
    }

    /// Get the config file path (~/.config/onair/config.toml)
    #[must_use]
    pub fn config_path() -> PathBuf {
        crate::paths::config_path()
    }

    /// Load config from file or create template on first run
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed, or
    /// [`CoreError::ConfigNotFound`] after writing a fresh template.
    pub fn load_or_create() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                fs::create_dir_all(parent)?;
            }

            fs::write(&config_path, CONFIG_TEMPLATE)?;

            return Err(CoreError::ConfigNotFound { path: config_path });
        }

        let content = fs::read_to_string(&config_path)?;
        Self::parse(&content)
    }

    /// Parse config from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Collect every required field that is missing or malformed
    #[must_use]
    pub fn missing_fields(&self) -> Vec<String> {
        let mut missing = Vec::new();

        if parse_url("backend.base_url", &self.backend.base_url).is_err() {
            missing.push("backend.base_url".to_string());
        }
        if self.player.stream_url().is_err() {
            missing.push("player.stream_url".to_string());
        }
        if self.realtime.is_enabled() && parse_url("realtime.url", &self.realtime.url).is_err() {
            missing.push("realtime.url".to_string());
        }

        missing
    }

    /// Validate required fields and value ranges.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<()> {
        parse_url("backend.base_url", &self.backend.base_url)?;
        self.player.stream_url()?;
        if self.realtime.is_enabled() {
            parse_url("realtime.url", &self.realtime.url)?;
        }
        if self.realtime.poll_interval_ms == 0 {
            return Err(CoreError::ConfigInvalid {
                message: "realtime.poll_interval_ms must be greater than 0".into(),
            });
        }
        if self.player.progress_tick_ms == 0 || self.player.metadata_refresh_interval_ms == 0 {
            return Err(CoreError::ConfigInvalid {
                message: "player intervals must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

/// Template written on first run.
pub const CONFIG_TEMPLATE: &str = concatcp!(
    r#"# On Air Configuration
# ~/.config/onair/config.toml

[backend]
# Required: base URL of the station status API
# (serves current-stream-state and now-playing)
base_url = ""
api_key = ""
request_timeout_secs = 10
max_retries = 3

[realtime]
# Websocket endpoint of the realtime service. Leave empty to rely on polling.
url = ""
channel = ""#,
    DEFAULT_CHANNEL,
    r#""
event = ""#,
    DEFAULT_EVENT,
    r#""
# Fall back to polling if the channel has not confirmed within this window
confirmation_timeout_ms = "#,
    DEFAULT_CONFIRMATION_TIMEOUT_MS,
    r"
poll_interval_ms = ",
    DEFAULT_POLL_INTERVAL_MS,
    r#"
heartbeat_interval_ms = 30000
# Lost channels rejoin on their own; waits double up to the max
join_timeout_ms = 10000
reconnect_delay_ms = 1000
reconnect_max_delay_ms = 30000

[player]
# Required: live stream URL
stream_url = ""
metadata_refresh_interval_ms = 10000
progress_tick_ms = 1000
visualizer_fps = 60
frequency_bins = 64
stall_timeout_ms = 8000
autoplay = false

[logging]
# Also write logs to ~/.cache/onair/onair.log
enabled = false
"#
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parses_with_defaults() {
        let config = OnAirConfig::parse(CONFIG_TEMPLATE).expect("template should parse");
        assert_eq!(config.realtime.channel, DEFAULT_CHANNEL);
        assert_eq!(config.realtime.event, DEFAULT_EVENT);
        assert_eq!(config.realtime.confirmation_timeout(), Duration::from_secs(5));
        assert_eq!(config.realtime.poll_interval(), Duration::from_secs(10));
        assert!(config.realtime.join_timeout() > config.realtime.confirmation_timeout());
        assert_eq!(
            config.realtime.reconnect_backoff(),
            (Duration::from_secs(1), Duration::from_secs(30))
        );
        assert!(!config.realtime.is_enabled());
        assert!(!config.player.autoplay);
    }

    #[test]
    fn test_template_reports_missing_fields() {
        let config = OnAirConfig::parse(CONFIG_TEMPLATE).expect("template should parse");
        assert_eq!(
            config.missing_fields(),
            vec!["backend.base_url".to_string(), "player.stream_url".to_string()]
        );
        assert!(matches!(
            config.validate(),
            Err(CoreError::ConfigMissingField { .. })
        ));
    }

    #[test]
    fn test_minimal_config_is_valid() {
        let config = OnAirConfig::parse(
            r#"
            [backend]
            base_url = "https://api.example.com/functions/v1/"

            [player]
            stream_url = "https://stream.example.com/live"
            "#,
        )
        .expect("minimal config should parse");

        assert!(config.validate().is_ok());
        assert!(config.missing_fields().is_empty());
        assert_eq!(config.player.frame_interval(), Duration::from_micros(16_666));
        assert_eq!(config.backend.max_retries, 3);
    }

    #[test]
    fn test_invalid_realtime_url() {
        let config = OnAirConfig::parse(
            r#"
            [backend]
            base_url = "https://api.example.com/"

            [realtime]
            url = "not a url"

            [player]
            stream_url = "https://stream.example.com/live"
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.missing_fields(), vec!["realtime.url".to_string()]);
        assert!(matches!(
            config.validate(),
            Err(CoreError::ConfigInvalidUrl { .. })
        ));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let config = OnAirConfig::parse(
            r#"
            [backend]
            base_url = "https://api.example.com/"

            [realtime]
            poll_interval_ms = 0

            [player]
            stream_url = "https://stream.example.com/live"
            "#,
        )
        .expect("config should parse");

        assert!(matches!(config.validate(), Err(CoreError::ConfigInvalid { .. })));
    }

    #[test]
    fn test_syntax_error() {
        assert!(matches!(
            OnAirConfig::parse("[backend"),
            Err(CoreError::ConfigParseError(_))
        ));
    }
}
