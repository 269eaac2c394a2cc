//! Tunables for the realtime core.
//!
//! Configuration is immutable after construction and shared by reference
//! (`Arc<RealtimeConfig>`). It can be loaded from a TOML file; every field
//! has a default, so an empty file is a valid configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest accepted typing keepalive or auto-stop, in seconds.
const MAX_TYPING_SECS: f64 = 3600.0;

/// Longest accepted send timeout, in seconds.
const MAX_SENDING_TIMEOUT_SECS: u64 = 86_400;

/// Root configuration for the realtime core.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Maximum conversation ids per backend subscription (default: 100).
    pub max_ids_per_channel: usize,
    /// Minimum spacing between update emissions per conversation (default: 300ms).
    pub throttle_per_conversation_ms: u64,
    /// Quiet period before a visibility change is committed (default: 500ms).
    pub scroll_debounce_ms: u64,
    /// Interval between typing keepalive broadcasts (default: 3s).
    pub typing_keepalive_secs: f64,
    /// Typing state expires this long after the last signal (default: 4s).
    pub typing_auto_stop_secs: f64,
    /// Stopped typing entries linger this long to absorb late stops (default: 1s).
    pub typing_state_grace_ms: u64,
    /// A message still `sending` after this long is stale (default: 30s).
    pub sending_timeout_secs: u64,
    /// Reconnection backoff.
    pub reconnect: ReconnectConfig,
}

/// Reconnection backoff configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry (default: 1s).
    pub base_delay_ms: u64,
    /// Upper bound on any retry delay, jitter included (default: 30s).
    pub max_delay_ms: u64,
    /// Random jitter added to each delay (default: up to 1s).
    pub max_jitter_ms: u64,
    /// Retries before giving up and reporting degraded connectivity (default: 8).
    pub max_attempts: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            max_ids_per_channel: 100,
            throttle_per_conversation_ms: 300,
            scroll_debounce_ms: 500,
            typing_keepalive_secs: 3.0,
            typing_auto_stop_secs: 4.0,
            typing_state_grace_ms: 1000,
            sending_timeout_secs: 30,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_jitter_ms: 1000,
            max_attempts: 8,
        }
    }
}

impl RealtimeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: Some(path.to_path_buf()),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ConfigError::ParseError { path: None, source: e })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the tunables are usable together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_ids_per_channel == 0 {
            return Err(ConfigError::Invalid(
                "max_ids_per_channel must be > 0".into(),
            ));
        }
        let in_range = |secs: f64| secs > 0.0 && secs <= MAX_TYPING_SECS;
        if !in_range(self.typing_keepalive_secs) || !in_range(self.typing_auto_stop_secs) {
            return Err(ConfigError::Invalid(format!(
                "typing timers must be positive and at most {MAX_TYPING_SECS}s"
            )));
        }
        if self.typing_keepalive_secs >= self.typing_auto_stop_secs {
            return Err(ConfigError::Invalid(format!(
                "typing_keepalive_secs ({}) must be shorter than typing_auto_stop_secs ({})",
                self.typing_keepalive_secs, self.typing_auto_stop_secs
            )));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.base_delay_ms must be > 0".into(),
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.max_delay_ms must be >= reconnect.base_delay_ms".into(),
            ));
        }
        if self.reconnect.max_jitter_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.max_jitter_ms must be <= reconnect.max_delay_ms".into(),
            ));
        }
        if self.sending_timeout_secs == 0 || self.sending_timeout_secs > MAX_SENDING_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "sending_timeout_secs must be between 1 and {MAX_SENDING_TIMEOUT_SECS}"
            )));
        }
        Ok(())
    }

    /// Per-conversation throttle window.
    pub fn throttle_window(&self) -> Duration {
        Duration::from_millis(self.throttle_per_conversation_ms)
    }

    /// Visibility debounce window.
    pub fn scroll_debounce(&self) -> Duration {
        Duration::from_millis(self.scroll_debounce_ms)
    }

    /// Keepalive broadcast interval while typing.
    pub fn typing_keepalive(&self) -> Duration {
        Duration::from_secs_f64(self.typing_keepalive_secs)
    }

    /// Auto-stop timeout after the last typing signal.
    pub fn typing_auto_stop(&self) -> Duration {
        Duration::from_secs_f64(self.typing_auto_stop_secs)
    }

    /// How long stopped typing entries are kept.
    pub fn typing_state_grace(&self) -> Duration {
        Duration::from_millis(self.typing_state_grace_ms)
    }

    /// Age after which a `sending` message is considered stuck.
    pub fn sending_timeout(&self) -> Duration {
        Duration::from_secs(self.sending_timeout_secs)
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (1-based).
    ///
    /// Formula: min(max_delay, base_delay * 2^(attempt-1) + random(0..=max_jitter))
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.base_delay_ms.saturating_mul(1u64 << exponent);
        let with_jitter = base.saturating_add(random_jitter_ms(self.max_jitter_ms));
        Duration::from_millis(with_jitter.min(self.max_delay_ms))
    }
}

/// Random jitter between 0 and `max` milliseconds inclusive.
///
/// Falls back to no jitter if the OS random source is unavailable.
fn random_jitter_ms(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    let mut bytes = [0u8; 8];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => u64::from_le_bytes(bytes) % max.saturating_add(1),
        Err(_) => 0,
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration.
    #[error("failed to parse config: {source}")]
    ParseError {
        /// Path to the configuration file, if loaded from disk.
        path: Option<PathBuf>,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// Values parse but cannot work together.
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = RealtimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_ids_per_channel, 100);
        assert_eq!(config.throttle_window(), Duration::from_millis(300));
        assert_eq!(config.scroll_debounce(), Duration::from_millis(500));
        assert_eq!(config.typing_keepalive(), Duration::from_secs(3));
        assert_eq!(config.typing_auto_stop(), Duration::from_secs(4));
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
max_ids_per_channel = 50
scroll_debounce_ms = 250
typing_keepalive_secs = 2.5

[reconnect]
max_attempts = 3
"#;

        let config = RealtimeConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.max_ids_per_channel, 50);
        assert_eq!(config.scroll_debounce_ms, 250);
        assert_eq!(config.typing_keepalive(), Duration::from_millis(2500));
        assert_eq!(config.reconnect.max_attempts, 3);
        // Untouched fields keep defaults
        assert_eq!(config.throttle_per_conversation_ms, 300);
        assert_eq!(config.reconnect.base_delay_ms, 1000);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config = RealtimeConfig::from_toml_str("").unwrap();
        assert_eq!(config, RealtimeConfig::default());
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let err = RealtimeConfig::from_toml_str("max_ids_per_channel = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn keepalive_must_be_shorter_than_auto_stop() {
        let err = RealtimeConfig::from_toml_str(
            "typing_keepalive_secs = 5.0\ntyping_auto_stop_secs = 4.0",
        )
        .unwrap_err();
        assert!(err.to_string().contains("typing_keepalive_secs"));
    }

    #[test]
    fn huge_typing_timers_rejected() {
        let err = RealtimeConfig::from_toml_str(
            "typing_keepalive_secs = 1e300\ntyping_auto_stop_secs = 1e301",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = RealtimeConfig::from_toml_str("typing_auto_stop_secs = nan").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn jitter_beyond_max_delay_rejected() {
        let config = RealtimeConfig {
            reconnect: ReconnectConfig {
                max_jitter_ms: u64::MAX,
                ..ReconnectConfig::default()
            },
            ..RealtimeConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unbounded_jitter_does_not_overflow() {
        let reconnect = ReconnectConfig {
            max_jitter_ms: u64::MAX,
            ..ReconnectConfig::default()
        };
        assert!(reconnect.backoff(1) <= Duration::from_secs(30));
    }

    #[test]
    fn sending_timeout_bounded() {
        for secs in [0, u64::MAX] {
            let config = RealtimeConfig {
                sending_timeout_secs: secs,
                ..RealtimeConfig::default()
            };
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn parse_error_reported() {
        let err = RealtimeConfig::from_toml_str("max_ids_per_channel = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { path: None, .. }));
    }

    #[test]
    fn missing_file_reported() {
        let err = RealtimeConfig::from_file(Path::new("/nonexistent/realtime.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn backoff_increases_with_attempt() {
        let reconnect = ReconnectConfig {
            max_jitter_ms: 0,
            ..ReconnectConfig::default()
        };
        assert_eq!(reconnect.backoff(1), Duration::from_secs(1));
        assert_eq!(reconnect.backoff(2), Duration::from_secs(2));
        assert_eq!(reconnect.backoff(4), Duration::from_secs(8));
    }

    #[test]
    fn backoff_capped_including_jitter() {
        let reconnect = ReconnectConfig::default();
        for attempt in [6, 10, 40, u32::MAX] {
            assert!(reconnect.backoff(attempt) <= Duration::from_secs(30));
        }
    }

    #[test]
    fn backoff_jitter_creates_variance() {
        let reconnect = ReconnectConfig {
            max_jitter_ms: 5000,
            ..ReconnectConfig::default()
        };
        let delays: Vec<Duration> = (0..20).map(|_| reconnect.backoff(1)).collect();
        let min = delays.iter().min().unwrap();
        let max = delays.iter().max().unwrap();

        // Probabilistic: 20 samples over 5001 jitter values
        assert!(
            max.as_millis() - min.as_millis() >= 100,
            "Expected jitter variance, got min={:?} max={:?}",
            min,
            max
        );
    }
}
