//! Configuration loading for unlock-relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`).
//! Every section may be omitted; missing values fall back to defaults.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for unlock-relay.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP endpoints configuration.
    #[serde(default)]
    pub http: HttpConfig,
    /// Presence tracking and reaper configuration.
    #[serde(default)]
    pub presence: PresenceConfig,
    /// Push stream configuration.
    #[serde(default)]
    pub stream: StreamConfig,
    /// Request limits and rate limiting.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Static authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Bind address for HTTP server (default: 0.0.0.0:8080).
    #[serde(default = "default_http_bind")]
    pub bind_address: String,
    /// Enable metrics endpoint (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

/// Presence tracking configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    /// Silence after which a device is evicted (default: 10).
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_secs: u64,
    /// Reaper sweep interval in seconds (default: 5).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// How often an open approver stream refreshes its record (default: 4).
    /// Must be shorter than `stale_timeout_secs`.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Enable the reaper task (default: true).
    #[serde(default = "default_reaper_enabled")]
    pub reaper_enabled: bool,
}

/// Push stream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Per-subscriber buffer in envelopes (default: 64).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// SSE keep-alive comment period in seconds (default: 15).
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
}

/// Request limits and rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum request body size in bytes (default: 64KB).
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Device names longer than this are truncated (default: 128 chars).
    #[serde(default = "default_max_device_name_len")]
    pub max_device_name_len: usize,
    /// Device ids longer than this are rejected (default: 256 bytes).
    #[serde(default = "default_max_device_id_len")]
    pub max_device_id_len: usize,
    /// Relay sends allowed per user per minute (default: 120).
    #[serde(default = "default_sends_per_minute")]
    pub sends_per_minute: u32,
    /// Stream opens and heartbeats allowed per user per minute (default: 60).
    #[serde(default = "default_opens_per_minute")]
    pub opens_per_minute: u32,
    /// Aggregate request rate across all users (default: 1000/s).
    #[serde(default = "default_global_rps")]
    pub global_requests_per_second: u32,
}

/// Static bearer-token authentication.
///
/// Deployments embedding the relay in a larger application supply their own
/// [`Authenticator`](crate::auth::Authenticator) instead.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Bearer token -> user id.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

// Default value functions
fn default_http_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_stale_timeout() -> u64 {
    10
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_heartbeat_interval() -> u64 {
    4
}

fn default_reaper_enabled() -> bool {
    true
}

fn default_buffer_size() -> usize {
    64
}

fn default_keepalive() -> u64 {
    15
}

fn default_max_message_bytes() -> usize {
    64 * 1024 // 64KB
}

fn default_max_device_name_len() -> usize {
    128
}

fn default_max_device_id_len() -> usize {
    256
}

fn default_sends_per_minute() -> u32 {
    120
}

fn default_opens_per_minute() -> u32 {
    60
}

fn default_global_rps() -> u32 {
    1000
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_http_bind(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            stale_timeout_secs: default_stale_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            reaper_enabled: default_reaper_enabled(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            keepalive_secs: default_keepalive(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
            max_device_name_len: default_max_device_name_len(),
            max_device_id_len: default_max_device_id_len(),
            sends_per_minute: default_sends_per_minute(),
            opens_per_minute: default_opens_per_minute(),
            global_requests_per_second: default_global_rps(),
        }
    }
}

impl PresenceConfig {
    /// Staleness window as a `Duration`.
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    /// Reaper period as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Approver refresh period as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.presence;
        if p.stale_timeout_secs == 0 || p.sweep_interval_secs == 0 || p.heartbeat_interval_secs == 0
        {
            return Err(ConfigError::Invalid {
                reason: "presence intervals must be > 0".to_string(),
            });
        }
        if p.heartbeat_interval_secs >= p.stale_timeout_secs {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "heartbeat_interval_secs ({}) must be shorter than stale_timeout_secs ({})",
                    p.heartbeat_interval_secs, p.stale_timeout_secs
                ),
            });
        }
        if self.stream.buffer_size == 0 {
            return Err(ConfigError::Invalid {
                reason: "stream.buffer_size must be > 0".to_string(),
            });
        }
        let l = &self.limits;
        if l.sends_per_minute == 0 || l.opens_per_minute == 0 || l.global_requests_per_second == 0
        {
            return Err(ConfigError::Invalid {
                reason: "rate limit quotas must be > 0".to_string(),
            });
        }
        Ok(())
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
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// Configuration parsed but is inconsistent.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// What is wrong.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.http.bind_address, "0.0.0.0:8080");
        assert_eq!(config.presence.stale_timeout_secs, 10);
        assert_eq!(config.stream.buffer_size, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[http]
bind_address = "127.0.0.1:9090"

[presence]
stale_timeout_secs = 30
sweep_interval_secs = 10
heartbeat_interval_secs = 12

[limits]
sends_per_minute = 10

[auth.tokens]
"dev-token" = "user-1"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.http.bind_address, "127.0.0.1:9090");
        assert_eq!(config.presence.stale_timeout(), Duration::from_secs(30));
        assert_eq!(config.presence.heartbeat_interval_secs, 12);
        assert_eq!(config.limits.sends_per_minute, 10);
        assert_eq!(config.auth.tokens.get("dev-token").unwrap(), "user-1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.presence.sweep_interval_secs, 5);
        assert_eq!(config.limits.max_message_bytes, 64 * 1024);
        assert!(config.http.metrics_enabled);
        assert!(config.auth.tokens.is_empty());
    }

    #[test]
    fn heartbeat_must_be_shorter_than_timeout() {
        let toml = r#"
[presence]
stale_timeout_secs = 10
heartbeat_interval_secs = 10
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn zero_quota_rejected() {
        let mut config = Config::default();
        config.limits.opens_per_minute = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[stream]\nkeepalive_secs = 30").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.stream.keepalive_secs, 30);
    }

    #[test]
    fn from_file_missing_path_is_read_error() {
        let err = Config::from_file(std::path::Path::new("/nonexistent/relay.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }
}
