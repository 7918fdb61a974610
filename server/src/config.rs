//! Server configuration.
//!
//! Loaded from a TOML file; every section and field has a default so a
//! minimal config (or none at all) runs a working server.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Server configuration loaded from a TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Worker thread configuration
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Listening socket configuration
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

/// Worker thread configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    /// Number of worker reactor threads. Zero runs the echo handler on the
    /// listener's own reactor.
    #[serde(default = "default_threads")]
    pub threads: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
        }
    }
}

/// Listening socket configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// Explicit listen address. When unset, the server binds the
    /// dual-stack wildcard on `port`.
    #[serde(default)]
    pub address: Option<SocketAddr>,

    /// Port for the dual-stack wildcard bind; ignored when `address` is
    /// set. Zero lets the kernel pick.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,

    /// Accepts per readable event on the listener reactor
    #[serde(default = "default_max_accept_at_once")]
    pub max_accept_at_once: u32,

    /// Bound on each worker's pending-connection queue
    #[serde(default = "default_max_messages_in_queue")]
    pub max_messages_in_queue: u32,

    /// Deadline for queued connections, in milliseconds; zero disables
    #[serde(default)]
    pub queue_timeout_ms: u64,

    /// Accept-rate recovery factor per millisecond; zero disables rate
    /// limiting adjustments
    #[serde(default)]
    pub accept_rate_adjust_speed: f64,

    /// Set SO_REUSEPORT before binding
    #[serde(default)]
    pub reuse_port: bool,

    /// Enable TCP fast open with this pending-SYN queue length
    #[serde(default)]
    pub tcp_fast_open_queue: Option<u32>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: None,
            port: default_port(),
            backlog: default_backlog(),
            max_accept_at_once: default_max_accept_at_once(),
            max_messages_in_queue: default_max_messages_in_queue(),
            queue_timeout_ms: 0,
            accept_rate_adjust_speed: 0.0,
            reuse_port: false,
            tcp_fast_open_queue: None,
        }
    }
}

impl ListenerConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "pretty", "compact", or "json"
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps in log output
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include the event's module target
    #[serde(default)]
    pub target: bool,

    /// Include thread names
    #[serde(default = "default_true")]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: false,
            thread_names: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

fn default_threads() -> usize {
    2
}

fn default_port() -> u16 {
    7878
}

fn default_backlog() -> i32 {
    1024
}

fn default_max_accept_at_once() -> u32 {
    listener::DEFAULT_MAX_ACCEPT_AT_ONCE
}

fn default_max_messages_in_queue() -> u32 {
    listener::DEFAULT_MAX_MESSAGES_IN_QUEUE
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.workers.threads, 2);
        assert_eq!(config.listener.port, 7878);
        assert_eq!(
            config.listener.max_accept_at_once,
            listener::DEFAULT_MAX_ACCEPT_AT_ONCE
        );
        assert!(config.listener.address.is_none());
    }

    #[test]
    fn full_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [workers]
            threads = 4

            [listener]
            address = "127.0.0.1:9000"
            backlog = 128
            max_accept_at_once = 8
            max_messages_in_queue = 16
            queue_timeout_ms = 250
            accept_rate_adjust_speed = 0.01
            reuse_port = true
            tcp_fast_open_queue = 64

            [logging]
            level = "debug"
            format = "json"
            timestamps = false
            "#,
        )
        .unwrap();
        assert_eq!(config.workers.threads, 4);
        assert_eq!(
            config.listener.address,
            Some("127.0.0.1:9000".parse().unwrap())
        );
        assert_eq!(config.listener.queue_timeout(), Duration::from_millis(250));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(!config.logging.timestamps);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<Config>("[listener]\nbogus = 1\n").is_err());
    }
}
