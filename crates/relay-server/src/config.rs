//! Server configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerConfig::default()`]
//! 2. If a JSON config file is given and exists, deep-merge it over defaults
//! 3. Apply `RELAY_*` environment variable overrides (highest priority)
//! 4. Validate capacities and intervals
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::ConfigError;

/// Configuration for the relay server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Per-endpoint stream settings.
    pub stream: StreamSettings,
    /// Largest request body accepted on stream and callback routes.
    pub max_body_bytes: usize,
    /// How long shutdown waits for connection tasks before giving up.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            stream: StreamSettings::default(),
            max_body_bytes: 1024 * 1024, // 1 MB
            shutdown_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Shutdown grace period as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Reject values that would make channels or timers unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.stream.validate()?;
        if self.max_body_bytes == 0 {
            return Err(ConfigError::InvalidValue("max_body_bytes must be positive".into()));
        }
        Ok(())
    }
}

/// Tuning for each registered stream endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Idle time after which a `ping` message is written.
    pub keepalive_interval_secs: u64,
    /// Capacity of each session's direct message queue.
    pub direct_queue_capacity: usize,
    /// Messages retained per fan-out consumer before it starts skipping.
    pub fanout_capacity: usize,
    /// Encoded frames buffered between the connection task and the body.
    pub frame_buffer: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: 60,
            direct_queue_capacity: 256,
            fanout_capacity: 2048,
            frame_buffer: 32,
        }
    }
}

impl StreamSettings {
    /// Keepalive interval as a [`Duration`].
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Reject zero capacities and a zero keepalive interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("stream.keepalive_interval_secs", self.keepalive_interval_secs == 0),
            ("stream.direct_queue_capacity", self.direct_queue_capacity == 0),
            ("stream.fanout_capacity", self.fanout_capacity == 0),
            ("stream.frame_buffer", self.frame_buffer == 0),
        ];
        match checks.iter().find(|(_, is_zero)| *is_zero) {
            Some((name, _)) => Err(ConfigError::InvalidValue(format!("{name} must be positive"))),
            None => Ok(()),
        }
    }
}

/// Load configuration with an optional JSON file and env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading config from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "config file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut config: ServerConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `RELAY_*` environment variable overrides.
pub fn apply_env_overrides(config: &mut ServerConfig) {
    apply_overrides(config, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable lookup.
///
/// Invalid values are logged and ignored (fall back to file/default).
pub fn apply_overrides(config: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("RELAY_HOST") {
        config.host = v;
    }
    if let Some(v) = read("RELAY_PORT") {
        match parse_u16_range(&v, 0, 65535) {
            Some(port) => config.port = port,
            None => warn!(key = "RELAY_PORT", value = %v, "invalid port env var, ignoring"),
        }
    }
    if let Some(v) = read("RELAY_KEEPALIVE_SECS") {
        match parse_u64_range(&v, 1, 3600) {
            Some(secs) => config.stream.keepalive_interval_secs = secs,
            None => warn!(key = "RELAY_KEEPALIVE_SECS", value = %v, "invalid u64 env var, ignoring"),
        }
    }
    if let Some(v) = read("RELAY_DIRECT_QUEUE") {
        match parse_usize_range(&v, 1, 1_000_000) {
            Some(n) => config.stream.direct_queue_capacity = n,
            None => warn!(key = "RELAY_DIRECT_QUEUE", value = %v, "invalid usize env var, ignoring"),
        }
    }
    if let Some(v) = read("RELAY_FANOUT_CAPACITY") {
        match parse_usize_range(&v, 1, 1_000_000) {
            Some(n) => config.stream.fanout_capacity = n,
            None => warn!(key = "RELAY_FANOUT_CAPACITY", value = %v, "invalid usize env var, ignoring"),
        }
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
