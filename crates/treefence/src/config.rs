// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fence agent configuration.
//!
//! [`FenceConfig`] controls tree shape, the generation deadline, the
//! indirect-path retry schedule and the optional direct-connection listener.
//!
//! Sources, lowest to highest precedence:
//! 1. [`FenceConfig::default`]
//! 2. a JSON file ([`FenceConfig::from_file`])
//! 3. `TREEFENCE_*` environment variables ([`FenceConfig::apply_env`])
//!
//! # Example
//!
//! ```
//! use treefence::config::FenceConfig;
//! use std::time::Duration;
//!
//! let config = FenceConfig::default()
//!     .with_tree_width(4)
//!     .with_timeout(Duration::from_secs(30))
//!     .with_direct_conn(false);
//! assert!(config.validate().is_ok());
//! ```

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest accepted `max_message_size` (1 GB).
const MAX_MESSAGE_SIZE_LIMIT: usize = 1024 * 1024 * 1024;

/// Fence agent configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FenceConfig {
    // === Tree ===
    /// Fan-out of the reduction tree (children per node)
    #[serde(default = "default_tree_width")]
    pub tree_width: u32,

    // === Timeouts ===
    /// Deadline for one generation, measured from its first contribution
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Interval between timeout reaper sweeps
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,

    // === Direct connections ===
    /// Establish direct sockets between tree-adjacent nodes
    #[serde(default = "default_true")]
    pub direct_conn: bool,

    /// Address to bind the direct listener (None = all interfaces)
    #[serde(default)]
    pub listen_address: Option<IpAddr>,

    /// Direct listener port (0 = ephemeral port assigned by OS)
    #[serde(default)]
    pub listen_port: u16,

    /// Listen backlog of the direct listener
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,

    /// Enable TCP_NODELAY on direct sockets
    #[serde(default = "default_true")]
    pub nodelay: bool,

    // === Indirect path ===
    /// Timeout handed to the control-plane primitive for one attempt
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Attempts before an indirect send is reported as failed
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,

    /// Delay before the first retry; doubles after every failed attempt
    #[serde(default = "default_send_start_delay_ms")]
    pub send_start_delay_ms: u64,

    // === Framing ===
    /// Maximum accepted message payload (anti-OOM protection)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_tree_width() -> u32 {
    16
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_reaper_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_listen_backlog() -> i32 {
    128
}

fn default_send_timeout_ms() -> u64 {
    5000
}

fn default_send_retries() -> u32 {
    5
}

fn default_send_start_delay_ms() -> u64 {
    100
}

fn default_max_message_size() -> usize {
    16 * 1024 * 1024 // 16 MB
}

impl Default for FenceConfig {
    fn default() -> Self {
        Self {
            tree_width: default_tree_width(),
            timeout_secs: default_timeout_secs(),
            reaper_interval_ms: default_reaper_interval_ms(),
            direct_conn: true,
            listen_address: None,
            listen_port: 0,
            listen_backlog: default_listen_backlog(),
            nodelay: true,
            send_timeout_ms: default_send_timeout_ms(),
            send_retries: default_send_retries(),
            send_start_delay_ms: default_send_start_delay_ms(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl FenceConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigFile(format!("{}: {}", path.display(), e)))?;

        serde_json::from_str(&content)
            .map_err(|e| Error::ConfigFile(format!("{}: {}", path.display(), e)))
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| Error::ConfigFile(e.to_string()))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigFile(format!("{}: {}", path.display(), e)))
    }

    /// Default configuration with `TREEFENCE_*` overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Override fields from `TREEFENCE_*` environment variables.
    ///
    /// Unparsable values are ignored with a warning.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse("TREEFENCE_TREE_WIDTH") {
            self.tree_width = v;
        }
        if let Some(v) = env_parse("TREEFENCE_TIMEOUT") {
            self.timeout_secs = v;
        }
        if let Some(v) = env_parse("TREEFENCE_REAPER_INTERVAL_MS") {
            self.reaper_interval_ms = v;
        }
        if let Ok(raw) = std::env::var("TREEFENCE_DIRECT_CONN") {
            match parse_bool(&raw) {
                Some(v) => self.direct_conn = v,
                None => log::warn!("[config] ignoring TREEFENCE_DIRECT_CONN={:?}", raw),
            }
        }
        if let Some(v) = env_parse("TREEFENCE_LISTEN_ADDR") {
            self.listen_address = Some(v);
        }
        if let Some(v) = env_parse("TREEFENCE_LISTEN_PORT") {
            self.listen_port = v;
        }
        if let Some(v) = env_parse("TREEFENCE_SEND_TIMEOUT_MS") {
            self.send_timeout_ms = v;
        }
        if let Some(v) = env_parse("TREEFENCE_SEND_RETRIES") {
            self.send_retries = v;
        }
        if let Some(v) = env_parse("TREEFENCE_SEND_DELAY_MS") {
            self.send_start_delay_ms = v;
        }
    }

    /// Builder: set tree width
    pub fn with_tree_width(mut self, width: u32) -> Self {
        self.tree_width = width;
        self
    }

    /// Builder: set generation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    /// Builder: set reaper sweep interval
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Builder: enable or disable direct connections
    pub fn with_direct_conn(mut self, enabled: bool) -> Self {
        self.direct_conn = enabled;
        self
    }

    /// Builder: set direct listener address and port
    pub fn with_listen(mut self, address: Option<IpAddr>, port: u16) -> Self {
        self.listen_address = address;
        self.listen_port = port;
        self
    }

    /// Builder: set indirect retry schedule
    pub fn with_retries(mut self, retries: u32, start_delay: Duration) -> Self {
        self.send_retries = retries;
        self.send_start_delay_ms = start_delay.as_millis() as u64;
        self
    }

    /// Generation deadline as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Reaper sweep interval as a `Duration`.
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    /// Per-attempt indirect send timeout as a `Duration`.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// First retry delay as a `Duration`.
    pub fn send_start_delay(&self) -> Duration {
        Duration::from_millis(self.send_start_delay_ms)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.tree_width == 0 {
            return Err(Error::Config("tree_width must be > 0".into()));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config("timeout_secs must be > 0".into()));
        }
        if self.reaper_interval_ms == 0 {
            return Err(Error::Config("reaper_interval_ms must be > 0".into()));
        }
        if self.send_retries == 0 {
            return Err(Error::Config("send_retries must be > 0".into()));
        }
        if self.max_message_size == 0 {
            return Err(Error::Config("max_message_size must be > 0".into()));
        }
        if self.max_message_size > MAX_MESSAGE_SIZE_LIMIT {
            return Err(Error::Config("max_message_size too large (> 1 GB)".into()));
        }
        if self.direct_conn && self.listen_backlog <= 0 {
            return Err(Error::Config("listen_backlog must be > 0".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("[config] ignoring {}={:?}", name, raw);
            None
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FenceConfig::default();
        assert_eq!(config.tree_width, 16);
        assert_eq!(config.timeout(), Duration::from_secs(300));
        assert!(config.direct_conn);
        assert_eq!(config.listen_port, 0);
        assert_eq!(config.send_retries, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let config = FenceConfig::default()
            .with_tree_width(2)
            .with_timeout(Duration::from_secs(5))
            .with_retries(3, Duration::from_millis(10))
            .with_direct_conn(false);
        assert_eq!(config.tree_width, 2);
        assert_eq!(config.timeout_secs, 5);
        assert_eq!(config.send_start_delay(), Duration::from_millis(10));
        assert!(!config.direct_conn);
    }

    #[test]
    fn test_validation_rejects_zero_width() {
        let config = FenceConfig::default().with_tree_width(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validation_rejects_zero_retries() {
        let mut config = FenceConfig::default();
        config.send_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fence.json");
        let config = FenceConfig::default()
            .with_tree_width(3)
            .with_listen(Some("127.0.0.1".parse().expect("ip")), 7600);
        config.to_file(&path).expect("write config");

        let loaded = FenceConfig::from_file(&path).expect("read config");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{ "tree_width": 8, "direct_conn": false }"#).expect("write");

        let loaded = FenceConfig::from_file(&path).expect("read config");
        assert_eq!(loaded.tree_width, 8);
        assert!(!loaded.direct_conn);
        assert_eq!(loaded.timeout_secs, 300);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let result = FenceConfig::from_file(Path::new("/nonexistent/treefence.json"));
        assert!(matches!(result, Err(Error::ConfigFile(_))));
    }

    #[test]
    fn test_parse_bool_variants() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" 0 "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
