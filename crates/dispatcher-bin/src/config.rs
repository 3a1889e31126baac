//! Configuration management for the dispatcher.

use crate::paths::Paths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";
/// Default relay base URL.
pub const DEFAULT_RELAY_URL: &str = "http://localhost:8071";

/// Main dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines instead of human-readable text.
    #[serde(default)]
    pub log_json: bool,
    /// Relay base URL.
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Bearer token for the relay API.
    #[serde(default)]
    pub relay_auth_token: String,
    /// Relay request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Aggregate key to destination application id. Events whose aggregate
    /// has no entry are settled as skipped instead of delivered.
    #[serde(default)]
    pub route_map: HashMap<String, String>,
    /// Maximum events claimed per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Sleep between cycles when the outbox is drained, in seconds.
    #[serde(default = "default_idle_interval_secs")]
    pub idle_interval_secs: u64,
    /// Age after which another dispatcher's claim is considered abandoned,
    /// in seconds.
    #[serde(default = "default_stale_claim_timeout_secs")]
    pub stale_claim_timeout_secs: u64,
    /// First retry delay, in seconds.
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,
    /// Retry delay cap, in seconds.
    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,
    /// Total delivery attempts before an event fails terminally.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Randomize retry delays to spread load.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    /// Let later events of an aggregate proceed past a terminally failed one.
    #[serde(default = "default_unblock_on_failure")]
    pub unblock_on_failure: bool,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_relay_url() -> String {
    DEFAULT_RELAY_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_batch_size() -> usize {
    100
}

fn default_idle_interval_secs() -> u64 {
    120
}

fn default_stale_claim_timeout_secs() -> u64 {
    300
}

fn default_retry_base_delay_secs() -> u64 {
    2
}

fn default_retry_max_delay_secs() -> u64 {
    900
}

fn default_max_attempts() -> u32 {
    20
}

fn default_jitter() -> bool {
    true
}

fn default_unblock_on_failure() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            relay_url: default_relay_url(),
            relay_auth_token: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
            route_map: HashMap::new(),
            batch_size: default_batch_size(),
            idle_interval_secs: default_idle_interval_secs(),
            stale_claim_timeout_secs: default_stale_claim_timeout_secs(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
            max_attempts: default_max_attempts(),
            jitter: default_jitter(),
            unblock_on_failure: default_unblock_on_failure(),
        }
    }
}

impl Config {
    /// Load configuration from a file, falling back to defaults.
    /// Environment variables override the file.
    pub fn load(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> Result<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) -> Result<()> {
        if let Ok(log_level) = std::env::var("DISPATCHER_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Ok(relay_url) = std::env::var("DISPATCHER_RELAY_URL") {
            self.relay_url = relay_url;
        }
        if let Ok(token) = std::env::var("DISPATCHER_RELAY_TOKEN") {
            self.relay_auth_token = token;
        }
        if let Ok(mapping) = std::env::var("DISPATCHER_ROUTE_MAP") {
            self.route_map = serde_json::from_str(&mapping)
                .context("Invalid DISPATCHER_ROUTE_MAP: expected a JSON object of aggregate key to application id")?;
        }
        Ok(())
    }
}
