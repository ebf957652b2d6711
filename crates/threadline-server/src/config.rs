//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (THREADLINE_HOST, THREADLINE_PORT)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use threadline_core::snowflake::DEFAULT_MAX_CLOCK_REGRESSION_MS;
use threadline_core::{GeneratorConfig, NodeIdSource, DEFAULT_BUCKET_SIZE_MS, DEFAULT_PAGE_SIZE};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Message id generation.
    #[serde(default)]
    pub snowflake: SnowflakeConfig,

    /// History paging.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Message id generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnowflakeConfig {
    /// Custom epoch in Unix milliseconds.
    #[serde(default)]
    pub epoch_millis: i64,

    /// Explicit node id (0..=1023). Derived from a network interface when absent.
    #[serde(default)]
    pub node_id: Option<u16>,

    /// Pick a random node id instead of deriving one.
    #[serde(default)]
    pub random_node_id: bool,

    /// Largest backward clock step absorbed without failing.
    #[serde(default = "default_max_clock_regression")]
    pub max_clock_regression_ms: u64,
}

/// History paging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Width of a storage bucket in milliseconds.
    #[serde(default = "default_bucket_size")]
    pub bucket_size_ms: i64,

    /// Messages per history page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("THREADLINE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("THREADLINE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_clock_regression() -> u64 {
    DEFAULT_MAX_CLOCK_REGRESSION_MS
}

fn default_bucket_size() -> i64 {
    DEFAULT_BUCKET_SIZE_MS
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            websocket_path: default_ws_path(),
            snowflake: SnowflakeConfig::default(),
            history: HistoryConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for SnowflakeConfig {
    fn default() -> Self {
        Self {
            epoch_millis: 0,
            node_id: None,
            random_node_id: false,
            max_clock_regression_ms: default_max_clock_regression(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            bucket_size_ms: default_bucket_size(),
            page_size: default_page_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl SnowflakeConfig {
    /// Where the node id comes from. An explicit id wins over `random_node_id`.
    #[must_use]
    pub fn node_id_source(&self) -> NodeIdSource {
        match (self.node_id, self.random_node_id) {
            (Some(id), _) => NodeIdSource::Explicit(id),
            (None, true) => NodeIdSource::RandomAcceptingCollisionRisk,
            (None, false) => NodeIdSource::FromNetworkInterface,
        }
    }

    /// Generator settings.
    #[must_use]
    pub fn to_generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            epoch_millis: self.epoch_millis,
            node_id: self.node_id_source(),
            max_clock_regression_ms: self.max_clock_regression_ms,
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "threadline.toml",
            "/etc/threadline/threadline.toml",
            "~/.config/threadline/threadline.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}
