//! Configuration loading for the feed client.
//!
//! Configuration is loaded from a TOML file or built in code from
//! [`ClientConfig::new`]. Every tunable has a default, so a file only needs
//! the values it changes.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Path of the socket endpoint, relative to the base URL.
pub const CONNECT_PATH: &str = "/api/v2/connect";

/// Root configuration for the feed client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Account and endpoint configuration.
    #[serde(default)]
    pub client: EndpointConfig,
    /// Socket lifecycle configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Token loading configuration.
    #[serde(default)]
    pub token: TokenConfig,
    /// Batch hydration configuration.
    #[serde(default)]
    pub hydration: HydrationConfig,
    /// Echo deduplication configuration.
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
}

/// Account and endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Application API key.
    #[serde(default)]
    pub api_key: String,
    /// HTTP base URL; the socket URL is derived from it.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Client identifier sent with every connection.
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

/// Socket lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Interval between client health checks (default: 25s).
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Extra silence tolerated on top of the interval before reconnecting
    /// (default: 10s).
    #[serde(default = "default_liveness_slack_ms")]
    pub liveness_slack_ms: u64,
    /// Bound on the initial connect wait (default: 15s).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long disconnect waits for the server's close acknowledgment
    /// (default: 1s).
    #[serde(default = "default_close_ack_timeout_ms")]
    pub close_ack_timeout_ms: u64,
    /// Reconnect delay after the host comes back online (default: 10ms).
    #[serde(default = "default_online_reconnect_delay_ms")]
    pub online_reconnect_delay_ms: u64,
}

/// Token loading configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// Provider invocations before a load fails (default: 3).
    #[serde(default = "default_max_load_attempts")]
    pub max_load_attempts: u32,
    /// Sleep between provider invocations (default: 500ms).
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Batch hydration configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HydrationConfig {
    /// Coalescing window (default: 2s).
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

/// Echo deduplication configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    /// How long a dedup ticket waits for its echo (default: 30s).
    #[serde(default = "default_ticket_ttl_ms")]
    pub ticket_ttl_ms: u64,
}

// Default value functions
fn default_base_url() -> String {
    "https://feeds.stream-io-api.com".to_string()
}

fn default_client_id() -> String {
    format!("rtfeed-rust-{}", env!("CARGO_PKG_VERSION"))
}

fn default_health_check_interval_ms() -> u64 {
    25_000
}

fn default_liveness_slack_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    15_000
}

fn default_close_ack_timeout_ms() -> u64 {
    1_000
}

fn default_online_reconnect_delay_ms() -> u64 {
    10
}

fn default_max_load_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_window_ms() -> u64 {
    2_000
}

fn default_ticket_ttl_ms() -> u64 {
    30_000
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            client_id: default_client_id(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: default_health_check_interval_ms(),
            liveness_slack_ms: default_liveness_slack_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            close_ack_timeout_ms: default_close_ack_timeout_ms(),
            online_reconnect_delay_ms: default_online_reconnect_delay_ms(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            max_load_attempts: default_max_load_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for HydrationConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            ticket_ttl_ms: default_ticket_ttl_ms(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client: EndpointConfig::default(),
            connection: ConnectionConfig::default(),
            token: TokenConfig::default(),
            hydration: HydrationConfig::default(),
            reconciliation: ReconciliationConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Interval between client health checks.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Maximum silence before the connection is considered dead.
    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms + self.liveness_slack_ms)
    }

    /// Bound on the initial connect wait.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Bound on the close acknowledgment wait.
    pub fn close_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.close_ack_timeout_ms)
    }

    /// Delay before reconnecting after the host comes back online.
    pub fn online_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.online_reconnect_delay_ms)
    }
}

impl TokenConfig {
    /// Sleep between provider invocations.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl HydrationConfig {
    /// Coalescing window.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl ReconciliationConfig {
    /// Lifetime of a dedup ticket.
    pub fn ticket_ttl(&self) -> Duration {
        Duration::from_millis(self.ticket_ttl_ms)
    }
}

/// How the connecting user authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    /// Signed user token.
    Jwt,
    /// No token.
    Anonymous,
}

impl AuthType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Jwt => "jwt",
            Self::Anonymous => "anonymous",
        }
    }
}

impl ClientConfig {
    /// Configuration for an API key with every other value defaulted.
    pub fn new(api_key: &str) -> Self {
        let mut config = Self::default();
        config.client.api_key = api_key.to_string();
        config
    }

    /// Set the HTTP base URL.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.client.base_url = base_url.to_string();
        self
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            source: e,
        })
    }

    /// Socket URL derived from the base URL.
    ///
    /// The scheme is swapped to its socket counterpart and the common
    /// headers are flattened into the query string.
    pub fn ws_url(&self, auth: AuthType) -> Result<Url, ConfigError> {
        let mut url = Url::parse(&self.client.base_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {e}", self.client.base_url)))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(ConfigError::InvalidUrl(format!("unsupported scheme {other}"))),
        };
        url.set_scheme(scheme)
            .map_err(|_| ConfigError::InvalidUrl(format!("cannot use scheme {scheme}")))?;
        url.set_path(CONNECT_PATH);
        url.query_pairs_mut()
            .clear()
            .append_pair("api_key", &self.client.api_key)
            .append_pair("stream-auth-type", auth.as_str())
            .append_pair("X-Stream-Client", &self.client.client_id);
        Ok(url)
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
    /// Base URL cannot be turned into a socket URL.
    #[error("invalid base url: {0}")]
    InvalidUrl(String),
}
