use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};
use url::Url;

use crate::error::{config_invalid, config_missing, storage_failed, CoreResult};

// Default configuration values
const DEFAULT_API_URL: &str = "http://127.0.0.1:8000/api";
const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8000/ws";
const DEFAULT_SESSION_FILE: &str = "crawldash.session.json";
const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 30;
const DEFAULT_HEARTBEAT_MISS_LIMIT: u32 = 2;
const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const DEFAULT_RENEWAL_THRESHOLD_SECONDS: u64 = 300;
const DEFAULT_RENEWAL_POLL_SECONDS: u64 = 60;
const DEFAULT_EVENT_BUS_CAPACITY: usize = 1000;
const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

/// Environment variable overriding the REST API base URL
pub const API_URL_ENV: &str = "CRAWLDASH_API_URL";
/// Environment variable overriding the push channel URL
pub const WS_URL_ENV: &str = "CRAWLDASH_WS_URL";
/// Environment variable overriding the persisted session file
pub const SESSION_FILE_ENV: &str = "CRAWLDASH_SESSION_FILE";

/// Top-level configuration of the connection core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// REST API settings
    #[serde(default)]
    pub api: ApiConfig,
    /// Push channel settings
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Credential renewal policy
    #[serde(default)]
    pub renewal: RenewalConfig,
    /// Local persistence
    #[serde(default)]
    pub storage: StorageConfig,
    /// Capacity of the broadcast channel behind the event bus
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
    /// Number of recent events kept for late subscribers
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
}

/// REST API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL every request path is appended to
    #[serde(default = "default_api_url")]
    pub base_url: String,
    /// Per-request timeout
    #[serde(default = "default_request_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_register_path")]
    pub register_path: String,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    #[serde(default = "default_profile_path")]
    pub profile_path: String,
}

/// Push channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel endpoint; the access secret is appended as the `token` query parameter
    #[serde(default = "default_ws_url")]
    pub url: String,
    /// Reconnect delay for the first attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for the reconnect delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Consecutive failed reconnects before the manager gives up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Heartbeat probe interval while connected
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// Intervals without inbound traffic before the channel is declared dead.
    /// `None` relies on the transport's own close/error signaling only.
    #[serde(default = "default_heartbeat_miss_limit")]
    pub heartbeat_miss_limit: Option<u32>,
    /// Handshake timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

/// Credential renewal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewalConfig {
    /// Remaining lifetime below which a proactive renewal is started
    #[serde(default = "default_renewal_threshold")]
    pub threshold_seconds: u64,
    /// Cadence of the proactive renewal check
    #[serde(default = "default_renewal_poll")]
    pub poll_interval_seconds: u64,
}

/// Local persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON file holding the persisted credential and identity
    #[serde(default = "default_session_file")]
    pub path: PathBuf,
}

// Default functions
fn default_api_url() -> String {
    std::env::var(API_URL_ENV).unwrap_or_else(|_| DEFAULT_API_URL.to_string())
}

fn default_ws_url() -> String {
    std::env::var(WS_URL_ENV).unwrap_or_else(|_| DEFAULT_WS_URL.to_string())
}

fn default_session_file() -> PathBuf {
    std::env::var(SESSION_FILE_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_SESSION_FILE))
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECONDS
}

fn default_login_path() -> String {
    "/auth/login".to_string()
}

fn default_register_path() -> String {
    "/auth/register".to_string()
}

fn default_refresh_path() -> String {
    "/auth/refresh".to_string()
}

fn default_profile_path() -> String {
    "/auth/me".to_string()
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

fn default_max_reconnect_attempts() -> u32 {
    DEFAULT_MAX_RECONNECT_ATTEMPTS
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECONDS
}

fn default_heartbeat_miss_limit() -> Option<u32> {
    Some(DEFAULT_HEARTBEAT_MISS_LIMIT)
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECONDS
}

fn default_renewal_threshold() -> u64 {
    DEFAULT_RENEWAL_THRESHOLD_SECONDS
}

fn default_renewal_poll() -> u64 {
    DEFAULT_RENEWAL_POLL_SECONDS
}

fn default_event_bus_capacity() -> usize {
    DEFAULT_EVENT_BUS_CAPACITY
}

fn default_event_buffer_size() -> usize {
    DEFAULT_EVENT_BUFFER_SIZE
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            channel: ChannelConfig::default(),
            renewal: RenewalConfig::default(),
            storage: StorageConfig::default(),
            event_bus_capacity: default_event_bus_capacity(),
            event_buffer_size: default_event_buffer_size(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_url(),
            timeout_seconds: default_request_timeout(),
            login_path: default_login_path(),
            register_path: default_register_path(),
            refresh_path: default_refresh_path(),
            profile_path: default_profile_path(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: default_ws_url(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            heartbeat_miss_limit: default_heartbeat_miss_limit(),
            connect_timeout_seconds: default_connect_timeout(),
        }
    }
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            threshold_seconds: default_renewal_threshold(),
            poll_interval_seconds: default_renewal_poll(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_session_file(),
        }
    }
}

impl ApiConfig {
    /// Join a request path onto the base URL
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl ChannelConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

impl RenewalConfig {
    pub fn threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.threshold_seconds as i64)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

impl CoreConfig {
    /// Load configuration from an optional JSON file, falling back to defaults.
    ///
    /// Environment overrides are applied by the default functions, so a file
    /// that omits a field still picks up `CRAWLDASH_*` variables.
    pub async fn load(path: Option<&Path>) -> CoreResult<Self> {
        let config = match path {
            Some(path) if path.exists() => {
                let raw = fs::read_to_string(path).await.map_err(storage_failed)?;
                let config: CoreConfig = serde_json::from_str(&raw).map_err(|e| {
                    config_invalid(&path.display().to_string(), "<file>", &e.to_string())
                })?;
                debug!("Loaded configuration from {}", path.display());
                config
            }
            Some(path) => {
                info!(
                    "No configuration at {}, using defaults",
                    path.display()
                );
                CoreConfig::default()
            }
            None => CoreConfig::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the managers cannot work with
    pub fn validate(&self) -> CoreResult<()> {
        Url::parse(&self.api.base_url)
            .map_err(|e| config_invalid("api.base_url", &self.api.base_url, &e.to_string()))?;

        let ws = Url::parse(&self.channel.url)
            .map_err(|e| config_invalid("channel.url", &self.channel.url, &e.to_string()))?;
        if ws.scheme() != "ws" && ws.scheme() != "wss" {
            return Err(config_invalid(
                "channel.url",
                &self.channel.url,
                "scheme must be ws or wss",
            ));
        }

        if self.channel.heartbeat_interval_seconds == 0 {
            return Err(config_invalid(
                "channel.heartbeat_interval_seconds",
                "0",
                "must be positive",
            ));
        }

        if self.channel.max_delay_ms < self.channel.base_delay_ms {
            return Err(config_invalid(
                "channel.max_delay_ms",
                &self.channel.max_delay_ms.to_string(),
                "must not be smaller than base_delay_ms",
            ));
        }

        if self.renewal.poll_interval_seconds == 0 {
            return Err(config_invalid(
                "renewal.poll_interval_seconds",
                "0",
                "must be positive",
            ));
        }

        if self.event_bus_capacity == 0 {
            return Err(config_invalid("event_bus_capacity", "0", "must be positive"));
        }

        for (key, path) in [
            ("api.login_path", &self.api.login_path),
            ("api.refresh_path", &self.api.refresh_path),
        ] {
            if path.trim().is_empty() {
                return Err(config_missing(key));
            }
        }

        Ok(())
    }
}
