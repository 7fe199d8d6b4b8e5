//! Client configuration.
//!
//! Defaults target a local development server. Every value can be overridden
//! with a builder-style setter or from the environment (`TASKSYNC_*`).

use std::time::Duration;
use thiserror::Error;

use crate::push::PushConfig;

const DEFAULT_API_URL: &str = "http://localhost:5000/api";
const DEFAULT_HUB_URL: &str = "http://localhost:5000/active";

/// Errors raised while reading configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid URL in {var}: {value}")]
    InvalidUrl { var: &'static str, value: String },

    #[error("Invalid number in {var}: {value}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("Invalid flag in {var}: {value}")]
    InvalidFlag { var: &'static str, value: String },
}

/// Connection settings for the REST API and the event hub
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base URL every command path is joined onto
    pub api_base_url: String,
    /// Hub endpoint (http/https; switched to ws/wss for the socket)
    pub hub_url: String,
    /// Per-request timeout for commands and negotiation
    pub request_timeout: Duration,
    /// Connect the socket directly without the negotiate round-trip
    pub skip_negotiation: bool,
    /// Interval between client pings
    pub keep_alive_interval: Duration,
    /// Silence after which the connection counts as dropped
    pub server_timeout: Duration,
    /// Delay before each reconnect attempt; exhausted means give up
    pub reconnect_delays: Vec<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            hub_url: DEFAULT_HUB_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            skip_negotiation: false,
            keep_alive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            reconnect_delays: [0, 2, 10, 30].into_iter().map(Duration::from_secs).collect(),
        }
    }
}

impl ClientConfig {
    pub fn new(api_base_url: impl Into<String>, hub_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            hub_url: hub_url.into(),
            ..Default::default()
        }
    }

    /// Read overrides from the environment on top of the defaults.
    ///
    /// Call `dotenvy::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup("TASKSYNC_API_URL") {
            config.api_base_url = parse_url("TASKSYNC_API_URL", value)?;
        }
        if let Some(value) = lookup("TASKSYNC_HUB_URL") {
            config.hub_url = parse_url("TASKSYNC_HUB_URL", value)?;
        }
        if let Some(value) = lookup("TASKSYNC_REQUEST_TIMEOUT_MS") {
            let millis = value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidNumber {
                    var: "TASKSYNC_REQUEST_TIMEOUT_MS",
                    value: value.clone(),
                })?;
            config.request_timeout = Duration::from_millis(millis);
        }
        if let Some(value) = lookup("TASKSYNC_SKIP_NEGOTIATION") {
            config.skip_negotiation = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                _ => {
                    return Err(ConfigError::InvalidFlag {
                        var: "TASKSYNC_SKIP_NEGOTIATION",
                        value,
                    })
                }
            };
        }

        Ok(config)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_skip_negotiation(mut self, skip: bool) -> Self {
        self.skip_negotiation = skip;
        self
    }

    pub fn with_keep_alive(mut self, interval: Duration, server_timeout: Duration) -> Self {
        self.keep_alive_interval = interval;
        self.server_timeout = server_timeout;
        self
    }

    pub fn with_reconnect_delays(mut self, delays: Vec<Duration>) -> Self {
        self.reconnect_delays = delays;
        self
    }

    /// Settings for the push channel
    pub fn push_config(&self) -> PushConfig {
        PushConfig {
            keep_alive_interval: self.keep_alive_interval,
            server_timeout: self.server_timeout,
            handshake_timeout: self.request_timeout,
            reconnect_delays: self.reconnect_delays.clone(),
        }
    }
}

fn parse_url(var: &'static str, value: String) -> Result<String, ConfigError> {
    let trimmed = value.trim().trim_end_matches('/');
    match reqwest::Url::parse(trimmed) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(trimmed.to_string()),
        _ => Err(ConfigError::InvalidUrl { var, value }),
    }
}
