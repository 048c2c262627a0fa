//! Negotiation and relay configuration
//!
//! Defaults follow the relay's demo deployment: poll once a second, give up
//! after ten attempts, discover candidates through a single public STUN server.
//! Settings can be loaded from a TOML file and overridden from the command line.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::SignalingError;

/// Default relay deployment
pub const DEFAULT_RELAY_URL: &str = "https://jarmillemich-rust-signaling.fermyon.app";

/// Default STUN server used for candidate discovery
pub const DEFAULT_STUN_SERVER: &str = "stun:stun3.l.google.com:19302";

/// Default delay between relay polls
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default number of polls before giving up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Label of the data channel the joining side opens
pub const DEFAULT_CHANNEL_LABEL: &str = "main";

/// First message the host sends on every new data channel
pub const DEFAULT_GREETING: &str = "hello from the server";

/// Fixed-interval, bounded polling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before each poll
    pub interval: Duration,
    /// Number of polls before the loop ends
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Upper bound on how long a polling loop can run
    pub fn ceiling(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// Settings shared by the host and join negotiators
#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    pub retry: RetryPolicy,
    /// Discovery server URLs handed to every new connection
    pub ice_servers: Vec<String>,
    /// How long to wait for local discovery to complete
    pub gather_timeout: Duration,
    pub data_channel_label: String,
    /// Sent by the host on each data channel it accepts (None = stay quiet)
    pub greeting: Option<String>,
    pub host_name: String,
    /// Whether the relay should list the hosted session publicly
    pub public: bool,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            retry,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            gather_timeout: retry.ceiling(),
            data_channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            greeting: Some(DEFAULT_GREETING.to_string()),
            host_name: "host".to_string(),
            public: false,
        }
    }
}

/// On-disk configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    /// Base URL of the signaling relay
    #[serde(default = "default_relay_url")]
    pub relay_url: String,

    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_host_name")]
    pub host_name: String,

    #[serde(default)]
    pub public: bool,

    /// Host greeting (None = use the default, empty = no greeting)
    #[serde(default)]
    pub greeting: Option<String>,
}

fn default_relay_url() -> String {
    DEFAULT_RELAY_URL.to_string()
}

fn default_ice_servers() -> Vec<String> {
    vec![DEFAULT_STUN_SERVER.to_string()]
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_host_name() -> String {
    "host".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            ice_servers: default_ice_servers(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            host_name: default_host_name(),
            public: false,
            greeting: None,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, SignalingError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, SignalingError> {
        let config: RelayConfig = toml::from_str(content)
            .map_err(|e| SignalingError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration values
    pub fn validate(&self) -> Result<(), SignalingError> {
        if !self.relay_url.starts_with("http://") && !self.relay_url.starts_with("https://") {
            return Err(SignalingError::Config(format!(
                "Invalid relay URL: {}. Must start with http:// or https://",
                self.relay_url
            )));
        }

        if self.max_attempts == 0 {
            return Err(SignalingError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(SignalingError::Config(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Build the negotiator settings this file describes
    pub fn negotiation_config(&self) -> NegotiationConfig {
        let retry = RetryPolicy {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_attempts: self.max_attempts,
        };

        let greeting = match self.greeting.as_deref() {
            None => Some(DEFAULT_GREETING.to_string()),
            Some("") => None,
            Some(text) => Some(text.to_string()),
        };

        NegotiationConfig {
            retry,
            ice_servers: self.ice_servers.clone(),
            gather_timeout: retry.ceiling(),
            greeting,
            host_name: self.host_name.clone(),
            public: self.public,
            ..NegotiationConfig::default()
        }
    }
}
