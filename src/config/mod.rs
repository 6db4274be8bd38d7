//! Configuration management for the Loxone websocket client
//!
//! [`ClientConfig`] describes where the Miniserver lives and who the client is.
//! [`ProtocolConfig`] bundles the protocol constants (key sizes, salt limits,
//! timeouts, retry budgets) into one immutable value handed to every session.

pub mod credentials;

use crate::error::{LoxoneError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{env, time::Duration};
use url::Url;

/// Whether the websocket uses TLS
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Follow the `httpsStatus` the Miniserver reports in its apiKey response
    #[default]
    Auto,
    /// Always use `wss://`
    Always,
    /// Always use `ws://`
    Never,
}

impl TlsMode {
    /// Resolve the mode against the server's reported TLS capability
    pub fn use_tls(self, server_reports_https: bool) -> bool {
        match self {
            TlsMode::Auto => server_reports_https,
            TlsMode::Always => true,
            TlsMode::Never => false,
        }
    }
}

/// Exponential backoff with jitter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffConfig {
    /// Maximum number of attempts before giving up
    pub max_attempts: u32,

    /// Delay before the second attempt
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound for a single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Backoff multiplier
    pub multiplier: f64,

    /// Jitter factor to prevent thundering herd (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl BackoffConfig {
    /// Delay before attempt `attempt + 1`, without jitter. `attempt` starts at 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay with random jitter added on top
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        let jitter = (delay.as_millis() as f64 * self.jitter_factor) as u64;
        let random_jitter = if jitter > 0 {
            rand::thread_rng().gen_range(0..jitter)
        } else {
            0
        };
        delay + Duration::from_millis(random_jitter)
    }
}

/// Immutable protocol constants shared by every component of a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProtocolConfig {
    /// AES session key length in bytes
    pub aes_key_size: usize,

    /// AES IV length in bytes
    pub iv_size: usize,

    /// Random salt length in bytes (hex encoded on the wire)
    pub salt_bytes: usize,

    /// Number of encrypted commands a salt may be used for
    pub salt_max_use_count: u32,

    /// Maximum salt age
    #[serde(with = "humantime_serde")]
    pub salt_max_age: Duration,

    /// Interval between keepalive pings
    #[serde(with = "humantime_serde")]
    pub keepalive_period: Duration,

    /// How long to wait for the keepalive reply
    #[serde(with = "humantime_serde")]
    pub keepalive_timeout: Duration,

    /// Consecutive missed keepalives that count as a dead connection
    pub max_missed_keepalives: u32,

    /// Timeout for each HTTP bootstrap request
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,

    /// Timeout for opening the websocket
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Timeout for each request/response round trip
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// How long a submission may wait for queue capacity
    #[serde(with = "humantime_serde")]
    pub submit_timeout: Duration,

    /// Budget for flushing queued commands on close
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,

    /// Reachability probe retry policy
    pub probe: BackoffConfig,

    /// Reconnect retry policy
    pub reconnect: BackoffConfig,

    /// Upper bound for the token refresh schedule
    #[serde(with = "humantime_serde")]
    pub max_refresh_delay: Duration,

    /// Delay before retrying a refresh that could not confirm a new key
    #[serde(with = "humantime_serde")]
    pub refresh_retry_delay: Duration,

    /// Bounded wait for the server to hand out a fresh key before refreshing
    #[serde(with = "humantime_serde")]
    pub key_confirm_timeout: Duration,

    /// Remaining lifetime below which a stored token is not reused
    #[serde(with = "humantime_serde")]
    pub min_token_lifetime: Duration,

    /// Delay before reconnecting after an out-of-service announcement
    #[serde(with = "humantime_serde")]
    pub out_of_service_delay: Duration,

    /// Consecutive protocol errors tolerated before the connection is dropped
    pub max_protocol_errors: u32,

    /// Capacity of the user command lane
    pub command_queue_capacity: usize,

    /// Capacity of the event broadcast buffer
    pub event_capacity: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            aes_key_size: 32,
            iv_size: 16,
            salt_bytes: 16,
            salt_max_use_count: 100,
            salt_max_age: Duration::from_secs(60 * 60),
            // The Miniserver drops idle sockets after 5 minutes
            keepalive_period: Duration::from_secs(270),
            keepalive_timeout: Duration::from_secs(30),
            max_missed_keepalives: 2,
            http_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            submit_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(2),
            probe: BackoffConfig {
                max_attempts: 6,
                initial_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(60),
                multiplier: 2.0,
                jitter_factor: 0.0,
            },
            reconnect: BackoffConfig {
                max_attempts: 20,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
                jitter_factor: 0.1,
            },
            max_refresh_delay: Duration::from_secs(24 * 60 * 60),
            refresh_retry_delay: Duration::from_secs(60),
            key_confirm_timeout: Duration::from_secs(5),
            min_token_lifetime: Duration::from_secs(60 * 60),
            out_of_service_delay: Duration::from_secs(10),
            max_protocol_errors: 10,
            command_queue_capacity: 64,
            event_capacity: 1024,
        }
    }
}

impl ProtocolConfig {
    /// Validate protocol constants
    pub fn validate(&self) -> Result<()> {
        if self.aes_key_size != 32 {
            return Err(LoxoneError::config("AES key size must be 32 bytes"));
        }
        if self.iv_size != 16 {
            return Err(LoxoneError::config("AES IV size must be 16 bytes"));
        }
        if self.salt_bytes == 0 {
            return Err(LoxoneError::config("Salt length must be greater than zero"));
        }
        if self.keepalive_period.is_zero() || self.request_timeout.is_zero() {
            return Err(LoxoneError::config(
                "Keepalive period and request timeout must be greater than zero",
            ));
        }
        if self.command_queue_capacity == 0 || self.event_capacity == 0 {
            return Err(LoxoneError::config("Queue capacities must be greater than zero"));
        }
        if self.probe.max_attempts == 0 || self.reconnect.max_attempts == 0 {
            return Err(LoxoneError::config("Retry budgets must allow at least one attempt"));
        }
        Ok(())
    }
}

/// Miniserver connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Miniserver base URL (e.g., "http://192.168.1.100:8080")
    pub url: Url,

    /// Websocket TLS selection
    #[serde(default)]
    pub tls: TlsMode,

    /// Enable SSL/TLS verification for the HTTP bootstrap
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,

    /// Client identifier registered with issued tokens
    #[serde(default = "default_client_uuid")]
    pub client_uuid: String,

    /// Human readable client name shown in the Miniserver's token list
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// Token permission level (2 = web, 4 = app)
    #[serde(default = "default_permission")]
    pub permission: u8,

    /// Revoke the token when the client is closed
    #[serde(default)]
    pub kill_token_on_close: bool,

    /// Protocol constants
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

fn default_verify_ssl() -> bool {
    true
}

fn default_client_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_client_name() -> String {
    "loxone-ws".to_string()
}

fn default_permission() -> u8 {
    2
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: Url::parse("http://127.0.0.1:80").expect("static default URL is valid"),
            tls: TlsMode::default(),
            verify_ssl: default_verify_ssl(),
            client_uuid: default_client_uuid(),
            client_name: default_client_name(),
            permission: default_permission(),
            kill_token_on_close: false,
            protocol: ProtocolConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a configuration for the given Miniserver URL
    pub fn new(url: Url) -> Self {
        Self {
            url,
            ..Self::default()
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        // Support both LOXONE_URL and LOXONE_HOST
        if let Ok(url) = env::var("LOXONE_URL") {
            config.url = url
                .parse()
                .map_err(|e| LoxoneError::config(format!("Invalid LOXONE_URL: {e}")))?;
        } else if let Ok(host) = env::var("LOXONE_HOST") {
            let url_str = if host.starts_with("http://") || host.starts_with("https://") {
                host
            } else {
                format!("http://{host}")
            };
            config.url = url_str
                .parse()
                .map_err(|e| LoxoneError::config(format!("Invalid LOXONE_HOST: {e}")))?;
        }

        if let Ok(tls) = env::var("LOXONE_TLS") {
            config.tls = match tls.to_lowercase().as_str() {
                "auto" => TlsMode::Auto,
                "always" | "true" | "1" => TlsMode::Always,
                "never" | "false" | "0" => TlsMode::Never,
                _ => {
                    return Err(LoxoneError::config(format!(
                        "Invalid LOXONE_TLS: {tls}. Use 'auto', 'always' or 'never'"
                    )));
                }
            };
        }

        if let Ok(verify) = env::var("LOXONE_VERIFY_SSL") {
            config.verify_ssl = verify.to_lowercase() != "false";
        }

        if let Ok(client_uuid) = env::var("LOXONE_CLIENT_UUID") {
            config.client_uuid = client_uuid;
        }

        if let Ok(timeout) = env::var("LOXONE_TIMEOUT") {
            config.protocol.request_timeout = Duration::from_secs(
                timeout
                    .parse()
                    .map_err(|e| LoxoneError::config(format!("Invalid LOXONE_TIMEOUT: {e}")))?,
            );
        }

        if let Ok(permission) = env::var("LOXONE_PERMISSION") {
            config.permission = permission
                .parse()
                .map_err(|e| LoxoneError::config(format!("Invalid LOXONE_PERMISSION: {e}")))?;
        }

        Ok(config)
    }

    /// Parse configuration from a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| LoxoneError::config(format!("Invalid TOML: {e}")))
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&source)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.url.scheme() != "http" && self.url.scheme() != "https" {
            return Err(LoxoneError::config("URL must use http or https scheme"));
        }

        if self.url.host_str().is_none() {
            return Err(LoxoneError::config("URL must contain a host"));
        }

        if self.client_uuid.is_empty() || self.client_uuid.contains('/') {
            return Err(LoxoneError::config("Client UUID must be non-empty and slash free"));
        }

        if self.permission != 2 && self.permission != 4 {
            return Err(LoxoneError::config("Permission must be 2 (web) or 4 (app)"));
        }

        self.protocol.validate()
    }
}
