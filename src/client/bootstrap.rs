//! HTTP bootstrap: reachability probe, public key and structure file

use crate::config::{credentials::LoxoneCredentials, BackoffConfig, ClientConfig};
use crate::error::{LoxoneError, Result};
use crate::protocol::commands::{self, FirmwareVersion};
use crate::protocol::TextMessage;
use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

/// Result of `GET /jdev/cfg/apiKey`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub snr: String,
    #[serde(rename = "httpsStatus", default)]
    pub https_status: i64,
    #[serde(default = "default_local")]
    pub local: bool,
}

fn default_local() -> bool {
    true
}

impl ApiKeyInfo {
    /// Parse the apiKey value, which uses single quotes instead of JSON's double quotes
    pub fn parse(value: &str) -> Result<Self> {
        let normalized = value.replace('\'', "\"");
        serde_json::from_str(&normalized)
            .map_err(|e| LoxoneError::protocol(format!("Invalid apiKey value: {e}")))
    }

    /// Whether the Miniserver reports working HTTPS
    pub fn reports_https(&self) -> bool {
        self.https_status == 1
    }

    pub fn firmware_version(&self) -> Result<FirmwareVersion> {
        FirmwareVersion::parse(&self.version)
    }
}

/// HTTP side of connection setup
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Bootstrap: Send + Sync {
    /// Reachability probe
    async fn api_key(&self) -> Result<ApiKeyInfo>;

    /// The server's RSA key, as returned (certificate-wrapped)
    async fn public_key(&self) -> Result<String>;

    async fn structure_file(&self) -> Result<Value>;

    /// Base URL the websocket URL is derived from
    async fn base_url(&self) -> Url;
}

/// Probe with bounded retry; 503 and network errors are retried, 401 is fatal
pub async fn probe_with_retry(bootstrap: &dyn Bootstrap, backoff: &BackoffConfig) -> Result<ApiKeyInfo> {
    let mut attempt = 1;
    loop {
        match bootstrap.api_key().await {
            Ok(info) => return Ok(info),
            Err(e) if e.is_auth_error() => return Err(e),
            Err(e) if e.is_retryable() && attempt < backoff.max_attempts => {
                let delay = backoff.jittered_delay(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Miniserver not reachable: {e}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) if e.is_retryable() => {
                return Err(LoxoneError::connection(format!(
                    "Miniserver unreachable after {attempt} attempts: {e}"
                )))
            }
            Err(e) => return Err(e),
        }
    }
}

/// [`Bootstrap`] over `reqwest` with basic auth
pub struct HttpBootstrap {
    client: Client,
    base_url: RwLock<Url>,
    credentials: LoxoneCredentials,
}

impl HttpBootstrap {
    pub fn new(config: &ClientConfig, credentials: LoxoneCredentials) -> Result<Self> {
        let mut builder = ClientBuilder::new()
            .timeout(config.protocol.http_timeout)
            .user_agent(format!("loxone-ws/{}", env!("CARGO_PKG_VERSION")));

        if !config.verify_ssl {
            warn!("SSL verification disabled - this is insecure for production use");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| LoxoneError::connection(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: RwLock::new(config.url.clone()),
            credentials,
        })
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = self
            .base_url
            .read()
            .await
            .join(path)
            .map_err(|e| LoxoneError::config(format!("Invalid URL path {path}: {e}")))?;

        debug!(%url, "HTTP bootstrap request");
        let response = self
            .client
            .get(url)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED => Err(LoxoneError::authentication(format!(
                "Miniserver rejected credentials for {path}"
            ))),
            StatusCode::SERVICE_UNAVAILABLE => Err(LoxoneError::service_unavailable(format!(
                "Miniserver is starting up ({path})"
            ))),
            status => Err(LoxoneError::connection(format!("HTTP {status} for {path}"))),
        }
    }

    async fn get_ll(&self, path: &str) -> Result<TextMessage> {
        let body = self.get(path).await?.text().await?;
        TextMessage::parse(&body)?.into_result()
    }
}

#[async_trait]
impl Bootstrap for HttpBootstrap {
    async fn api_key(&self) -> Result<ApiKeyInfo> {
        let response = self.get(commands::API_KEY_PATH).await?;
        let final_url = response.url().clone();
        let reply = TextMessage::parse(&response.text().await?)?.into_result()?;
        let info = ApiKeyInfo::parse(&reply.value_string())?;

        if !info.local {
            // remote access goes through the redirect the cloud DNS answered with
            let mut redirected = final_url;
            redirected.set_path("/");
            redirected.set_query(None);
            info!(url = %redirected, "Miniserver reached through remote access");
            *self.base_url.write().await = redirected;
        }

        info!(version = %info.version, snr = %info.snr, https = info.https_status, "Miniserver reachable");
        Ok(info)
    }

    async fn public_key(&self) -> Result<String> {
        let key = self.get_ll(commands::PUBLIC_KEY_PATH).await?.value_string();
        if key.trim().is_empty() {
            return Err(LoxoneError::crypto("Miniserver returned an empty public key"));
        }
        Ok(key)
    }

    async fn structure_file(&self) -> Result<Value> {
        let structure: Value = self
            .get(commands::STRUCTURE_FILE_PATH)
            .await?
            .json()
            .await?;
        let last_modified = structure
            .get("lastModified")
            .and_then(|v| v.as_str())
            .unwrap_or("?");
        debug!(last_modified, "Structure file loaded");
        Ok(structure)
    }

    async fn base_url(&self) -> Url {
        self.base_url.read().await.clone()
    }
}
