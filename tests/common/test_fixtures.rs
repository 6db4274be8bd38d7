//! Test fixtures shared by the integration tests
//!
//! Provides fast-retry configurations, credentials and small polling helpers
//! using rstest fixtures.

use super::fake_miniserver::{FakeMiniserver, PASSWORD, USER};
use loxone_ws::auth::Token;
use loxone_ws::config::{BackoffConfig, ClientConfig};
use loxone_ws::{LoxoneCredentials, MiniserverClient};
use rstest::*;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

fn fast_backoff(max_attempts: u32) -> BackoffConfig {
    BackoffConfig {
        max_attempts,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        multiplier: 2.0,
        jitter_factor: 0.0,
    }
}

/// Client configuration with millisecond retry delays
#[fixture]
pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::new(Url::parse("http://fake-miniserver.local").unwrap());
    config.client_uuid = "098802e1-02b4-603c-ffffeee000d80cfd".to_string();
    config.client_name = "loxone-ws-tests".to_string();

    let protocol = &mut config.protocol;
    protocol.probe = fast_backoff(3);
    protocol.reconnect = fast_backoff(5);
    protocol.out_of_service_delay = Duration::from_millis(20);
    protocol.request_timeout = Duration::from_secs(5);
    protocol.submit_timeout = Duration::from_secs(1);
    protocol.drain_timeout = Duration::from_millis(500);
    config
}

#[fixture]
pub fn credentials() -> LoxoneCredentials {
    LoxoneCredentials::new(USER, PASSWORD)
}

/// Client wired to `fake` for both bootstrap and transport
pub fn client_for(
    fake: &FakeMiniserver,
    config: ClientConfig,
    token: Option<Token>,
) -> MiniserverClient {
    MiniserverClient::with_transport(
        config,
        credentials(),
        Arc::new(fake.clone()),
        Arc::new(fake.clone()),
        token,
    )
}

/// Poll `condition` every 10 ms, panicking after 10 s
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if polled.is_err() {
        panic!("timed out waiting for {what}");
    }
}
