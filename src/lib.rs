//! Async client for the Loxone Miniserver websocket protocol
//!
//! This crate speaks the Miniserver's duplex protocol: binary-framed messages
//! over a websocket, an RSA to AES session-key exchange, salted command
//! encryption and long-lived token authentication with scheduled renewal.
//!
//! # Features
//!
//! - Typed decoding of text, value-state, text-state, daytimer and weather messages
//! - Token acquisition, reuse, refresh and revocation (`getjwt` and legacy `gettoken`)
//! - Encrypted and secured (`ios`) commands
//! - Keepalive supervision and automatic reconnect with backoff
//! - Event subscription through a bounded broadcast channel
//!
//! # Example
//!
//! ```no_run
//! use loxone_ws::{ClientConfig, LoxoneCredentials, MiniserverClient};
//!
//! # async fn run() -> loxone_ws::Result<()> {
//! let config = ClientConfig::new("http://192.168.1.77".parse()?);
//! let client = MiniserverClient::new(config, LoxoneCredentials::new("admin", "secret"))?;
//! let mut events = client.subscribe();
//! client.connect().await?;
//!
//! client.send_command("0f8b5c2a-0123-1c4a-ffff-403fb0c34b9e", "on").await?;
//! while let Some(message) = events.recv().await {
//!     println!("{message:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod protocol;

pub use auth::{PersistedToken, Token};
pub use client::{
    ApiKeyInfo, ConnectionState, ConnectionStats, EventSubscription, MiniserverClient, StateChange,
};
pub use config::{credentials::LoxoneCredentials, ClientConfig, ProtocolConfig, TlsMode};
pub use error::{LoxoneError, Result};
pub use protocol::{Message, TextMessage};
