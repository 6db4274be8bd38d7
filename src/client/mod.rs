//! Miniserver client: connection lifecycle, command submission and events
//!
//! [`MiniserverClient`] is the entry point. It owns a [`ConnectionManager`]
//! that keeps one authenticated websocket session alive, replacing it after
//! transport failures until the reconnect budget is spent.

pub mod bootstrap;
pub mod command_queue;
pub mod connection;
pub mod dispatcher;
pub mod keepalive;
pub mod session;
pub mod transport;

pub use bootstrap::{ApiKeyInfo, Bootstrap, HttpBootstrap};
pub use connection::{ConnectionManager, ConnectionState, ConnectionStats, StateChange};
pub use transport::{Connector, FrameSink, FrameSource, WsConnector};

use crate::auth::{PersistedToken, Token};
use crate::config::{credentials::LoxoneCredentials, ClientConfig};
use crate::error::{LoxoneError, Result};
use crate::protocol::message::to_structure_uuid;
use crate::protocol::{commands, Message, TextMessage};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Request/response over the Miniserver connection.
///
/// Returns the reply whatever its code; callers decide how to treat non-200.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn request(&self, command: &str, encrypted: bool) -> Result<TextMessage>;
}

/// Messages forwarded to subscribers
pub struct EventSubscription {
    rx: broadcast::Receiver<Message>,
}

impl EventSubscription {
    fn new(rx: broadcast::Receiver<Message>) -> Self {
        Self { rx }
    }

    /// Next message, or `None` once the client is gone.
    ///
    /// A subscriber that falls behind skips the oldest messages.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagging, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Client for one Miniserver
pub struct MiniserverClient {
    manager: Arc<ConnectionManager>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl MiniserverClient {
    /// Client over HTTP bootstrap and the websocket transport
    pub fn new(config: ClientConfig, credentials: LoxoneCredentials) -> Result<Self> {
        config.validate()?;
        credentials.validate()?;
        let bootstrap = HttpBootstrap::new(&config, credentials.clone())?;
        Ok(Self::with_transport(
            config,
            credentials,
            Arc::new(bootstrap),
            Arc::new(WsConnector),
            None,
        ))
    }

    /// Client over caller-supplied bootstrap and transport
    pub fn with_transport(
        config: ClientConfig,
        credentials: LoxoneCredentials,
        bootstrap: Arc<dyn Bootstrap>,
        connector: Arc<dyn Connector>,
        token: Option<Token>,
    ) -> Self {
        Self {
            manager: Arc::new(ConnectionManager::new(
                config,
                credentials,
                bootstrap,
                connector,
                token,
            )),
            supervisor: Mutex::new(None),
        }
    }

    /// Reuse a token stored by an earlier run
    pub fn with_token(
        config: ClientConfig,
        credentials: LoxoneCredentials,
        record: PersistedToken,
    ) -> Result<Self> {
        config.validate()?;
        credentials.validate()?;
        let token = Token::from_record(record)?;
        let bootstrap = HttpBootstrap::new(&config, credentials.clone())?;
        Ok(Self::with_transport(
            config,
            credentials,
            Arc::new(bootstrap),
            Arc::new(WsConnector),
            Some(token),
        ))
    }

    /// Subscribe to state tables and unsolicited messages
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription::new(self.manager.events())
    }

    /// Connect and authenticate, then keep the connection alive in the background
    pub async fn connect(&self) -> Result<()> {
        let mut supervisor = self.supervisor.lock().await;
        if self.manager.shutdown_token().is_cancelled() {
            return Err(LoxoneError::closed("Client was closed"));
        }
        if supervisor.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(LoxoneError::invalid_input("Client is already connected"));
        }

        self.manager.clear_disconnect();
        match self.manager.establish().await {
            Ok(session) => {
                info!(url = %self.manager.config().url, "Connected to Miniserver");
                *supervisor = Some(tokio::spawn(self.manager.clone().supervise(session)));
                Ok(())
            }
            Err(e) => {
                e.log("Connecting to Miniserver failed");
                self.manager.give_up(&e).await;
                Err(e)
            }
        }
    }

    /// `jdev/sps/io/<uuid>/<value>`; a non-200 reply is a `Command` error
    pub async fn send_command(&self, uuid: &str, value: &str) -> Result<TextMessage> {
        self.send_raw(&commands::device_command(uuid, value), false)
            .await?
            .into_result()
    }

    /// Send an arbitrary command string and return the reply as is
    pub async fn send_raw(&self, command: &str, encrypted: bool) -> Result<TextMessage> {
        self.manager.user_sender().request(command, encrypted).await
    }

    /// Send a command protected by the visualization password
    pub async fn send_secured_command(
        &self,
        uuid: &str,
        value: &str,
        visual_password: &str,
    ) -> Result<TextMessage> {
        self.manager
            .token_manager()?
            .send_secured_command(uuid, value, visual_password)
            .await
    }

    /// Ask the Miniserver whether the current token is still valid
    pub async fn check_token(&self) -> Result<TextMessage> {
        self.manager.token_manager()?.check_token().await
    }

    /// Current token as a record for persistence
    pub fn token(&self) -> Option<PersistedToken> {
        self.manager.token().map(|token| token.to_record())
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state().get()
    }

    pub fn state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.manager.state().changes()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.manager.stats()
    }

    pub fn api_info(&self) -> Option<ApiKeyInfo> {
        self.manager.api_info()
    }

    /// `LoxAPP3.json` as loaded during the last connect
    pub fn structure_file(&self) -> Option<Arc<Value>> {
        self.manager.structure_file()
    }

    /// Structure file entry for the control behind `uuid`.
    ///
    /// Accepts the canonical form used by state tables as well as the
    /// structure file's own key form.
    pub fn control(&self, uuid: &str) -> Option<Value> {
        let structure = self.manager.structure_file()?;
        let controls = structure.get("controls")?;
        controls
            .get(to_structure_uuid(uuid))
            .or_else(|| controls.get(uuid))
            .cloned()
    }

    /// Wait until the connection is closed; returns why it was lost, if it was.
    ///
    /// While a reason is set, commands fail at once with `Disconnected`.
    pub async fn wait_closed(&self) -> Option<String> {
        let mut state = self.manager.state().watch();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
        self.manager.disconnect_reason()
    }

    /// Stop the client.
    ///
    /// Queued commands are flushed within the drain timeout and no reconnect
    /// happens afterwards. The client cannot be connected again.
    pub async fn close(&self) -> Result<()> {
        let mut supervisor = self.supervisor.lock().await;
        if self.manager.shutdown_token().is_cancelled() {
            return Ok(());
        }
        self.manager.state().set(ConnectionState::Stopping);

        if self.manager.config().kill_token_on_close {
            match self.manager.token_manager() {
                Ok(mut tokens) => {
                    if let Err(e) = tokens.kill_token().await {
                        e.log("Could not revoke token on close");
                    }
                }
                Err(e) => debug!("Token not revoked: {e}"),
            }
        }

        self.manager.shutdown_token().cancel();
        if let Some(handle) = supervisor.take() {
            if let Err(e) = handle.await {
                warn!("Connection supervisor ended abnormally: {e}");
            }
        }

        self.manager.state().set(ConnectionState::Closed);
        info!("Miniserver client closed");
        Ok(())
    }
}
