//! Connection state machine, statistics and the reconnect supervisor
//!
//! ```text
//! Closed ─▶ Connecting ─▶ KeyExchanged ─▶ Authenticating ─▶ Connected ─▶ Stopping ─▶ Closed
//!              ▲                                                │
//!              └──────────────── Reconnecting ◀─── failure ─────┘
//! ```

use super::bootstrap::{probe_with_retry, ApiKeyInfo, Bootstrap};
use super::command_queue::{CommandSender, Lane, QueuedCommand, UserLane};
use super::session::{Session, SessionContext, SessionFailure};
use super::transport::{websocket_url, Connector};
use super::CommandChannel;
use crate::auth::{Token, TokenManager};
use crate::config::{credentials::LoxoneCredentials, ClientConfig};
use crate::crypto::rsa;
use crate::error::{LoxoneError, Result};
use crate::protocol::commands::{self, TokenApi};
use crate::protocol::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of the client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Closed,
    Connecting,
    KeyExchanged,
    Authenticating,
    Connected,
    Reconnecting,
    Stopping,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Connecting => "connecting",
            ConnectionState::KeyExchanged => "key-exchanged",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// One transition of [`ConnectionState`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub at: DateTime<Utc>,
}

/// Current state plus a broadcast of every transition
#[derive(Debug)]
pub struct StateTracker {
    current: watch::Sender<ConnectionState>,
    changes: broadcast::Sender<StateChange>,
}

impl StateTracker {
    pub fn new(capacity: usize) -> Self {
        let (current, _) = watch::channel(ConnectionState::Closed);
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self { current, changes }
    }

    pub fn get(&self) -> ConnectionState {
        *self.current.borrow()
    }

    /// Move to `to`; repeated states are not reported
    pub fn set(&self, to: ConnectionState) {
        let from = self.current.send_replace(to);
        if from == to {
            return;
        }
        info!(%from, %to, "Connection state changed");
        let _ = self.changes.send(StateChange {
            from,
            to,
            at: Utc::now(),
        });
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.current.subscribe()
    }

    pub fn changes(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }
}

/// Connection statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Total decoded messages received
    pub messages_received: u64,

    /// Value and text state tables forwarded to subscribers
    pub state_updates: u64,

    /// Messages dropped as malformed
    pub protocol_errors: u64,

    /// Total reconnection attempts
    pub reconnect_attempts: u32,

    pub task_groups_started: u32,
    pub task_groups_cancelled: u32,

    /// Last message received timestamp
    pub last_message: Option<DateTime<Utc>>,

    /// Start of the current session
    pub connected_since: Option<DateTime<Utc>>,
}

/// Owns everything that outlives a single session and drives reconnects
pub struct ConnectionManager {
    config: ClientConfig,
    credentials: LoxoneCredentials,
    bootstrap: Arc<dyn Bootstrap>,
    connector: Arc<dyn Connector>,
    state: StateTracker,
    stats: Arc<watch::Sender<ConnectionStats>>,
    token: Arc<watch::Sender<Option<Token>>>,
    api_info: watch::Sender<Option<ApiKeyInfo>>,
    structure: watch::Sender<Option<Arc<Value>>>,
    system: watch::Sender<Option<CommandSender>>,
    disconnect_reason: watch::Sender<Option<String>>,
    events: broadcast::Sender<Message>,
    user_tx: mpsc::Sender<QueuedCommand>,
    user_lane: UserLane,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        config: ClientConfig,
        credentials: LoxoneCredentials,
        bootstrap: Arc<dyn Bootstrap>,
        connector: Arc<dyn Connector>,
        token: Option<Token>,
    ) -> Self {
        let protocol = &config.protocol;
        let (user_tx, user_rx) = mpsc::channel(protocol.command_queue_capacity);
        let (events, _) = broadcast::channel(protocol.event_capacity);

        Self {
            state: StateTracker::new(protocol.event_capacity),
            stats: Arc::new(watch::channel(ConnectionStats::default()).0),
            token: Arc::new(watch::channel(token).0),
            api_info: watch::channel(None).0,
            structure: watch::channel(None).0,
            system: watch::channel(None).0,
            disconnect_reason: watch::channel(None).0,
            events,
            user_tx,
            user_lane: Arc::new(Mutex::new(user_rx)),
            shutdown: CancellationToken::new(),
            config,
            credentials,
            bootstrap,
            connector,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> &StateTracker {
        &self.state
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.borrow().clone()
    }

    pub fn token(&self) -> Option<Token> {
        self.token.borrow().clone()
    }

    pub fn api_info(&self) -> Option<ApiKeyInfo> {
        self.api_info.borrow().clone()
    }

    pub fn structure_file(&self) -> Option<Arc<Value>> {
        self.structure.borrow().clone()
    }

    pub fn disconnect_reason(&self) -> Option<String> {
        self.disconnect_reason.borrow().clone()
    }

    pub fn events(&self) -> broadcast::Receiver<Message> {
        self.events.subscribe()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Submission handle for caller commands
    pub fn user_sender(&self) -> CommandSender {
        let protocol = &self.config.protocol;
        CommandSender::new(
            Lane::User,
            self.user_tx.clone(),
            protocol.submit_timeout,
            protocol.request_timeout,
            self.shutdown.clone(),
        )
        .with_disconnect_reason(self.disconnect_reason.subscribe())
    }

    /// Forget why the last connection was lost before connecting again
    pub fn clear_disconnect(&self) {
        self.disconnect_reason.send_replace(None);
    }

    /// Mark the connection as lost for good.
    ///
    /// Queued caller commands fail with `Disconnected`, and so do new
    /// submissions until the next `connect`.
    pub async fn give_up(&self, cause: &LoxoneError) {
        let reason = cause.to_string();
        self.disconnect_reason.send_replace(Some(reason.clone()));

        let mut lane = self.user_lane.lock().await;
        let mut failed = 0usize;
        while let Ok(command) = lane.try_recv() {
            if let Some(reply) = command.reply {
                let _ = reply.send(Err(LoxoneError::disconnected(reason.clone())));
            }
            failed += 1;
        }
        drop(lane);
        if failed > 0 {
            debug!(failed, "Queued commands failed after disconnect");
        }

        LoxoneError::disconnected(reason).log("Giving up on Miniserver connection");
        self.state.set(ConnectionState::Closed);
    }

    /// Token operations over the live session's system lane
    pub fn token_manager(&self) -> Result<TokenManager> {
        let system = self
            .system
            .borrow()
            .clone()
            .ok_or_else(|| LoxoneError::connection("Not connected"))?;
        let api = self
            .api_info
            .borrow()
            .as_ref()
            .map(token_api)
            .unwrap_or(TokenApi::Jwt);
        Ok(TokenManager::new(
            Arc::new(system),
            self.credentials.clone(),
            &self.config,
            api,
            self.token.clone(),
        ))
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            protocol: self.config.protocol.clone(),
            events: self.events.clone(),
            stats: self.stats.clone(),
            user_lane: self.user_lane.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Run one full connect: bootstrap, transport, key exchange and authentication
    pub async fn establish(&self) -> Result<Session> {
        self.state.set(ConnectionState::Connecting);
        let protocol = &self.config.protocol;

        let info = probe_with_retry(self.bootstrap.as_ref(), &protocol.probe).await?;
        let api = token_api(&info);
        let use_tls = self.config.tls.use_tls(info.reports_https());
        self.api_info.send_replace(Some(info));

        let public_key = rsa::parse_public_key(&self.bootstrap.public_key().await?)?;
        let structure = self.bootstrap.structure_file().await?;
        self.structure.send_replace(Some(Arc::new(structure)));

        let url = websocket_url(&self.bootstrap.base_url().await, use_tls)?;
        let mut session =
            Session::open(self.connector.as_ref(), &url, &public_key, &self.session_context())
                .await?;
        self.state.set(ConnectionState::KeyExchanged);

        let tokens = match self.authenticate(&session, api).await {
            Ok(tokens) => tokens,
            Err(e) => {
                session.shutdown().await;
                return Err(e);
            }
        };

        session.open_user_lane();
        session.spawn_keepalive();
        session.spawn_refresh(tokens);
        self.system.send_replace(Some(session.system_channel()));
        self.stats
            .send_modify(|stats| stats.connected_since = Some(Utc::now()));
        self.state.set(ConnectionState::Connected);
        Ok(session)
    }

    async fn authenticate(&self, session: &Session, api: TokenApi) -> Result<TokenManager> {
        self.state.set(ConnectionState::Authenticating);
        let channel = session.system_channel();
        let mut tokens = TokenManager::new(
            Arc::new(channel.clone()),
            self.credentials.clone(),
            &self.config,
            api,
            self.token.clone(),
        );
        tokens.authenticate().await?;

        channel
            .request(commands::ENABLE_BIN_STATUS_UPDATE, false)
            .await?
            .into_result()?;
        debug!("Binary status updates enabled");
        Ok(tokens)
    }

    /// Watch the session, replacing it after failures until shutdown or exhaustion
    pub async fn supervise(self: Arc<Self>, mut session: Session) {
        loop {
            let failure = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                failure = session.next_failure() => Some(failure),
            };
            let Some(failure) = failure else {
                self.system.send_replace(None);
                session.shutdown().await;
                return;
            };

            warn!(?failure, "Session lost");
            self.system.send_replace(None);
            self.state.set(ConnectionState::Reconnecting);
            session.shutdown().await;
            self.stats.send_modify(|stats| stats.connected_since = None);

            match self.reconnect(failure).await {
                Some(next) => session = next,
                None => return,
            }
        }
    }

    async fn reconnect(&self, failure: SessionFailure) -> Option<Session> {
        let backoff = &self.config.protocol.reconnect;
        let out_of_service = failure.is_out_of_service();
        let mut last_error = failure.into_error();

        for attempt in 1..=backoff.max_attempts {
            let delay = if attempt == 1 && out_of_service {
                self.config.protocol.out_of_service_delay
            } else {
                backoff.jittered_delay(attempt)
            };
            self.stats
                .send_modify(|stats| stats.reconnect_attempts += 1);
            info!(
                attempt,
                max_attempts = backoff.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to Miniserver"
            );

            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                result = self.establish() => result,
            };

            match result {
                Ok(session) => {
                    info!(attempt, "Reconnected to Miniserver");
                    return Some(session);
                }
                Err(e) if e.is_auth_error() => {
                    e.log("Reconnect rejected by Miniserver");
                    last_error = e;
                    break;
                }
                Err(e) => {
                    e.log(&format!("Reconnect attempt {attempt} failed"));
                    self.state.set(ConnectionState::Reconnecting);
                    last_error = e;
                }
            }
        }

        self.give_up(&last_error).await;
        None
    }
}

fn token_api(info: &ApiKeyInfo) -> TokenApi {
    match info.firmware_version() {
        Ok(version) => TokenApi::for_version(&version),
        Err(e) => {
            warn!("Unknown firmware version, assuming JWT support: {e}");
            TokenApi::Jwt
        }
    }
}
