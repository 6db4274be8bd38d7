//! One connection lifetime: transport, key exchange and the task group
//!
//! A [`Session`] is created per connect attempt and discarded when the
//! connection ends. Its loops report failures to the supervisor over an
//! `mpsc` channel; the supervisor then shuts the session down exactly once.

use super::command_queue::{CommandSender, DrainLoop, Lane, UserLane};
use super::connection::ConnectionStats;
use super::dispatcher::{Dispatcher, PendingRequest, Routed};
use super::keepalive::run_keepalive_loop;
use super::transport::{Connector, FrameSource};
use super::CommandChannel;
use crate::auth::TokenManager;
use crate::config::ProtocolConfig;
use crate::crypto::{CommandCipher, SessionKeys};
use crate::error::{LoxoneError, Result};
use crate::protocol::{Frame, Message, MessageFramer};
use chrono::Utc;
use openssl::pkey::Public;
use openssl::rsa::Rsa;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Why a session ended on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFailure {
    TransportClosed(String),
    /// Planned Miniserver restart
    OutOfService,
    KeepaliveTimeout,
    TokenInvalid(String),
    ProtocolErrors(u32),
}

impl SessionFailure {
    pub fn is_out_of_service(&self) -> bool {
        matches!(self, SessionFailure::OutOfService)
    }

    pub fn into_error(self) -> LoxoneError {
        match self {
            SessionFailure::TransportClosed(reason) => LoxoneError::connection(reason),
            SessionFailure::OutOfService => LoxoneError::OutOfService,
            SessionFailure::KeepaliveTimeout => {
                LoxoneError::timeout("Keepalive not answered")
            }
            SessionFailure::TokenInvalid(reason) => LoxoneError::authentication(reason),
            SessionFailure::ProtocolErrors(count) => {
                LoxoneError::protocol(format!("{count} consecutive protocol errors"))
            }
        }
    }
}

/// Cancellation token plus the handles it governs.
///
/// Consumed by [`TaskGroup::shutdown`], so a group cannot be cancelled twice.
pub struct TaskGroup {
    cancel: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
    stats: Arc<watch::Sender<ConnectionStats>>,
}

impl TaskGroup {
    pub fn new(stats: Arc<watch::Sender<ConnectionStats>>) -> Self {
        stats.send_modify(|stats| stats.task_groups_started += 1);
        Self {
            cancel: CancellationToken::new(),
            handles: Vec::new(),
            stats,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "Spawning session task");
        self.handles.push((name, tokio::spawn(task)));
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    /// Cancel every task and wait up to `grace` for each before aborting it
    pub async fn shutdown(mut self, grace: Duration) {
        self.cancel.cancel();
        for (name, mut handle) in std::mem::take(&mut self.handles) {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => warn!(task = name, "Session task panicked"),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(task = name, "Session task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        self.stats
            .send_modify(|stats| stats.task_groups_cancelled += 1);
    }
}

impl Drop for TaskGroup {
    // a session dropped mid-connect still stops its tasks
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Everything a session shares with the client that outlives it
#[derive(Clone)]
pub struct SessionContext {
    pub protocol: ProtocolConfig,
    pub events: broadcast::Sender<Message>,
    pub stats: Arc<watch::Sender<ConnectionStats>>,
    pub user_lane: UserLane,
    /// Client-wide shutdown; set only by an explicit close
    pub shutdown: CancellationToken,
}

struct ReceiveLoop {
    source: Box<dyn FrameSource>,
    framer: MessageFramer,
    dispatcher: Dispatcher,
    registrations: mpsc::UnboundedReceiver<PendingRequest>,
    events: broadcast::Sender<Message>,
    keepalive_seen: watch::Sender<u64>,
    stats: Arc<watch::Sender<ConnectionStats>>,
    max_protocol_errors: u32,
}

impl ReceiveLoop {
    async fn run(mut self, cancel: CancellationToken) -> Option<SessionFailure> {
        let mut registrations_open = true;
        let mut consecutive_errors = 0u32;

        let failure = loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break None,
                request = self.registrations.recv(), if registrations_open => {
                    match request {
                        Some(request) => self.dispatcher.register(request),
                        None => registrations_open = false,
                    }
                    continue;
                }
                frame = self.source.next_frame() => frame,
            };

            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => break Some(SessionFailure::TransportClosed(e.to_string())),
                None => break Some(SessionFailure::TransportClosed("Transport ended".into())),
            };
            if matches!(frame, Frame::Close) {
                break Some(SessionFailure::TransportClosed("Closed by Miniserver".into()));
            }

            let message = match self.framer.push(frame) {
                Ok(Some(message)) => {
                    consecutive_errors = 0;
                    message
                }
                Ok(None) => continue,
                Err(e) => {
                    consecutive_errors += 1;
                    self.stats.send_modify(|stats| stats.protocol_errors += 1);
                    warn!(consecutive_errors, "Dropping malformed message: {e}");
                    if consecutive_errors > self.max_protocol_errors {
                        break Some(SessionFailure::ProtocolErrors(consecutive_errors));
                    }
                    continue;
                }
            };

            while let Ok(request) = self.registrations.try_recv() {
                self.dispatcher.register(request);
            }
            if let Some(failure) = self.route(message) {
                break Some(failure);
            }
        };

        while let Ok(request) = self.registrations.try_recv() {
            self.dispatcher.register(request);
        }
        self.dispatcher.fail_all("Session ended before the reply arrived");
        info!("Receive loop stopped");
        failure
    }

    fn route(&mut self, message: Message) -> Option<SessionFailure> {
        self.stats.send_modify(|stats| {
            stats.messages_received += 1;
            stats.last_message = Some(Utc::now());
        });

        match self.dispatcher.dispatch(message) {
            Routed::Resolved | Routed::Consumed => None,
            Routed::Keepalive => {
                self.keepalive_seen.send_modify(|count| *count += 1);
                None
            }
            Routed::OutOfService => {
                info!("Miniserver announced a restart");
                Some(SessionFailure::OutOfService)
            }
            Routed::Forward(message) => {
                if matches!(message, Message::ValueStates(_) | Message::TextStates(_)) {
                    self.stats.send_modify(|stats| stats.state_updates += 1);
                }
                // no subscribers is not an error
                let _ = self.events.send(message);
                None
            }
        }
    }
}

/// A live connection and its background tasks
pub struct Session {
    group: TaskGroup,
    failures: mpsc::UnboundedReceiver<SessionFailure>,
    failure_tx: mpsc::UnboundedSender<SessionFailure>,
    system: CommandSender,
    user_open: watch::Sender<bool>,
    keepalive_seen: watch::Receiver<u64>,
    protocol: ProtocolConfig,
}

impl Session {
    /// Open the transport, start the receive and drain loops and exchange keys
    pub async fn open(
        connector: &dyn Connector,
        url: &Url,
        public_key: &Rsa<Public>,
        ctx: &SessionContext,
    ) -> Result<Self> {
        let protocol = &ctx.protocol;
        let keys = Arc::new(SessionKeys::generate());
        let key_exchange = keys.key_exchange_command(public_key)?;

        info!(%url, "Opening websocket");
        let (sink, source) = tokio::time::timeout(protocol.connect_timeout, connector.connect(url))
            .await
            .map_err(|_| {
                LoxoneError::timeout(format!(
                    "Websocket connect to {url} exceeded {:?}",
                    protocol.connect_timeout
                ))
            })??;

        let (system_tx, system_rx) = mpsc::channel(protocol.command_queue_capacity);
        let (registration_tx, registration_rx) = mpsc::unbounded_channel();
        let (failure_tx, failures) = mpsc::unbounded_channel();
        let (user_open, user_open_rx) = watch::channel(false);
        let (keepalive_tx, keepalive_seen) = watch::channel(0u64);

        let system = CommandSender::new(
            Lane::System,
            system_tx,
            protocol.submit_timeout,
            protocol.request_timeout,
            ctx.shutdown.clone(),
        );

        let mut session = Self {
            group: TaskGroup::new(ctx.stats.clone()),
            failures,
            failure_tx,
            system,
            user_open,
            keepalive_seen,
            protocol: protocol.clone(),
        };

        let receive = ReceiveLoop {
            source,
            framer: MessageFramer::new(),
            dispatcher: Dispatcher::new(Some(keys.clone())),
            registrations: registration_rx,
            events: ctx.events.clone(),
            keepalive_seen: keepalive_tx,
            stats: ctx.stats.clone(),
            max_protocol_errors: protocol.max_protocol_errors,
        };
        let cancel = session.group.token();
        session.spawn_task("receive", receive.run(cancel));

        let drain = DrainLoop {
            system: system_rx,
            user: ctx.user_lane.clone(),
            user_open: user_open_rx,
            sink,
            cipher: CommandCipher::new(keys, protocol),
            registrations: registration_tx,
            drain_timeout: protocol.drain_timeout,
        };
        let cancel = session.group.token();
        session.spawn_task("drain", drain.run(cancel, ctx.shutdown.clone()));

        if let Err(e) = session.exchange_keys(&key_exchange).await {
            session.shutdown().await;
            return Err(e);
        }
        Ok(session)
    }

    async fn exchange_keys(&self, command: &str) -> Result<()> {
        let reply = self.system.request(command, false).await?;
        if !reply.is_success() {
            return Err(LoxoneError::crypto(format!(
                "Key exchange rejected with code {}",
                reply.code
            )));
        }
        debug!("Session key accepted");
        Ok(())
    }

    fn spawn_task<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Option<SessionFailure>> + Send + 'static,
    {
        let failures = self.failure_tx.clone();
        self.group.spawn(name, async move {
            if let Some(failure) = task.await {
                warn!(task = name, ?failure, "Session task failed");
                let _ = failures.send(failure);
            }
        });
    }

    /// Request/response channel over the system lane
    pub fn system_channel(&self) -> CommandSender {
        self.system.clone()
    }

    /// Let queued caller commands through
    pub fn open_user_lane(&self) {
        self.user_open.send_replace(true);
    }

    pub fn spawn_keepalive(&mut self) {
        let task = run_keepalive_loop(
            self.system.clone(),
            self.keepalive_seen.clone(),
            self.protocol.keepalive_period,
            self.protocol.keepalive_timeout,
            self.protocol.max_missed_keepalives,
            self.group.token(),
        );
        self.spawn_task("keepalive", task);
    }

    pub fn spawn_refresh(&mut self, tokens: TokenManager) {
        let cancel = self.group.token();
        self.spawn_task("token-refresh", async move {
            match tokens.run_refresh_loop(cancel).await {
                Ok(()) => None,
                Err(e) => Some(SessionFailure::TokenInvalid(e.to_string())),
            }
        });
    }

    /// Wait for the first failure reported by a session task
    pub async fn next_failure(&mut self) -> SessionFailure {
        match self.failures.recv().await {
            Some(failure) => failure,
            // unreachable while `self` holds a sender
            None => SessionFailure::TransportClosed("Session tasks gone".into()),
        }
    }

    /// Cancel the task group and wait for it
    pub async fn shutdown(self) {
        self.user_open.send_replace(false);
        let grace = self.protocol.drain_timeout + Duration::from_secs(1);
        let tasks = self.group.len();
        self.group.shutdown(grace).await;
        debug!(tasks, "Session shut down");
    }
}
