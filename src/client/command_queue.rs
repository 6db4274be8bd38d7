//! Two-lane outgoing command queue and the drain loop that writes it
//!
//! The system lane carries handshake, token and keepalive traffic and lives
//! for one session. The user lane lives as long as the client, so caller
//! commands queued during a reconnect are sent by the next session. The drain
//! loop only reads the user lane once the session is authenticated.

use super::dispatcher::PendingRequest;
use super::session::SessionFailure;
use super::transport::FrameSink;
use super::CommandChannel;
use crate::crypto::CommandCipher;
use crate::error::{LoxoneError, Result};
use crate::logging::sanitize_command;
use crate::protocol::{Frame, TextMessage};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Which lane a command travels in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    System,
    User,
}

/// A command waiting to be written
#[derive(Debug)]
pub struct QueuedCommand {
    pub command: String,
    pub encrypted: bool,
    /// Present when the caller waits for the reply
    pub reply: Option<oneshot::Sender<Result<TextMessage>>>,
    pub queued_at: Instant,
}

impl QueuedCommand {
    pub fn new(command: impl Into<String>, encrypted: bool) -> Self {
        Self {
            command: command.into(),
            encrypted,
            reply: None,
            queued_at: Instant::now(),
        }
    }

    pub fn expecting_reply(mut self, reply: oneshot::Sender<Result<TextMessage>>) -> Self {
        self.reply = Some(reply);
        self
    }
}

/// Receiving end of the user lane, shared by consecutive sessions
pub type UserLane = Arc<Mutex<mpsc::Receiver<QueuedCommand>>>;

/// Submission handle for one lane
#[derive(Debug, Clone)]
pub struct CommandSender {
    lane: Lane,
    tx: mpsc::Sender<QueuedCommand>,
    submit_timeout: Duration,
    request_timeout: Duration,
    closed: CancellationToken,
    disconnected: Option<watch::Receiver<Option<String>>>,
}

impl CommandSender {
    pub fn new(
        lane: Lane,
        tx: mpsc::Sender<QueuedCommand>,
        submit_timeout: Duration,
        request_timeout: Duration,
        closed: CancellationToken,
    ) -> Self {
        Self {
            lane,
            tx,
            submit_timeout,
            request_timeout,
            closed,
            disconnected: None,
        }
    }

    /// Fail submissions with `Disconnected` while `reason` holds a value
    pub fn with_disconnect_reason(mut self, reason: watch::Receiver<Option<String>>) -> Self {
        self.disconnected = Some(reason);
        self
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    /// Queue a command; fails with `Timeout` when the queue stays full
    pub async fn submit(&self, command: QueuedCommand) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(LoxoneError::closed("Client is shut down"));
        }
        if let Some(reason) = self.disconnected.as_ref().and_then(|rx| rx.borrow().clone()) {
            return Err(LoxoneError::disconnected(reason));
        }
        match tokio::time::timeout(self.submit_timeout, self.tx.send(command)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(LoxoneError::closed("Command queue is closed")),
            Err(_) => Err(LoxoneError::timeout(format!(
                "Command queue full for {:?}",
                self.submit_timeout
            ))),
        }
    }

    /// Queue a command without waiting for a reply
    pub async fn send(&self, command: &str, encrypted: bool) -> Result<()> {
        self.submit(QueuedCommand::new(command, encrypted)).await
    }
}

#[async_trait]
impl CommandChannel for CommandSender {
    async fn request(&self, command: &str, encrypted: bool) -> Result<TextMessage> {
        let (tx, rx) = oneshot::channel();
        self.submit(QueuedCommand::new(command, encrypted).expecting_reply(tx))
            .await?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(LoxoneError::connection(format!(
                "Session ended before {} was answered",
                sanitize_command(command)
            ))),
            Err(_) => Err(LoxoneError::timeout(format!(
                "No reply to {} within {:?}",
                sanitize_command(command),
                self.request_timeout
            ))),
        }
    }
}

/// Single writer of the transport.
///
/// Registers the pending request with the receive loop before the command is
/// written, then applies the envelope and sends. Salt accounting happens here
/// and nowhere else.
pub struct DrainLoop {
    pub system: mpsc::Receiver<QueuedCommand>,
    pub user: UserLane,
    pub user_open: watch::Receiver<bool>,
    pub sink: Box<dyn FrameSink>,
    pub cipher: CommandCipher,
    pub registrations: mpsc::UnboundedSender<PendingRequest>,
    pub drain_timeout: Duration,
}

impl DrainLoop {
    /// Run until cancelled or the transport fails.
    ///
    /// When `shutdown` is set at cancellation time, queued commands are
    /// flushed within `drain_timeout` before the socket is closed.
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        shutdown: CancellationToken,
    ) -> Option<SessionFailure> {
        let lane = self.user.clone();
        let mut user = tokio::select! {
            _ = cancel.cancelled() => return None,
            guard = lane.lock() => guard,
        };

        let failure = loop {
            let user_open = *self.user_open.borrow();
            let (lane, command) = tokio::select! {
                biased;
                _ = cancel.cancelled() => break None,
                command = self.system.recv() => match command {
                    Some(command) => (Lane::System, command),
                    None => break None,
                },
                command = user.recv(), if user_open => match command {
                    Some(command) => (Lane::User, command),
                    None => break None,
                },
                changed = self.user_open.changed(), if !user_open => {
                    if changed.is_err() {
                        break None;
                    }
                    continue;
                }
            };

            if let Err(e) = self.write(lane, command).await {
                warn!("Failed to write command: {e}");
                break Some(SessionFailure::TransportClosed(e.to_string()));
            }
        };

        if failure.is_none() && shutdown.is_cancelled() {
            let user_open = *self.user_open.borrow();
            let drain_timeout = self.drain_timeout;
            let flush = async {
                while let Ok(command) = self.system.try_recv() {
                    self.write(Lane::System, command).await?;
                }
                while user_open {
                    let Ok(command) = user.try_recv() else { break };
                    self.write(Lane::User, command).await?;
                }
                Ok::<_, LoxoneError>(())
            };
            match tokio::time::timeout(drain_timeout, flush).await {
                Ok(Ok(())) => debug!("Queued commands flushed"),
                Ok(Err(e)) => warn!("Flushing queued commands failed: {e}"),
                Err(_) => warn!("Flushing queued commands timed out"),
            }
        }

        if let Err(e) = self.sink.close().await {
            debug!("Closing transport: {e}");
        }
        info!("Drain loop stopped");
        failure
    }

    async fn write(&mut self, lane: Lane, command: QueuedCommand) -> Result<()> {
        let QueuedCommand {
            command,
            encrypted,
            reply,
            queued_at,
        } = command;

        if reply.as_ref().is_some_and(|reply| reply.is_closed()) {
            debug!(
                ?lane,
                command = %sanitize_command(&command),
                "Caller stopped waiting, command dropped"
            );
            return Ok(());
        }

        let wire = if encrypted {
            match self.cipher.encrypt_command(&command) {
                Ok(wire) => wire,
                Err(e) => {
                    warn!(command = %sanitize_command(&command), "Could not encrypt command: {e}");
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(e));
                    }
                    return Ok(());
                }
            }
        } else {
            command.clone()
        };

        trace!(
            ?lane,
            encrypted,
            waited_ms = queued_at.elapsed().as_millis() as u64,
            command = %sanitize_command(&command),
            "Sending command"
        );

        if let Some(reply) = reply {
            // a closed registration channel means the receive loop is gone;
            // dropping the reply sender reports that to the caller
            let _ = self.registrations.send(PendingRequest::new(command, reply));
        }

        self.sink.send(Frame::Text(wire)).await
    }
}
