//! Correlates replies with pending requests and routes everything else

use crate::crypto::SessionKeys;
use crate::error::{LoxoneError, Result};
use crate::logging::sanitize_command;
use crate::protocol::{commands, Message, TextMessage};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

static SALT_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:salt/[0-9a-fA-F]+/|nextSalt/[0-9a-fA-F]+/[0-9a-fA-F]+/)")
        .expect("salt prefix pattern is valid")
});

/// A sent command waiting for its reply
#[derive(Debug)]
pub struct PendingRequest {
    command: String,
    reply: oneshot::Sender<Result<TextMessage>>,
}

impl PendingRequest {
    pub fn new(command: impl Into<String>, reply: oneshot::Sender<Result<TextMessage>>) -> Self {
        Self {
            command: command.into(),
            reply,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

/// What the dispatcher did with a message
#[derive(Debug, PartialEq)]
pub enum Routed {
    /// Delivered to the waiting requester
    Resolved,
    /// Handshake or token plumbing nobody waited for
    Consumed,
    Keepalive,
    OutOfService,
    /// Deliver to subscribers
    Forward(Message),
}

/// Whether a reply `control` answers `command`.
///
/// Leading slashes are ignored, and the Miniserver may echo `jdev/...` as `dev/...`.
pub fn control_matches(command: &str, control: &str) -> bool {
    let command = command.trim_start_matches('/');
    let control = control.trim_start_matches('/');
    command == control
        || command
            .strip_prefix('j')
            .is_some_and(|rest| rest.starts_with("dev/") && rest == control)
}

/// Remove the `salt/<x>/` or `nextSalt/<x>/<y>/` prefix of a decrypted command
pub fn strip_salt_prefix(plaintext: &str) -> &str {
    match SALT_PREFIX.find(plaintext) {
        Some(prefix) => &plaintext[prefix.end()..],
        None => plaintext,
    }
}

/// Pending-request table owned by the receive loop
#[derive(Debug)]
pub struct Dispatcher {
    pending: VecDeque<PendingRequest>,
    keys: Option<Arc<SessionKeys>>,
}

impl Dispatcher {
    pub fn new(keys: Option<Arc<SessionKeys>>) -> Self {
        Self {
            pending: VecDeque::new(),
            keys,
        }
    }

    pub fn register(&mut self, request: PendingRequest) {
        trace!(command = %sanitize_command(&request.command), "Registered pending request");
        self.pending.push_back(request);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Route one decoded message
    pub fn dispatch(&mut self, message: Message) -> Routed {
        match message {
            Message::Text(text) => self.dispatch_text(text),
            Message::Keepalive => Routed::Keepalive,
            Message::OutOfService => Routed::OutOfService,
            other => Routed::Forward(other),
        }
    }

    fn dispatch_text(&mut self, mut text: TextMessage) -> Routed {
        text.control = self.decrypt_control(&text.control);

        self.pending.retain(|pending| !pending.reply.is_closed());
        let position = self
            .pending
            .iter()
            .position(|pending| control_matches(&pending.command, &text.control));

        if let Some(pending) = position.and_then(|index| self.pending.remove(index)) {
            trace!(
                control = %sanitize_command(&text.control),
                code = text.code,
                "Resolved pending request"
            );
            // the requester may have timed out in the meantime
            let _ = pending.reply.send(Ok(text));
            return Routed::Resolved;
        }

        if commands::is_plumbing(&text.control) {
            debug!(
                control = %sanitize_command(&text.control),
                code = text.code,
                "Unmatched plumbing reply consumed"
            );
            return Routed::Consumed;
        }
        Routed::Forward(Message::Text(text))
    }

    fn decrypt_control(&self, control: &str) -> String {
        let trimmed = control.trim_start_matches('/');
        let is_envelope = trimmed.starts_with(commands::ENCRYPTED_PREFIX)
            || trimmed.starts_with(&commands::ENCRYPTED_PREFIX[1..]);
        let Some(keys) = self.keys.as_ref().filter(|_| is_envelope) else {
            return control.to_string();
        };

        let envelope = trimmed.strip_prefix('j').unwrap_or(trimmed);
        let envelope = format!("j{envelope}");
        match keys.open(&envelope) {
            Ok(plaintext) => strip_salt_prefix(&plaintext).to_string(),
            Err(e) => {
                warn!("Could not decrypt echoed control: {e}");
                control.to_string()
            }
        }
    }

    /// Fail every pending request, used when the session ends
    pub fn fail_all(&mut self, reason: &str) {
        for pending in self.pending.drain(..) {
            let _ = pending
                .reply
                .send(Err(LoxoneError::connection(reason.to_string())));
        }
    }
}
