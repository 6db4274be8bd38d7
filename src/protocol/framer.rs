//! Pairs header frames with their body frames

use super::header::{MessageHeader, HEADER_LEN};
use super::message::Message;
use crate::error::{LoxoneError, Result};
use tracing::trace;

/// A websocket frame as seen by the protocol layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Stateful decoder turning a frame stream into [`Message`]s.
///
/// Every message starts with an 8-byte binary header frame. Bodies follow in
/// the next frame except for header-only types.
#[derive(Debug, Default)]
pub struct MessageFramer {
    pending: Option<MessageHeader>,
}

impl MessageFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame; returns a message once a header/body pair completes.
    ///
    /// On error the framer resynchronizes on the next header frame.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        let result = self.push_inner(frame);
        if result.is_err() {
            self.pending = None;
        }
        result
    }

    fn push_inner(&mut self, frame: Frame) -> Result<Option<Message>> {
        match (self.pending.take(), frame) {
            (_, Frame::Close) => Ok(None),
            (Some(header), Frame::Binary(body)) if !header.estimated => {
                trace!(kind = ?header.message_type, len = body.len(), "Body frame");
                Message::from_binary(header.message_type, body).map(Some)
            }
            (Some(header), Frame::Text(body)) if !header.estimated => {
                trace!(kind = ?header.message_type, len = body.len(), "Text body frame");
                Message::from_text(header.message_type, body).map(Some)
            }
            (_, Frame::Binary(bytes)) => {
                if bytes.len() != HEADER_LEN {
                    return Err(LoxoneError::protocol(format!(
                        "Expected {HEADER_LEN}-byte header frame, got {} bytes",
                        bytes.len()
                    )));
                }
                let header = MessageHeader::decode(&bytes)?;

                if header.estimated {
                    // the exact header follows
                    self.pending = Some(header);
                    return Ok(None);
                }
                if !header.message_type.has_body() {
                    return Ok(Message::header_only(header.message_type));
                }
                self.pending = Some(header);
                Ok(None)
            }
            (_, Frame::Text(text)) => Err(LoxoneError::protocol(format!(
                "Text frame of {} bytes without a preceding header",
                text.len()
            ))),
        }
    }
}
