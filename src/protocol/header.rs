//! 8-byte binary message header
//!
//! ```text
//! [0x03][type:u8][flags:u8][reserved:u8][length:u32 LE]
//! ```
//!
//! Bit 7 of `flags` marks an estimated length; the exact header follows.

use crate::error::{LoxoneError, Result};
use serde::{Deserialize, Serialize};

/// Header length in bytes
pub const HEADER_LEN: usize = 8;

const HEADER_MAGIC: u8 = 0x03;
const ESTIMATED_FLAG: u8 = 0x80;

/// Message type identifier carried in byte 1 of the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Text = 0,
    Binary = 1,
    ValueStates = 2,
    TextStates = 3,
    DaytimerStates = 4,
    OutOfService = 5,
    Keepalive = 6,
    WeatherStates = 7,
}

impl MessageType {
    /// Header-only messages have no body frame
    pub fn has_body(self) -> bool {
        !matches!(self, MessageType::OutOfService | MessageType::Keepalive)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = LoxoneError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => MessageType::Text,
            1 => MessageType::Binary,
            2 => MessageType::ValueStates,
            3 => MessageType::TextStates,
            4 => MessageType::DaytimerStates,
            5 => MessageType::OutOfService,
            6 => MessageType::Keepalive,
            7 => MessageType::WeatherStates,
            other => {
                return Err(LoxoneError::protocol(format!(
                    "Unknown message type {other}"
                )))
            }
        })
    }
}

/// Decoded message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub estimated: bool,
    /// Payload length, informational only
    pub length: u32,
}

impl MessageHeader {
    /// Create an exact header
    pub fn new(message_type: MessageType, length: u32) -> Self {
        Self {
            message_type,
            estimated: false,
            length,
        }
    }

    /// Decode the first 8 bytes of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(LoxoneError::protocol(format!(
                "Header truncated: {} of {HEADER_LEN} bytes",
                bytes.len()
            )));
        }
        if bytes[0] != HEADER_MAGIC {
            return Err(LoxoneError::protocol(format!(
                "Bad header magic 0x{:02x}",
                bytes[0]
            )));
        }

        Ok(Self {
            message_type: MessageType::try_from(bytes[1])?,
            estimated: bytes[2] & ESTIMATED_FLAG != 0,
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }

    /// Encode to the wire layout
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let length = self.length.to_le_bytes();
        let flags = if self.estimated { ESTIMATED_FLAG } else { 0 };
        [
            HEADER_MAGIC,
            self.message_type as u8,
            flags,
            0,
            length[0],
            length[1],
            length[2],
            length[3],
        ]
    }
}
