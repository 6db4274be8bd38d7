//! Miniserver wire protocol: headers, payloads and command strings

pub mod commands;
pub mod framer;
pub mod header;
pub mod message;

pub use framer::{Frame, MessageFramer};
pub use header::{MessageHeader, MessageType, HEADER_LEN};
pub use message::{Message, TextMessage};
