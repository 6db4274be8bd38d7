//! Typed payloads for each message category

use super::header::MessageType;
use crate::error::{LoxoneError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// Size of one value-state record: 16-byte UUID + f64
pub const VALUE_STATE_LEN: usize = 24;

/// Fixed part of a text-state record: UUID + icon UUID + u32 length
const TEXT_STATE_FIXED_LEN: usize = 36;

/// A decoded message from the Miniserver
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(TextMessage),
    Binary(Vec<u8>),
    ValueStates(HashMap<String, f64>),
    TextStates(HashMap<String, String>),
    DaytimerStates(Vec<u8>),
    OutOfService,
    Keepalive,
    WeatherStates(Vec<u8>),
}

impl Message {
    /// Wire type of this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Text(_) => MessageType::Text,
            Message::Binary(_) => MessageType::Binary,
            Message::ValueStates(_) => MessageType::ValueStates,
            Message::TextStates(_) => MessageType::TextStates,
            Message::DaytimerStates(_) => MessageType::DaytimerStates,
            Message::OutOfService => MessageType::OutOfService,
            Message::Keepalive => MessageType::Keepalive,
            Message::WeatherStates(_) => MessageType::WeatherStates,
        }
    }

    /// Header-only message for `message_type`, if it is one
    pub fn header_only(message_type: MessageType) -> Option<Self> {
        match message_type {
            MessageType::Keepalive => Some(Message::Keepalive),
            MessageType::OutOfService => Some(Message::OutOfService),
            _ => None,
        }
    }

    /// Decode a binary body announced by a header of `message_type`
    pub fn from_binary(message_type: MessageType, body: Vec<u8>) -> Result<Self> {
        Ok(match message_type {
            MessageType::Text => Message::Text(TextMessage::parse(&String::from_utf8_lossy(&body))?),
            MessageType::Binary => Message::Binary(body),
            MessageType::ValueStates => Message::ValueStates(decode_value_states(&body)?),
            MessageType::TextStates => Message::TextStates(decode_text_states(&body)?),
            MessageType::DaytimerStates => Message::DaytimerStates(body),
            MessageType::WeatherStates => Message::WeatherStates(body),
            MessageType::OutOfService => Message::OutOfService,
            MessageType::Keepalive => Message::Keepalive,
        })
    }

    /// Decode a text body announced by a header of `message_type`
    pub fn from_text(message_type: MessageType, body: String) -> Result<Self> {
        match message_type {
            MessageType::Text => Ok(Message::Text(TextMessage::parse(&body)?)),
            // file downloads such as the structure file arrive as text frames
            MessageType::Binary => Ok(Message::Binary(body.into_bytes())),
            other => Err(LoxoneError::protocol(format!(
                "Text frame cannot carry {other:?} payload"
            ))),
        }
    }
}

/// An `LL` reply: `{"LL":{"control":..,"code":..,"value":..}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextMessage {
    pub control: String,
    pub code: i32,
    pub value: Value,
}

impl TextMessage {
    pub fn new(control: impl Into<String>, code: i32, value: Value) -> Self {
        Self {
            control: control.into(),
            code,
            value,
        }
    }

    /// Parse an LL reply. `code` may be spelled `Code` and may be a numeric string.
    pub fn parse(text: &str) -> Result<Self> {
        let parsed: Value = serde_json::from_str(text)
            .map_err(|e| LoxoneError::protocol(format!("Invalid LL reply: {e}")))?;
        let ll = parsed
            .get("LL")
            .and_then(Value::as_object)
            .ok_or_else(|| LoxoneError::protocol("Reply has no LL object"))?;

        let control = ll
            .get("control")
            .and_then(Value::as_str)
            .ok_or_else(|| LoxoneError::protocol("LL reply has no control"))?
            .to_string();

        let code = ll
            .get("code")
            .or_else(|| ll.get("Code"))
            .and_then(|code| match code {
                Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .ok_or_else(|| LoxoneError::protocol(format!("LL reply for {control} has no code")))?;

        let value = match ll.get("value").cloned().unwrap_or(Value::Null) {
            Value::String(s) if looks_like_json(&s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
            other => other,
        };

        Ok(Self {
            control,
            code,
            value,
        })
    }

    /// Serialize back to the LL wire form
    pub fn to_ll_json(&self) -> String {
        json!({
            "LL": {
                "control": self.control,
                "code": self.code.to_string(),
                "value": self.value,
            }
        })
        .to_string()
    }

    pub fn is_success(&self) -> bool {
        self.code == 200
    }

    /// Turn a non-200 reply into [`LoxoneError::Command`]
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(LoxoneError::command(self.code, self.value_string()))
        }
    }

    /// The value rendered as a plain string
    pub fn value_string(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// A field of an object value
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.value.get(name)
    }

    /// A required string field; absence is a protocol error
    pub fn str_field(&self, name: &str) -> Result<&str> {
        self.field(name)
            .and_then(Value::as_str)
            .ok_or_else(|| self.missing_field(name))
    }

    /// A required unsigned field, accepting numbers and numeric strings
    pub fn u64_field(&self, name: &str) -> Result<u64> {
        self.field(name)
            .and_then(|value| match value {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .ok_or_else(|| self.missing_field(name))
    }

    fn missing_field(&self, name: &str) -> LoxoneError {
        LoxoneError::protocol(format!(
            "Reply to {} lacks field '{name}'",
            crate::logging::sanitize_command(&self.control)
        ))
    }
}

fn looks_like_json(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with('{') || s.starts_with('[')
}

/// Decode a table of 24-byte `(uuid, f64)` records
pub fn decode_value_states(body: &[u8]) -> Result<HashMap<String, f64>> {
    if body.len() % VALUE_STATE_LEN != 0 {
        return Err(LoxoneError::protocol(format!(
            "Value state table of {} bytes has a partial record",
            body.len()
        )));
    }

    Ok(body
        .chunks_exact(VALUE_STATE_LEN)
        .map(|record| {
            let (uuid, value) = record.split_at(16);
            (read_uuid(uuid), read_f64(value))
        })
        .collect())
}

/// Encode a value-state table, the inverse of [`decode_value_states`]
pub fn encode_value_states<'a, I>(states: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = (&'a str, f64)>,
{
    let mut body = Vec::new();
    for (uuid, value) in states {
        let uuid = Uuid::parse_str(uuid)
            .map_err(|e| LoxoneError::invalid_input(format!("Invalid UUID {uuid}: {e}")))?;
        body.extend_from_slice(&uuid.to_bytes_le());
        body.extend_from_slice(&value.to_le_bytes());
    }
    Ok(body)
}

/// Decode a table of text-state records, each padded to a 4-byte boundary
pub fn decode_text_states(body: &[u8]) -> Result<HashMap<String, String>> {
    let mut states = HashMap::new();
    let mut offset = 0;

    while offset < body.len() {
        let fixed = body
            .get(offset..offset + TEXT_STATE_FIXED_LEN)
            .ok_or_else(|| truncated_text_state(offset, body.len()))?;
        let uuid = read_uuid(&fixed[..16]);
        let text_len = u32::from_le_bytes([fixed[32], fixed[33], fixed[34], fixed[35]]) as usize;

        let text_start = offset + TEXT_STATE_FIXED_LEN;
        let text = body
            .get(text_start..text_start + text_len)
            .ok_or_else(|| truncated_text_state(offset, body.len()))?;

        let text = String::from_utf8_lossy(text);
        states.insert(uuid, text.trim_end_matches('\0').to_string());

        offset += (TEXT_STATE_FIXED_LEN + text_len).next_multiple_of(4);
    }

    Ok(states)
}

fn truncated_text_state(offset: usize, len: usize) -> LoxoneError {
    LoxoneError::protocol(format!(
        "Text state record at offset {offset} exceeds table of {len} bytes"
    ))
}

fn read_uuid(bytes: &[u8]) -> String {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&bytes[..16]);
    Uuid::from_bytes_le(raw).hyphenated().to_string()
}

fn read_f64(bytes: &[u8]) -> f64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    f64::from_le_bytes(raw)
}

/// Convert a canonical UUID to the `8-4-4-16` form used in the structure file
pub fn to_structure_uuid(canonical: &str) -> String {
    match canonical.rfind('-') {
        Some(idx) if canonical.matches('-').count() == 4 => {
            format!("{}{}", &canonical[..idx], &canonical[idx + 1..])
        }
        _ => canonical.to_string(),
    }
}
