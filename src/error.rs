//! Error types for the Loxone websocket client
//!
//! This module provides the error taxonomy of the protocol client together with
//! structured error codes and production-safe messages for logging.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

/// Result type alias for Loxone operations
pub type Result<T> = std::result::Result<T, LoxoneError>;

/// Error types for Loxone protocol operations
#[derive(Error, Debug)]
pub enum LoxoneError {
    /// Socket open/read/write failures
    #[error("Connection error: {0}")]
    Connection(String),

    /// WebSocket protocol errors
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// HTTP client errors
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed frames, truncated payloads or unexpected response shapes
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication errors (401 on token use, rejected credentials)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Non-success code in an LL response
    #[error("Command failed with code {code}: {message}")]
    Command { code: i32, message: String },

    /// Miniserver announced a planned restart
    #[error("Miniserver is out of service")]
    OutOfService,

    /// Service unavailable (HTTP 503 while the Miniserver boots)
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Reconnect attempts exhausted
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// Client has been shut down
    #[error("Client closed: {0}")]
    Closed(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// JSON parsing errors
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors
    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

/// Structured error code for machine-readable error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Connection errors (1000-1099)
    ConnectionTimeout,
    ConnectionLost,
    ConnectionClosed,
    ReconnectExhausted,

    // Authentication errors (1100-1199)
    InvalidCredentials,
    TokenRejected,

    // Configuration errors (1200-1299)
    ConfigurationInvalid,

    // Command errors (1300-1399)
    CommandRejected,

    // Data errors (1400-1499)
    ParsingFailed,
    InvalidInput,

    // Service errors (1600-1699)
    ServiceUnavailable,
    OutOfService,

    // Protocol errors (1700-1799)
    ProtocolViolation,

    // Security errors (1800-1899)
    CryptographicError,

    // Internal errors (1900-1999)
    InternalError,
}

impl ErrorCode {
    /// Get numeric error code
    pub fn as_number(&self) -> u32 {
        match self {
            ErrorCode::ConnectionTimeout => 1001,
            ErrorCode::ConnectionLost => 1002,
            ErrorCode::ConnectionClosed => 1003,
            ErrorCode::ReconnectExhausted => 1004,

            ErrorCode::InvalidCredentials => 1101,
            ErrorCode::TokenRejected => 1102,

            ErrorCode::ConfigurationInvalid => 1201,

            ErrorCode::CommandRejected => 1301,

            ErrorCode::ParsingFailed => 1401,
            ErrorCode::InvalidInput => 1402,

            ErrorCode::ServiceUnavailable => 1601,
            ErrorCode::OutOfService => 1602,

            ErrorCode::ProtocolViolation => 1701,

            ErrorCode::CryptographicError => 1801,

            ErrorCode::InternalError => 1901,
        }
    }

    /// Get error category
    pub fn category(&self) -> &'static str {
        match self.as_number() {
            1000..=1099 => "connection",
            1100..=1199 => "authentication",
            1200..=1299 => "configuration",
            1300..=1399 => "command",
            1400..=1499 => "data",
            1600..=1699 => "service",
            1700..=1799 => "protocol",
            1800..=1899 => "security",
            1900..=1999 => "internal",
            _ => "unknown",
        }
    }
}

/// Error severity levels for logging
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Information only
    Info,
    /// Warning condition, usually recovered internally
    Warning,
    /// Error condition surfaced to the caller
    Error,
    /// Host application must act
    Critical,
}

impl LoxoneError {
    /// Create a connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an authentication error
    pub fn authentication<S: Into<String>>(msg: S) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a crypto error
    pub fn crypto<S: Into<String>>(msg: S) -> Self {
        Self::Crypto(msg.into())
    }

    /// Create a command error from an LL response code
    pub fn command<S: Into<String>>(code: i32, msg: S) -> Self {
        Self::Command {
            code,
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a service unavailable error
    pub fn service_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    /// Create a terminal disconnected error
    pub fn disconnected<S: Into<String>>(msg: S) -> Self {
        Self::Disconnected(msg.into())
    }

    /// Create a closed error
    pub fn closed<S: Into<String>>(msg: S) -> Self {
        Self::Closed(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Map LoxoneError to structured error code
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            LoxoneError::Connection(_) | LoxoneError::WebSocket(_) | LoxoneError::Http(_) => {
                ErrorCode::ConnectionLost
            }
            LoxoneError::Io(_) => ErrorCode::ConnectionLost,
            LoxoneError::Protocol(_) => ErrorCode::ProtocolViolation,
            LoxoneError::Authentication(_) => ErrorCode::TokenRejected,
            LoxoneError::Crypto(_) => ErrorCode::CryptographicError,
            LoxoneError::Command { code, .. } if *code == 401 => ErrorCode::InvalidCredentials,
            LoxoneError::Command { .. } => ErrorCode::CommandRejected,
            LoxoneError::OutOfService => ErrorCode::OutOfService,
            LoxoneError::ServiceUnavailable(_) => ErrorCode::ServiceUnavailable,
            LoxoneError::Timeout(_) => ErrorCode::ConnectionTimeout,
            LoxoneError::Disconnected(_) => ErrorCode::ReconnectExhausted,
            LoxoneError::Closed(_) => ErrorCode::ConnectionClosed,
            LoxoneError::Config(_) => ErrorCode::ConfigurationInvalid,
            LoxoneError::InvalidInput(_) => ErrorCode::InvalidInput,
            LoxoneError::Json(_) => ErrorCode::ParsingFailed,
            LoxoneError::Generic(_) => ErrorCode::InternalError,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            LoxoneError::Disconnected(_) => ErrorSeverity::Critical,
            LoxoneError::Authentication(_) | LoxoneError::Crypto(_) | LoxoneError::Config(_) => {
                ErrorSeverity::Error
            }
            LoxoneError::Command { .. } | LoxoneError::InvalidInput(_) => ErrorSeverity::Error,
            LoxoneError::OutOfService => ErrorSeverity::Info,
            _ => ErrorSeverity::Warning,
        }
    }

    /// Check if error is retryable by the reconnect loop
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LoxoneError::Connection(_)
                | LoxoneError::WebSocket(_)
                | LoxoneError::Timeout(_)
                | LoxoneError::ServiceUnavailable(_)
                | LoxoneError::Http(_)
                | LoxoneError::Io(_)
                | LoxoneError::OutOfService
        )
    }

    /// Check if error indicates authentication issue
    pub fn is_auth_error(&self) -> bool {
        match self {
            LoxoneError::Authentication(_) => true,
            LoxoneError::Command { code, .. } => *code == 401,
            _ => false,
        }
    }

    /// Log at the level matching [`severity`](Self::severity), tagged with the error code
    pub fn log(&self, context: &str) {
        let code = self.to_error_code();
        let message = self.sanitized_message();
        match self.severity() {
            ErrorSeverity::Info => info!(
                code = code.as_number(),
                category = code.category(),
                "{context}: {message}"
            ),
            ErrorSeverity::Warning => warn!(
                code = code.as_number(),
                category = code.category(),
                "{context}: {message}"
            ),
            ErrorSeverity::Error | ErrorSeverity::Critical => error!(
                code = code.as_number(),
                category = code.category(),
                critical = self.severity() == ErrorSeverity::Critical,
                "{context}: {message}"
            ),
        }
    }

    /// Get a production-safe error message that doesn't expose sensitive information
    pub fn sanitized_message(&self) -> String {
        #[cfg(debug_assertions)]
        {
            self.to_string()
        }
        #[cfg(not(debug_assertions))]
        {
            match self {
                LoxoneError::Connection(_) => "Network connection issue".to_string(),
                LoxoneError::WebSocket(_) => "WebSocket connection error".to_string(),
                LoxoneError::Http(_) => "HTTP request failed".to_string(),
                LoxoneError::Protocol(_) => "Protocol violation".to_string(),
                LoxoneError::Authentication(_) => "Authentication failed".to_string(),
                LoxoneError::Crypto(_) => "Cryptographic operation failed".to_string(),
                LoxoneError::Command { code, .. } => format!("Command rejected ({code})"),
                LoxoneError::OutOfService => "Miniserver restarting".to_string(),
                LoxoneError::ServiceUnavailable(_) => {
                    "Service temporarily unavailable".to_string()
                }
                LoxoneError::Timeout(_) => "Operation timed out".to_string(),
                LoxoneError::Disconnected(_) => "Connection lost permanently".to_string(),
                LoxoneError::Closed(_) => "Client closed".to_string(),
                LoxoneError::Config(_) => "Configuration error".to_string(),
                LoxoneError::InvalidInput(_) => "Invalid input provided".to_string(),
                LoxoneError::Json(_) => "Data parsing error".to_string(),
                LoxoneError::Io(_) => "I/O operation failed".to_string(),
                LoxoneError::Generic(_) => "Internal error occurred".to_string(),
            }
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for LoxoneError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        LoxoneError::WebSocket(err.to_string())
    }
}

impl From<openssl::error::ErrorStack> for LoxoneError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        LoxoneError::Crypto(err.to_string())
    }
}

impl From<url::ParseError> for LoxoneError {
    fn from(err: url::ParseError) -> Self {
        LoxoneError::Config(format!("Invalid URL: {err}"))
    }
}
