//! Error types for the MQTT session core
//!
//! `MqttError` is the single client-facing error. It is `Clone` so that one
//! connection failure can be stored on every outstanding token and handed to
//! every waiter.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for session, token and connection operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MqttError {
    #[error("Client is not connected")]
    NotConnected,

    #[error("Connect already in progress")]
    ConnectInProgress,

    #[error("Client is already connected")]
    AlreadyConnected,

    #[error("Client is currently disconnecting")]
    Disconnecting,

    #[error("Client is already disconnected")]
    AlreadyDisconnected,

    #[error("Disconnect is not allowed from a callback")]
    DisconnectProhibited,

    #[error("Client has been closed")]
    ClientClosed,

    #[error("No message ids available")]
    NoMessageIdsAvailable,

    #[error("Too many publishes in progress (max in flight {max})")]
    MaxInFlight { max: u16 },

    #[error("Disconnected publish buffer is full (size {size})")]
    DisconnectedBufferFull { size: usize },

    #[error("Timed out waiting for a response from the server")]
    ClientTimeout,

    #[error("Timed out writing to the server")]
    WriteTimeout,

    #[error("Token already in use")]
    TokenInUse,

    #[error("Unexpected error: {message}")]
    UnexpectedError { message: String },

    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("Invalid message: {message}")]
    InvalidMessage { message: String },

    #[error("Bad user name or password")]
    FailedAuthentication,

    #[error("Not authorized to connect")]
    NotAuthorized,

    #[error("Connection refused by server (return code {code})")]
    ConnectionRefused { code: u8 },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Message handler failed: {0}")]
    MessageHandler(String),
}

impl MqttError {
    /// Build the refusal error for a non-zero CONNACK return code
    pub fn from_connack_code(code: u8) -> Self {
        match code {
            4 => Self::FailedAuthentication,
            5 => Self::NotAuthorized,
            code => Self::ConnectionRefused { code },
        }
    }

    /// Whether this failure belongs to the security subtype
    pub fn is_security(&self) -> bool {
        matches!(self, Self::FailedAuthentication | Self::NotAuthorized)
    }

    /// Create an unexpected error
    pub fn unexpected<S: Into<String>>(message: S) -> Self {
        Self::UnexpectedError {
            message: sanitize_error_message(&message.into()),
        }
    }

    /// Create a connection-lost error
    pub fn connection_lost<S: Into<String>>(message: S) -> Self {
        Self::ConnectionLost {
            message: sanitize_error_message(&message.into()),
        }
    }

    /// Create an invalid message error
    pub fn invalid_message<S: Into<String>>(message: S) -> Self {
        Self::InvalidMessage {
            message: sanitize_error_message(&message.into()),
        }
    }

    /// Create a message handler error
    pub fn message_handler<S: Into<String>>(message: S) -> Self {
        Self::MessageHandler(sanitize_error_message(&message.into()))
    }
}

impl From<std::io::Error> for MqttError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::InvalidData => Self::invalid_message(err.to_string()),
            _ => Self::connection_lost(err.to_string()),
        }
    }
}

impl From<crate::persistence::PersistenceError> for MqttError {
    fn from(err: crate::persistence::PersistenceError) -> Self {
        Self::Persistence(sanitize_error_message(&err.to_string()))
    }
}

impl From<crate::config::ConfigError> for MqttError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config(sanitize_error_message(&err.to_string()))
    }
}

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|passwd|token|secret)[=:]\s*\S+").ok());

static URI_USERINFO_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)([a-z][a-z0-9+.-]*://)[^/@\s]+@").ok());

const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Redact credentials and truncate long messages before they are logged or
/// stored on a token
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(re) = SECRET_PATTERN.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}=***").to_string();
    }

    // user:pass@host in broker URIs
    if let Some(re) = URI_USERINFO_PATTERN.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}***@").to_string();
    }

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_ERROR_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for client operations
pub type MqttResult<T> = Result<T, MqttError>;
