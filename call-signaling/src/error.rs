//! Error types for call signaling

use thiserror::Error;

/// Result type for signaling operations
pub type Result<T> = std::result::Result<T, SignalError>;

/// Opaque failure reported by a transport client.
///
/// Delivered through the ack of the operation that failed (login, logout,
/// publish or token renewal). One descriptor per attempted action.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Transport error {code}: {message}")]
pub struct TransportError {
    /// Transport-specific error code
    pub code: i32,
    /// Human readable description
    pub message: String,
}

impl TransportError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Signaling error types
#[derive(Error, Debug)]
pub enum SignalError {
    /// Session not initialized
    #[error("Signaling session not initialized - call initialize() first")]
    NotInitialized,

    /// Publish attempted before the owned client finished logging in
    #[error("Transport client is not logged in")]
    NotLoggedIn,

    /// Transport client could not be constructed
    #[error("Failed to create transport client: {0}")]
    ClientCreation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Received payload is not a signaling envelope
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Received envelope uses a protocol version we do not speak
    #[error("Unsupported message version: {0}")]
    UnsupportedVersion(String),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<serde_json::Error> for SignalError {
    fn from(err: serde_json::Error) -> Self {
        SignalError::Serialization(err.to_string())
    }
}
