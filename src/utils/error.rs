use thiserror::Error;

use crate::store::StoreError;

/// Represents the errors that can occur in the chat server.
#[derive(Error, Debug)]
pub enum ChatError {
    /// Represents a general connection error.
    ///
    /// This error occurs when the WebSocket handshake or a read fails.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Indicates a failure in serializing or deserializing data.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Represents an error in the server configuration.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Represents an error related to a single connection's outbound queue.
    #[error("Client error: {0}")]
    ClientError(#[from] crate::server::client::ClientError),

    /// A shared or durable store operation failed.
    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),

    /// A required dependency did not become reachable during startup.
    ///
    /// The process refuses to serve when this is returned.
    #[error("Startup error: {0}")]
    StartupError(String),
}

/// Implements conversion from `serde_json::Error` to `ChatError`.
///
/// This allows serialization errors to be automatically converted into
/// `ChatError::SerializationError`.
impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::SerializationError(err.to_string())
    }
}
