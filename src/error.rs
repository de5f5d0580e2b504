//! Relay error types.

use thiserror::Error;

/// Text sent to clients for failures that carry no user-facing detail.
const UNEXPECTED: &str = "An unexpected error occurred.";

#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// Broker unreachable at startup, or the broker connection dropped.
    #[error("Broker connection failed: {0}")]
    ConnectionFail(String),

    /// Token malformed, expired or failing signature verification.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Malformed frame. The message is the text sent back to the client.
    #[error("{0}")]
    Validation(String),

    /// Broker rejected or failed a publish.
    #[error("Failed to publish message: {0}")]
    MessagePublish(String),

    /// Broker rejected or failed a topic subscription.
    #[error("Failed to subscribe to topic: {0}")]
    Subscription(String),

    /// Writing to a connection failed, usually because it closed concurrently.
    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl RelayError {
    /// Message placed in the `{ "error": ... }` frame sent to the originating connection.
    pub fn client_message(&self) -> String {
        match self {
            RelayError::Validation(message) => message.clone(),
            RelayError::Authentication(_) => "Invalid token.".to_string(),
            RelayError::MessagePublish(_) => "Failed to publish message.".to_string(),
            RelayError::Subscription(_) => "Failed to subscribe to topic.".to_string(),
            RelayError::ConnectionFail(_) | RelayError::Socket(_) | RelayError::Config(_) => {
                UNEXPECTED.to_string()
            }
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::ConnectionFail(_) => "connection_fail",
            RelayError::Authentication(_) => "authentication",
            RelayError::Validation(_) => "validation",
            RelayError::MessagePublish(_) => "publish",
            RelayError::Subscription(_) => "subscription",
            RelayError::Socket(_) => "socket",
            RelayError::Config(_) => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
