//! Error types for the relay.

use std::time::Duration;

use thiserror::Error;

/// Fixed text reported when a turn carries no message.
pub const MESSAGE_REQUIRED: &str = "Message is required";

/// Relay error type.
///
/// Every variant is recoverable at the connection level: a failing turn is
/// reported to its client and the connection keeps running, except for
/// [`RelayError::Transport`], which ends that connection's task only.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The client sent a frame that cannot be acted on.
    #[error("{0}")]
    Validation(String),

    /// Talking to the generation backend failed.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// The broker did not acknowledge a published turn.
    #[error("Broker publish failed: {0}")]
    BrokerPublish(String),

    /// The inbound broker subscription failed or closed.
    #[error("Broker consume failed: {0}")]
    BrokerConsume(String),

    /// No reply record arrived within the configured idle window.
    #[error("No response received within {}s", .0.as_secs())]
    StreamTimeout(Duration),

    /// The session id was never resolved by the store.
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// Another turn is still streaming for this session.
    #[error("A response is already in progress for this session")]
    SessionBusy(String),

    /// The client connection failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// The validation error for an absent or empty message.
    #[must_use]
    pub fn message_required() -> Self {
        Self::Validation(MESSAGE_REQUIRED.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_facing_messages() {
        assert_eq!(
            RelayError::message_required().to_string(),
            "Message is required"
        );
        assert_eq!(
            RelayError::SessionBusy("abc".into()).to_string(),
            "A response is already in progress for this session"
        );
        assert_eq!(
            RelayError::StreamTimeout(Duration::from_secs(30)).to_string(),
            "No response received within 30s"
        );
    }
}
