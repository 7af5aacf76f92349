//! Client/server frames exchanged over a chat connection.
//!
//! Frames are JSON objects. The client sends one init frame carrying an
//! optional `session_id`, then one frame per turn carrying `message`. The
//! server answers with [`ServerEvent`]s discriminated by their `type` field.
//!
//! # Example
//!
//! ```rust
//! use chat_relay::protocol::ServerEvent;
//!
//! let event = ServerEvent::chunk("Hel");
//! let json = serde_json::to_string(&event).unwrap();
//! assert_eq!(json, r#"{"type":"chunk","role":"assistant","content":"Hel"}"#);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::llm::{Role, Turn};

/// A frame received from the client.
///
/// Both fields are optional on the wire: the init frame only looks at
/// `session_id` and turn frames only look at `message`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Session to resume (init frame only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// User message text (turn frames only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ClientFrame {
    /// Build an init frame.
    #[must_use]
    pub fn init(session_id: Option<&str>) -> Self {
        Self {
            session_id: session_id.map(ToString::to_string),
            message: None,
        }
    }

    /// Build a turn frame.
    #[must_use]
    pub fn turn(message: impl Into<String>) -> Self {
        Self {
            session_id: None,
            message: Some(message.into()),
        }
    }

    /// Parse a text frame. Anything that is not a JSON object is rejected.
    pub fn parse(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text)
            .map_err(|e| RelayError::Validation(format!("Invalid frame: {e}")))
    }

    /// The message text, if present and non-empty.
    #[must_use]
    pub fn message_text(&self) -> Option<&str> {
        self.message.as_deref().filter(|m| !m.is_empty())
    }

    /// The session id, if present and non-empty.
    #[must_use]
    pub fn requested_session(&self) -> Option<&str> {
        self.session_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Events sent from the server to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// The resolved session id; always the first event of a connection.
    Session {
        /// Session identifier to reconnect with.
        session_id: String,
    },
    /// One replayed turn of the session transcript.
    History {
        /// Author of the turn.
        sender: Role,
        /// Turn content.
        text: String,
    },
    /// A turn was accepted and generation is starting.
    Start,
    /// An incremental fragment of the assistant reply.
    Chunk {
        /// Always [`Role::Assistant`].
        role: Role,
        /// The fragment.
        content: String,
    },
    /// The turn completed.
    End,
    /// Validation or backend failure.
    Error {
        /// Human-readable description.
        content: String,
    },
}

impl ServerEvent {
    /// A `chunk` event carrying an assistant fragment.
    #[must_use]
    pub fn chunk(content: impl Into<String>) -> Self {
        Self::Chunk {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// A `history` event replaying one turn.
    #[must_use]
    pub fn history(turn: &Turn) -> Self {
        Self::History {
            sender: turn.role,
            text: turn.content.clone(),
        }
    }

    /// An `error` event describing the given failure.
    #[must_use]
    pub fn error(err: &RelayError) -> Self {
        Self::Error {
            content: err.to_string(),
        }
    }
}
