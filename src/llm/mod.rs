//! Conversation types and the upstream generation client.
//!
//! This module defines the transcript model shared by every backend
//! ([`Turn`], [`Role`], [`Delta`]) and the [`UpstreamStream`] trait through
//! which a transcript is turned into a lazy stream of text deltas.
//!
//! # Clients
//!
//! - [`ChatCompletionsClient`]: OpenAI-compatible `/v1/chat/completions`
//!   endpoint streamed as `text/event-stream` (OpenRouter by default).
//!
//! # Example
//!
//! ```rust,ignore
//! use chat_relay::llm::{ChatCompletionsClient, LlmSettings, Turn, UpstreamStream};
//!
//! let client = ChatCompletionsClient::new(LlmSettings::from_base_url("https://openrouter.ai/api"));
//! let deltas = client.stream(&[Turn::system("Be brief."), Turn::user("hi")]).await?;
//! ```

pub mod chat_completions;
pub mod provider;

pub use chat_completions::ChatCompletionsClient;
pub use provider::Provider;

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Lazy sequence of assistant deltas.
///
/// The sequence ends after the last delta of a reply; an `Err` item is
/// terminal and aborts the reply.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<Delta, RelayError>> + Send>>;

/// Default bound on generated tokens per reply.
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

/// Upstream connection and model settings.
#[derive(Clone)]
pub struct LlmSettings {
    /// Base URL of the API (e.g. `https://openrouter.ai/api`).
    pub base_url: String,
    /// Optional API key sent as a bearer token.
    pub api_key: Option<String>,
    /// Model identifier.
    pub model: String,
    /// Upper bound on generated tokens per reply.
    pub max_tokens: u32,
    /// Provider (auto-detected from `base_url`).
    pub provider: Provider,
}

impl std::fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("provider", &self.provider)
            .finish()
    }
}

impl LlmSettings {
    /// Settings for `base_url` with the default model and token bound.
    #[must_use]
    pub fn from_base_url(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            provider: Provider::detect_from_url(&base_url),
            base_url,
            api_key: None,
            model: "gpt-4o".to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// Role of a turn author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Persona/instruction preamble.
    System,
    /// User message.
    User,
    /// Assistant reply.
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        };
        f.write_str(s)
    }
}

/// One role-tagged message in a transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Author of the turn.
    pub role: Role,
    /// Text content.
    pub content: String,
}

impl Turn {
    /// A system turn.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// A user turn.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// An assistant turn.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// An incremental fragment of assistant output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    /// The text fragment (may be empty on a final marker).
    pub text: String,
    /// Whether this delta closes the reply.
    pub is_final: bool,
}

impl Delta {
    /// A non-final fragment.
    #[must_use]
    pub fn fragment(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    /// A final delta, optionally carrying a last fragment.
    #[must_use]
    pub fn last(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// Trait for streaming generation backends.
///
/// Implementations issue one request per call carrying the full transcript
/// and yield the reply as [`Delta`]s. End of the stream is the end of the
/// reply.
#[async_trait::async_trait]
pub trait UpstreamStream: Send + Sync {
    /// Stream a reply to `transcript`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be issued or the backend
    /// rejects it. Failures after the first delta surface as a terminal
    /// `Err` item on the stream instead.
    async fn stream(&self, transcript: &[Turn]) -> Result<DeltaStream, RelayError>;
}
