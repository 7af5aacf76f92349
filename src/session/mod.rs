//! Session and conversation transcript management.
//!
//! This module provides in-memory storage for conversation state across
//! connections. Sessions are identified by UUID and hold the full
//! transcript, starting with a fixed system turn.
//!
//! # Architecture
//!
//! - [`Session`]: a single conversation and its transcript
//! - [`ConversationStore`]: thread-safe registry of all sessions
//! - [`EvictionPolicy`]: how (and whether) idle sessions are dropped
//!
//! With [`EvictionPolicy::None`] sessions live for the lifetime of the
//! process and the store grows without bound.
//!
//! # Example
//!
//! ```rust
//! use chat_relay::llm::Turn;
//! use chat_relay::session::ConversationStore;
//!
//! let store = ConversationStore::new();
//! let resolved = store.resolve(None);
//! assert!(resolved.is_new);
//!
//! store.append(&resolved.id, Turn::user("Hello!")).unwrap();
//! assert_eq!(store.history(&resolved.id).unwrap().len(), 1);
//! ```

mod store;

pub use store::{
    Attachment, ConversationStore, EvictionHook, EvictionPolicy, Resolved, Session, TurnGuard,
};

/// Persona preamble seeded as the first turn of every session.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a friendly and helpful assistant. Answer user queries in a clear and engaging way.";
