//! Per-connection session state machine.
//!
//! A [`SessionChannel`] drives one client connection from its init frame to
//! disconnect:
//!
//! ```text
//! AwaitingInit --init--> AwaitingTurn --turn--> Streaming --end/error--> AwaitingTurn
//!       \                     \                     \
//!        +---- disconnect -----+---- disconnect -----+--> Closed
//! ```
//!
//! While a reply streams the channel keeps reading the client: another turn
//! is refused with a `SessionBusy` error event, an invalid frame gets its
//! validation error, and a disconnect stops the reply at once, dropping its
//! backend stream.
//!
//! Replies come from a [`Backend`]: either an upstream streaming client
//! called with the session transcript, or a [`BrokerBridge`] that publishes
//! the user turn and relays the correlated reply records.

pub mod transport;

pub use transport::{
    EventSink, FrameSource, LocalClient, LocalSink, LocalSource, WsEventSink, WsFrameSource,
    local_pair, split_socket,
};

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::broker::BrokerBridge;
use crate::error::RelayError;
use crate::llm::{DeltaStream, Turn, UpstreamStream};
use crate::protocol::{ClientFrame, ServerEvent};
use crate::session::{Attachment, ConversationStore, Session};

/// Where assistant replies come from.
#[derive(Clone)]
pub enum Backend {
    /// Call the upstream service directly with the full transcript.
    Upstream(Arc<dyn UpstreamStream>),
    /// Publish turns to the broker and relay its reply records.
    Broker(BrokerBridge),
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Backend {
    /// Short name used in logs and health output.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Upstream(_) => "upstream",
            Self::Broker(_) => "broker",
        }
    }

    /// Start a reply to `user_turn`, which is already the last turn of
    /// `session`.
    async fn open(&self, session: &Session, user_turn: &Turn) -> Result<DeltaStream, RelayError> {
        match self {
            Self::Upstream(client) => client.stream(&session.transcript()).await,
            Self::Broker(bridge) => bridge.send_turn(session.id(), user_turn).await,
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Waiting for the init frame.
    AwaitingInit,
    /// Bound to a session, waiting for a turn.
    AwaitingTurn {
        /// Bound session.
        session_id: String,
    },
    /// A reply is streaming.
    Streaming {
        /// Bound session.
        session_id: String,
    },
    /// The connection has ended.
    Closed,
}

/// How a streamed reply ended.
enum Outcome {
    Completed { reply: String, chunks: usize },
    Failed(RelayError),
    Disconnected,
}

/// Drives one client connection.
pub struct SessionChannel<R, S> {
    source: R,
    sink: S,
    store: ConversationStore,
    backend: Backend,
    state: ChannelState,
}

impl<R, S> std::fmt::Debug for SessionChannel<R, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionChannel")
            .field("backend", &self.backend)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<R: FrameSource, S: EventSink> SessionChannel<R, S> {
    /// Create a channel in [`ChannelState::AwaitingInit`].
    pub fn new(source: R, sink: S, store: ConversationStore, backend: Backend) -> Self {
        Self {
            source,
            sink,
            store,
            backend,
            state: ChannelState::AwaitingInit,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    /// Run until the client disconnects.
    ///
    /// Returns an error only when an event could not be delivered; the
    /// channel is [`ChannelState::Closed`] afterwards either way.
    pub async fn run(&mut self) -> Result<(), RelayError> {
        let result = self.drive().await;
        let session_id = match std::mem::replace(&mut self.state, ChannelState::Closed) {
            ChannelState::AwaitingTurn { session_id } | ChannelState::Streaming { session_id } => {
                Some(session_id)
            }
            ChannelState::AwaitingInit | ChannelState::Closed => None,
        };
        info!(
            name: "channel.closed",
            session_id = session_id.as_deref().unwrap_or("-"),
            "Connection closed"
        );
        result
    }

    async fn drive(&mut self) -> Result<(), RelayError> {
        let Some((session, _attachment)) = self.await_init().await? else {
            return Ok(());
        };

        while let Some(frame) = self.source.recv().await {
            if !self.handle_turn(&session, frame).await? {
                break;
            }
        }
        Ok(())
    }

    /// Wait for the init frame, bind the session and replay its history.
    async fn await_init(&mut self) -> Result<Option<(Session, Attachment)>, RelayError> {
        loop {
            let frame = match self.source.recv().await {
                None => return Ok(None),
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    debug!(name: "channel.bad_init", error = %e, "Rejected init frame");
                    self.sink.send(ServerEvent::error(&e)).await?;
                    continue;
                }
            };

            let resolved = self.store.resolve(frame.requested_session());
            let history = resolved.session.history();
            info!(
                name: "channel.bound",
                session_id = %resolved.id,
                is_new = resolved.is_new,
                backend = self.backend.name(),
                history = history.len(),
                "Connection bound to session"
            );

            self.state = ChannelState::AwaitingTurn {
                session_id: resolved.id.clone(),
            };
            self.sink
                .send(ServerEvent::Session {
                    session_id: resolved.id,
                })
                .await?;
            for turn in &history {
                self.sink.send(ServerEvent::history(turn)).await?;
            }
            return Ok(Some((resolved.session, resolved.attachment)));
        }
    }

    /// Handle one frame received while idle. Returns `false` once the
    /// client has disconnected.
    async fn handle_turn(
        &mut self,
        session: &Session,
        frame: Result<ClientFrame, RelayError>,
    ) -> Result<bool, RelayError> {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                self.sink.send(ServerEvent::error(&e)).await?;
                return Ok(true);
            }
        };
        let Some(message) = frame.message_text() else {
            self.sink
                .send(ServerEvent::error(&RelayError::message_required()))
                .await?;
            return Ok(true);
        };
        let Some(_guard) = session.try_begin_turn() else {
            self.sink
                .send(ServerEvent::error(&RelayError::SessionBusy(
                    session.id().to_string(),
                )))
                .await?;
            return Ok(true);
        };

        let user_turn = Turn::user(message);
        if let Err(e) = self.store.append(session.id(), user_turn.clone()) {
            self.sink.send(ServerEvent::error(&e)).await?;
            return Ok(true);
        }

        self.state = ChannelState::Streaming {
            session_id: session.id().to_string(),
        };
        self.sink.send(ServerEvent::Start).await?;

        let outcome = self.stream_reply(session, &user_turn).await?;
        self.state = ChannelState::AwaitingTurn {
            session_id: session.id().to_string(),
        };

        match outcome {
            Outcome::Completed { reply, chunks } => {
                info!(
                    name: "turn.completed",
                    session_id = %session.id(),
                    chunks,
                    chars = reply.chars().count(),
                    "Reply completed"
                );
                if let Err(e) = self.store.append(session.id(), Turn::assistant(reply)) {
                    self.sink.send(ServerEvent::error(&e)).await?;
                } else {
                    self.sink.send(ServerEvent::End).await?;
                }
                Ok(true)
            }
            Outcome::Failed(e) => {
                warn!(name: "turn.failed", session_id = %session.id(), error = %e, "Reply failed");
                self.sink.send(ServerEvent::error(&e)).await?;
                Ok(true)
            }
            Outcome::Disconnected => {
                info!(name: "turn.cancelled", session_id = %session.id(), "Client left mid-reply");
                Ok(false)
            }
        }
    }

    /// Relay deltas to the client until the reply ends, fails, or the
    /// client leaves. Partial text of a failed reply is not kept.
    async fn stream_reply(
        &mut self,
        session: &Session,
        user_turn: &Turn,
    ) -> Result<Outcome, RelayError> {
        let id = session.id();
        let opened = Self::while_streaming(
            &mut self.source,
            &mut self.sink,
            id,
            self.backend.open(session, user_turn),
        )
        .await?;
        let mut deltas = match opened {
            None => return Ok(Outcome::Disconnected),
            Some(Err(e)) => return Ok(Outcome::Failed(e)),
            Some(Ok(deltas)) => deltas,
        };

        let mut reply = String::new();
        let mut chunks = 0;
        loop {
            let next =
                Self::while_streaming(&mut self.source, &mut self.sink, id, deltas.next()).await?;
            let delta = match next {
                None => return Ok(Outcome::Disconnected),
                Some(None) => break,
                Some(Some(Err(e))) => return Ok(Outcome::Failed(e)),
                Some(Some(Ok(delta))) => delta,
            };

            if !delta.text.is_empty() {
                reply.push_str(&delta.text);
                chunks += 1;
                self.sink.send(ServerEvent::chunk(delta.text)).await?;
            }
            if delta.is_final {
                break;
            }
        }
        Ok(Outcome::Completed { reply, chunks })
    }

    /// Await `fut` while answering client frames.
    ///
    /// Frames arriving meanwhile are answered with an error: invalid ones
    /// with their validation error, turns as busy. Returns `None` if the
    /// client disconnects first, in which case `fut` is dropped.
    async fn while_streaming<F: Future>(
        source: &mut R,
        sink: &mut S,
        session_id: &str,
        fut: F,
    ) -> Result<Option<F::Output>, RelayError> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                out = &mut fut => return Ok(Some(out)),
                frame = source.recv() => {
                    let rejection = match frame {
                        None => return Ok(None),
                        Some(Err(e)) => e,
                        Some(Ok(frame)) if frame.message_text().is_none() => {
                            RelayError::message_required()
                        }
                        Some(Ok(_)) => {
                            debug!(
                                name: "turn.rejected_busy",
                                session_id = %session_id,
                                "Turn received mid-reply"
                            );
                            RelayError::SessionBusy(session_id.to_string())
                        }
                    };
                    sink.send(ServerEvent::error(&rejection)).await?;
                }
            }
        }
    }
}
