//! Client connection adapters.
//!
//! A [`SessionChannel`](super::SessionChannel) reads [`ClientFrame`]s from a
//! [`FrameSource`] and writes [`ServerEvent`]s to an [`EventSink`]. The
//! WebSocket adapters serve real clients; [`local_pair`] wires a channel to
//! an in-process [`LocalClient`].

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::RelayError;
use crate::protocol::{ClientFrame, ServerEvent};

/// Inbound half of a client connection.
#[async_trait::async_trait]
pub trait FrameSource: Send {
    /// Wait for the next client frame.
    ///
    /// Returns `None` once the client has gone away. Frames that fail to
    /// parse come back as `Some(Err(_))`; the connection stays usable.
    /// Dropping the returned future must not lose a frame.
    async fn recv(&mut self) -> Option<Result<ClientFrame, RelayError>>;
}

/// Outbound half of a client connection.
#[async_trait::async_trait]
pub trait EventSink: Send {
    /// Deliver one event. An error means the client is unreachable.
    async fn send(&mut self, event: ServerEvent) -> Result<(), RelayError>;
}

/// Reads frames from the receiving half of a WebSocket.
#[derive(Debug)]
pub struct WsFrameSource(SplitStream<WebSocket>);

/// Writes events to the sending half of a WebSocket.
#[derive(Debug)]
pub struct WsEventSink(SplitSink<WebSocket, Message>);

/// Split an upgraded socket into channel adapters.
#[must_use]
pub fn split_socket(socket: WebSocket) -> (WsFrameSource, WsEventSink) {
    let (sender, receiver) = socket.split();
    (WsFrameSource(receiver), WsEventSink(sender))
}

#[async_trait::async_trait]
impl FrameSource for WsFrameSource {
    async fn recv(&mut self) -> Option<Result<ClientFrame, RelayError>> {
        loop {
            match self.0.next().await? {
                Ok(Message::Text(text)) => return Some(ClientFrame::parse(text.as_str())),
                Ok(Message::Binary(bytes)) => {
                    let parsed = std::str::from_utf8(&bytes)
                        .map_err(|e| RelayError::Validation(format!("Invalid frame: {e}")))
                        .and_then(ClientFrame::parse);
                    return Some(parsed);
                }
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                Ok(Message::Close(_)) => return None,
                Err(e) => {
                    debug!(name: "channel.socket_error", error = %e, "WebSocket read failed");
                    return None;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl EventSink for WsEventSink {
    async fn send(&mut self, event: ServerEvent) -> Result<(), RelayError> {
        let json =
            serde_json::to_string(&event).map_err(|e| RelayError::Transport(e.to_string()))?;
        self.0
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))
    }
}

/// Client end of an in-process connection.
///
/// Frames are sent as raw text, the way they would cross a socket.
/// Dropping the client (or calling [`LocalClient::disconnect`]) is seen by
/// the channel as a disconnect.
#[derive(Debug)]
pub struct LocalClient {
    frames: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
}

impl LocalClient {
    /// Send a frame.
    pub fn send(&self, frame: &ClientFrame) -> Result<(), RelayError> {
        let text =
            serde_json::to_string(frame).map_err(|e| RelayError::Transport(e.to_string()))?;
        self.send_raw(text)
    }

    /// Send arbitrary text, well-formed or not.
    pub fn send_raw(&self, text: impl Into<String>) -> Result<(), RelayError> {
        self.frames
            .send(text.into())
            .map_err(|e| RelayError::Transport(format!("channel closed: {e}")))
    }

    /// Next event from the server, or `None` once the channel has finished.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    /// Collect events up to and including the next `end` or `error`.
    pub async fn recv_turn(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            let last = matches!(event, ServerEvent::End | ServerEvent::Error { .. });
            events.push(event);
            if last {
                break;
            }
        }
        events
    }

    /// Close the connection from the client side.
    pub fn disconnect(self) {
        drop(self);
    }
}

/// Server end of an in-process connection, inbound half.
#[derive(Debug)]
pub struct LocalSource(mpsc::UnboundedReceiver<String>);

/// Server end of an in-process connection, outbound half.
#[derive(Debug)]
pub struct LocalSink(mpsc::UnboundedSender<ServerEvent>);

/// Create a connected in-process client and server adapters.
#[must_use]
pub fn local_pair() -> (LocalClient, LocalSource, LocalSink) {
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (
        LocalClient {
            frames: frame_tx,
            events: event_rx,
        },
        LocalSource(frame_rx),
        LocalSink(event_tx),
    )
}

#[async_trait::async_trait]
impl FrameSource for LocalSource {
    async fn recv(&mut self) -> Option<Result<ClientFrame, RelayError>> {
        let text = self.0.recv().await?;
        Some(ClientFrame::parse(&text))
    }
}

#[async_trait::async_trait]
impl EventSink for LocalSink {
    async fn send(&mut self, event: ServerEvent) -> Result<(), RelayError> {
        self.0
            .send(event)
            .map_err(|e| RelayError::Transport(format!("client disconnected: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_pair_carries_frames_and_events() {
        let (mut client, mut source, mut sink) = local_pair();

        client.send(&ClientFrame::turn("hi")).unwrap();
        client.send_raw("not json").unwrap();

        let frame = source.recv().await.unwrap().unwrap();
        assert_eq!(frame.message_text(), Some("hi"));
        assert!(matches!(
            source.recv().await,
            Some(Err(RelayError::Validation(_)))
        ));

        sink.send(ServerEvent::Start).await.unwrap();
        assert_eq!(client.recv().await, Some(ServerEvent::Start));
    }

    #[tokio::test]
    async fn test_disconnect_ends_source_and_fails_sink() {
        let (client, mut source, mut sink) = local_pair();
        client.disconnect();

        assert!(source.recv().await.is_none());
        assert!(matches!(
            sink.send(ServerEvent::End).await,
            Err(RelayError::Transport(_))
        ));
    }
}
