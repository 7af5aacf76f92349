//! Publish/subscribe transport interface.

use std::pin::Pin;

use futures::Stream;

use crate::error::RelayError;

/// A record delivered from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    /// Partitioning key (the session id for relay traffic).
    pub key: Option<String>,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Records delivered to one consumer-group member, in topic order.
///
/// The stream ends when the subscription is closed by the broker.
pub type RecordStream = Pin<Box<dyn Stream<Item = BrokerRecord> + Send>>;

/// Broker collaborator used by the bridge and the completion worker.
#[async_trait::async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Publish `payload` to `topic`, returning once the broker has
    /// acknowledged the record.
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), RelayError>;

    /// Join consumer group `group` on `topic`.
    ///
    /// Each record of the topic is delivered to exactly one member of each
    /// group.
    async fn subscribe(&self, topic: &str, group: &str) -> Result<RecordStream, RelayError>;
}
