//! In-process publish/subscribe broker.
//!
//! Models the parts of a partitioned log the relay relies on: consumer
//! groups receive every record once, records with the same key always go
//! to the same member of a group, and records published while a group has
//! no live member are kept until one joins.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::error::RelayError;

use super::transport::{BrokerRecord, PubSubTransport, RecordStream};

/// In-process broker shared by every clone.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    topics: Arc<Mutex<HashMap<String, Topic>>>,
}

#[derive(Debug, Default)]
struct Topic {
    groups: BTreeMap<String, Group>,
    /// Records published before any group existed.
    retained: Vec<BrokerRecord>,
}

#[derive(Debug, Default)]
struct Group {
    members: Vec<mpsc::UnboundedSender<BrokerRecord>>,
    /// Records published while no member was live.
    backlog: Vec<BrokerRecord>,
}

impl Group {
    fn deliver(&mut self, record: BrokerRecord) {
        self.members.retain(|m| !m.is_closed());
        if self.members.is_empty() {
            self.backlog.push(record);
            return;
        }

        let idx = member_for(record.key.as_deref(), self.members.len());
        if let Err(mpsc::error::SendError(record)) = self.members[idx].send(record) {
            self.backlog.push(record);
        }
    }
}

fn member_for(key: Option<&str>, members: usize) -> usize {
    let Some(key) = key else { return 0 };
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % members as u64) as usize
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// End every subscription on `topic`.
    ///
    /// Subscribers see their record stream finish.
    pub fn close(&self, topic: &str) {
        if let Some(topic) = self.lock().get_mut(topic) {
            for group in topic.groups.values_mut() {
                group.members.clear();
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Topic>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl PubSubTransport for InMemoryBroker {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), RelayError> {
        let record = BrokerRecord {
            key: Some(key.to_string()),
            payload,
        };

        let mut topics = self.lock();
        let topic_state = topics.entry(topic.to_string()).or_default();
        if topic_state.groups.is_empty() {
            topic_state.retained.push(record);
        } else {
            for group in topic_state.groups.values_mut() {
                group.deliver(record.clone());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<RecordStream, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut topics = self.lock();
        let topic_state = topics.entry(topic.to_string()).or_default();
        let is_first_group = topic_state.groups.is_empty();
        let group_state = topic_state.groups.entry(group.to_string()).or_default();
        if is_first_group {
            group_state.backlog.append(&mut topic_state.retained);
        }

        for record in group_state.backlog.drain(..) {
            // The receiver is still held locally, so this cannot fail.
            let _ = tx.send(record);
        }
        group_state.members.push(tx);

        debug!(
            name: "broker.subscribed",
            topic = %topic,
            group = %group,
            members = group_state.members.len(),
            "Consumer joined group"
        );

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
