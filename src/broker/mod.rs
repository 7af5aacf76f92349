//! Broker mode: turns out through one topic, replies back through another.
//!
//! The [`BrokerBridge`] publishes each user turn as a [`TurnRecord`] and
//! reads assistant output as [`ReplyRecord`]s from the reply topic. Replies
//! for every session arrive on the same topic, so the bridge runs a single
//! dispatcher that sorts them into per-session mailboxes; a session's
//! consumer only ever reads its own mailbox. A mailbox opens when the bridge
//! first publishes or consumes for a session and closes on
//! [`BrokerBridge::release`]; records for sessions without one are dropped.
//!
//! # Deployment
//!
//! The dispatcher joins a shared consumer group. Records are keyed by
//! session id, so a broker that partitions by key keeps one session's
//! replies on one member, but nothing routes a reply to the process that
//! holds the client connection. Broker mode therefore assumes a single
//! relay instance per consumer group.
//!
//! # Modules
//!
//! - [`transport`]: the [`PubSubTransport`] collaborator interface
//! - [`memory`]: [`InMemoryBroker`], an in-process implementation
//! - [`worker`]: [`CompletionWorker`], answers user turns via an upstream client

pub mod memory;
pub mod transport;
pub mod worker;

pub use memory::InMemoryBroker;
pub use transport::{BrokerRecord, PubSubTransport, RecordStream};
pub use worker::CompletionWorker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::RelayError;
use crate::llm::{Delta, DeltaStream, Role, Turn};

/// Broker topics and consumer settings.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Broker bootstrap address.
    pub bootstrap_servers: String,
    /// Topic user turns are published to.
    pub user_topic: String,
    /// Topic assistant deltas are consumed from.
    pub reply_topic: String,
    /// Consumer group the reply dispatcher joins.
    pub consumer_group: String,
    /// Longest wait between two reply records before giving up.
    pub idle_timeout: Option<Duration>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            user_topic: "chat_user_messages".to_string(),
            reply_topic: "chat_assistant_responses".to_string(),
            consumer_group: "relay_chat_consumer".to_string(),
            idle_timeout: None,
        }
    }
}

/// Payload published to the user topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRecord {
    /// Originating session.
    pub session_id: String,
    /// Turn author.
    pub role: Role,
    /// Turn content.
    pub content: String,
}

/// Payload consumed from the reply topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRecord {
    /// Session the delta belongs to.
    pub session_id: String,
    /// Text fragment.
    #[serde(default)]
    pub content: String,
    /// Whether this record closes the reply.
    #[serde(default)]
    pub done: bool,
}

impl ReplyRecord {
    /// Decode a record payload.
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Encode as a record payload.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn into_delta(self) -> Delta {
        Delta {
            text: self.content,
            is_final: self.done,
        }
    }
}

/// Correlates published turns with their streamed replies.
#[derive(Clone)]
pub struct BrokerBridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    transport: Arc<dyn PubSubTransport>,
    settings: BrokerSettings,
    mailboxes: Mutex<HashMap<String, Mailbox>>,
    /// Set once the reply subscription has ended.
    closed: AtomicBool,
}

struct Mailbox {
    tx: mpsc::UnboundedSender<Delta>,
    inbox: Arc<AsyncMutex<Inbox>>,
}

struct Inbox {
    rx: mpsc::UnboundedReceiver<Delta>,
    /// Replies whose consumer went away before their final record.
    abandoned: usize,
}

impl std::fmt::Debug for BrokerBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerBridge")
            .field("settings", &self.inner.settings)
            .field("mailboxes", &self.lock_mailboxes().len())
            .finish()
    }
}

impl BrokerBridge {
    /// Subscribe the reply topic and start dispatching replies.
    ///
    /// The dispatcher stops when `shutdown` is cancelled, the bridge is
    /// dropped, or the subscription ends.
    pub async fn connect(
        transport: Arc<dyn PubSubTransport>,
        settings: BrokerSettings,
        shutdown: CancellationToken,
    ) -> Result<Self, RelayError> {
        let records = transport
            .subscribe(&settings.reply_topic, &settings.consumer_group)
            .await
            .map_err(|e| RelayError::BrokerConsume(e.to_string()))?;

        tracing::info!(
            name: "broker.connected",
            bootstrap = %settings.bootstrap_servers,
            user_topic = %settings.user_topic,
            reply_topic = %settings.reply_topic,
            group = %settings.consumer_group,
            "Broker bridge connected"
        );

        let bridge = Self {
            inner: Arc::new(BridgeInner {
                transport,
                settings,
                mailboxes: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        };

        tokio::spawn(dispatch(Arc::downgrade(&bridge.inner), records, shutdown));
        Ok(bridge)
    }

    /// The bridge settings.
    #[must_use]
    pub fn settings(&self) -> &BrokerSettings {
        &self.inner.settings
    }

    /// Publish a turn and wait for the broker acknowledgement.
    ///
    /// Opens the session's mailbox first, so replies arriving before the
    /// caller starts consuming are kept.
    pub async fn publish(&self, session_id: &str, turn: &Turn) -> Result<(), RelayError> {
        let _mailbox = self.inbox_for(session_id);
        let record = TurnRecord {
            session_id: session_id.to_string(),
            role: turn.role,
            content: turn.content.clone(),
        };
        let payload =
            serde_json::to_vec(&record).map_err(|e| RelayError::BrokerPublish(e.to_string()))?;

        self.inner
            .transport
            .publish(&self.inner.settings.user_topic, session_id, payload)
            .await
            .map_err(|e| match e {
                already @ RelayError::BrokerPublish(_) => already,
                other => RelayError::BrokerPublish(other.to_string()),
            })?;

        debug!(
            name: "broker.published",
            session_id = %session_id,
            topic = %self.inner.settings.user_topic,
            "Published user turn"
        );
        Ok(())
    }

    /// Publish `turn` and stream its reply.
    ///
    /// The session's inbox is claimed before publishing, so a caller that
    /// gives up while the broker acknowledges still leaves the reply to be
    /// skipped by the session's next stream.
    pub async fn send_turn(
        &self,
        session_id: &str,
        turn: &Turn,
    ) -> Result<DeltaStream, RelayError> {
        let inbox = self.inbox_for(session_id).ok_or_else(subscription_closed)?;
        let mut cursor = ReplyCursor::new(inbox.lock_owned().await);
        if let Err(e) = self.publish(session_id, turn).await {
            cursor.finished = true;
            return Err(e);
        }
        Ok(read_reply(cursor, self.inner.settings.idle_timeout))
    }

    /// Stream the next reply for `session_id`.
    ///
    /// Yields the session's deltas in arrival order and ends after the
    /// first final delta. Whatever is left of a reply whose stream was
    /// dropped early is skipped by the session's next stream. A timeout
    /// gives up on every outstanding reply of the session.
    pub fn consume_for(&self, session_id: &str) -> DeltaStream {
        let Some(inbox) = self.inbox_for(session_id) else {
            return Box::pin(futures::stream::once(async { Err(subscription_closed()) }));
        };

        let idle_timeout = self.inner.settings.idle_timeout;
        let ready = Arc::clone(&inbox).try_lock_owned().ok().map(ReplyCursor::new);

        Box::pin(async_stream::stream! {
            let cursor = match ready {
                Some(cursor) => cursor,
                None => ReplyCursor::new(inbox.lock_owned().await),
            };
            let mut deltas = read_reply(cursor, idle_timeout);
            while let Some(item) = deltas.next().await {
                yield item;
            }
        })
    }

    /// Drop the mailbox of a session that will not be consumed again.
    pub fn release(&self, session_id: &str) {
        if self.lock_mailboxes().remove(session_id).is_some() {
            debug!(name: "broker.mailbox_released", session_id = %session_id, "Released mailbox");
        }
    }

    fn inbox_for(&self, session_id: &str) -> Option<Arc<AsyncMutex<Inbox>>> {
        let mut mailboxes = self.lock_mailboxes();
        if self.inner.closed.load(Ordering::Acquire) {
            return None;
        }
        Some(Arc::clone(&mailbox_entry(&mut mailboxes, session_id).inbox))
    }

    fn lock_mailboxes(&self) -> MutexGuard<'_, HashMap<String, Mailbox>> {
        self.inner.lock_mailboxes()
    }
}

impl BridgeInner {
    fn lock_mailboxes(&self) -> MutexGuard<'_, HashMap<String, Mailbox>> {
        self.mailboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, reply: ReplyRecord) {
        let mailboxes = self.lock_mailboxes();
        let Some(mailbox) = mailboxes.get(&reply.session_id) else {
            debug!(
                name: "broker.unrouted",
                session_id = %reply.session_id,
                "No mailbox for session, dropping reply record"
            );
            return;
        };
        let session_id = reply.session_id.clone();
        if mailbox.tx.send(reply.into_delta()).is_err() {
            warn!(
                name: "broker.route_failed",
                session_id = %session_id,
                "Mailbox closed, dropping reply record"
            );
        }
    }
}

/// A session's mailbox, created on first use.
fn mailbox_entry<'a>(
    mailboxes: &'a mut HashMap<String, Mailbox>,
    session_id: &str,
) -> &'a Mailbox {
    mailboxes.entry(session_id.to_string()).or_insert_with(|| {
        let (tx, rx) = mpsc::unbounded_channel();
        Mailbox {
            tx,
            inbox: Arc::new(AsyncMutex::new(Inbox { rx, abandoned: 0 })),
        }
    })
}

/// Exclusive read position on a session's inbox for one reply.
struct ReplyCursor {
    inbox: OwnedMutexGuard<Inbox>,
    finished: bool,
}

impl ReplyCursor {
    fn new(inbox: OwnedMutexGuard<Inbox>) -> Self {
        Self {
            inbox,
            finished: false,
        }
    }

    /// Stop expecting this reply and any abandoned before it.
    fn give_up(&mut self) {
        self.finished = true;
        self.inbox.abandoned = 0;
    }
}

impl Drop for ReplyCursor {
    fn drop(&mut self) {
        if !self.finished {
            self.inbox.abandoned += 1;
        }
    }
}

/// Read one reply through `cursor`, first skipping what is left of
/// abandoned replies.
fn read_reply(mut cursor: ReplyCursor, idle_timeout: Option<Duration>) -> DeltaStream {
    Box::pin(async_stream::stream! {
        while cursor.inbox.abandoned > 0 {
            match next_delta(&mut cursor.inbox.rx, idle_timeout).await {
                Ok(delta) => {
                    if delta.is_final {
                        cursor.inbox.abandoned -= 1;
                    }
                }
                Err(e) => {
                    cursor.give_up();
                    yield Err(e);
                    return;
                }
            }
        }

        loop {
            match next_delta(&mut cursor.inbox.rx, idle_timeout).await {
                Ok(delta) => {
                    let is_final = delta.is_final;
                    cursor.finished = is_final;
                    yield Ok(delta);
                    if is_final {
                        return;
                    }
                }
                Err(e) => {
                    cursor.give_up();
                    yield Err(e);
                    return;
                }
            }
        }
    })
}

fn subscription_closed() -> RelayError {
    RelayError::BrokerConsume("reply subscription closed".to_string())
}

async fn next_delta(
    rx: &mut mpsc::UnboundedReceiver<Delta>,
    idle_timeout: Option<Duration>,
) -> Result<Delta, RelayError> {
    let next = match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, rx.recv())
            .await
            .map_err(|_elapsed| RelayError::StreamTimeout(limit))?,
        None => rx.recv().await,
    };
    next.ok_or_else(subscription_closed)
}

/// Sort reply records into per-session mailboxes until the subscription
/// ends.
async fn dispatch(
    bridge: Weak<BridgeInner>,
    mut records: RecordStream,
    shutdown: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            () = shutdown.cancelled() => break,
            record = records.next() => record,
        };
        let Some(record) = record else {
            error!(name: "broker.subscription_closed", "Reply subscription ended");
            break;
        };
        let Some(bridge) = bridge.upgrade() else {
            return;
        };

        match ReplyRecord::decode(&record.payload) {
            Ok(reply) => bridge.route(reply),
            Err(e) => warn!(
                name: "broker.decode_failed",
                key = ?record.key,
                error = %e,
                "Skipping undecodable reply record"
            ),
        }
    }

    if let Some(bridge) = bridge.upgrade() {
        let mut mailboxes = bridge.lock_mailboxes();
        bridge.closed.store(true, Ordering::Release);
        // Dropping the senders lets waiting consumers observe the closure.
        mailboxes.clear();
    }
}
