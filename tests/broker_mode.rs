use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chat_relay::broker::{
    BrokerBridge, BrokerSettings, CompletionWorker, InMemoryBroker, PubSubTransport, RecordStream,
    ReplyRecord,
};
use chat_relay::channel::{Backend, LocalClient, SessionChannel, local_pair};
use chat_relay::error::RelayError;
use chat_relay::llm::{Delta, DeltaStream, Turn, UpstreamStream};
use chat_relay::protocol::{ClientFrame, ServerEvent};
use chat_relay::session::ConversationStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Answers with the last turn, split in two fragments.
struct Echo;

#[async_trait::async_trait]
impl UpstreamStream for Echo {
    async fn stream(&self, transcript: &[Turn]) -> Result<DeltaStream, RelayError> {
        let last = transcript
            .last()
            .map(|t| t.content.clone())
            .unwrap_or_default();
        let items = vec![Ok(Delta::fragment("echo: ")), Ok(Delta::fragment(last))];
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// Subscribes fine but refuses every publish.
struct Unreachable;

#[async_trait::async_trait]
impl PubSubTransport for Unreachable {
    async fn publish(&self, _topic: &str, _key: &str, _payload: Vec<u8>) -> Result<(), RelayError> {
        Err(RelayError::BrokerPublish("broker unreachable".to_string()))
    }

    async fn subscribe(&self, _topic: &str, _group: &str) -> Result<RecordStream, RelayError> {
        Ok(Box::pin(futures::stream::pending()))
    }
}

/// Delivers every record but never acknowledges the first publish.
struct StallFirstAck {
    inner: InMemoryBroker,
    stalled: AtomicBool,
}

#[async_trait::async_trait]
impl PubSubTransport for StallFirstAck {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), RelayError> {
        self.inner.publish(topic, key, payload).await?;
        if !self.stalled.swap(true, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<RecordStream, RelayError> {
        self.inner.subscribe(topic, group).await
    }
}

fn connect(
    store: &ConversationStore,
    bridge: &BrokerBridge,
) -> (LocalClient, JoinHandle<Result<(), RelayError>>) {
    let (client, source, sink) = local_pair();
    let mut channel = SessionChannel::new(
        source,
        sink,
        store.clone(),
        Backend::Broker(bridge.clone()),
    );
    let task = tokio::spawn(async move { channel.run().await });
    (client, task)
}

async fn open_session(client: &mut LocalClient) -> String {
    client.send(&ClientFrame::init(None)).unwrap();
    match client.recv().await {
        Some(ServerEvent::Session { session_id }) => session_id,
        other => panic!("expected session event, got {other:?}"),
    }
}

async fn reply(
    broker: &InMemoryBroker,
    settings: &BrokerSettings,
    session_id: &str,
    content: &str,
    done: bool,
) {
    let record = ReplyRecord {
        session_id: session_id.to_string(),
        content: content.to_string(),
        done,
    };
    broker
        .publish(&settings.reply_topic, session_id, record.encode().unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_broker_round_trip_through_worker() {
    let broker = InMemoryBroker::new();
    let settings = BrokerSettings::default();
    let shutdown = CancellationToken::new();

    CompletionWorker::new(
        Arc::new(broker.clone()),
        Arc::new(Echo),
        settings.clone(),
        "sys",
    )
    .spawn(shutdown.clone())
    .await
    .unwrap();
    let bridge = BrokerBridge::connect(Arc::new(broker.clone()), settings, shutdown.clone())
        .await
        .unwrap();

    let store = ConversationStore::new();
    let (mut client, task) = connect(&store, &bridge);
    let session_id = open_session(&mut client).await;

    client.send(&ClientFrame::turn("ping")).unwrap();
    let events = client.recv_turn().await;
    assert_eq!(
        events,
        vec![
            ServerEvent::Start,
            ServerEvent::chunk("echo: "),
            ServerEvent::chunk("ping"),
            ServerEvent::End,
        ]
    );
    assert_eq!(
        store.history(&session_id).unwrap(),
        vec![Turn::user("ping"), Turn::assistant("echo: ping")]
    );

    client.disconnect();
    task.await.unwrap().unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn test_concurrent_sessions_get_only_their_own_replies() {
    let broker = InMemoryBroker::new();
    let settings = BrokerSettings::default();
    let shutdown = CancellationToken::new();
    let bridge = BrokerBridge::connect(Arc::new(broker.clone()), settings.clone(), shutdown.clone())
        .await
        .unwrap();

    let store = ConversationStore::new();
    let (mut alice, alice_task) = connect(&store, &bridge);
    let (mut bob, bob_task) = connect(&store, &bridge);
    let alice_id = open_session(&mut alice).await;
    let bob_id = open_session(&mut bob).await;

    alice.send(&ClientFrame::turn("question")).unwrap();
    assert_eq!(alice.recv().await, Some(ServerEvent::Start));
    bob.send(&ClientFrame::turn("question")).unwrap();
    assert_eq!(bob.recv().await, Some(ServerEvent::Start));

    // Bob's reply lands first and interleaves with Alice's.
    reply(&broker, &settings, &bob_id, "for bob", false).await;
    reply(&broker, &settings, &alice_id, "for alice", false).await;
    reply(&broker, &settings, &bob_id, "", true).await;
    reply(&broker, &settings, &alice_id, "", true).await;

    assert_eq!(
        alice.recv_turn().await,
        vec![ServerEvent::chunk("for alice"), ServerEvent::End]
    );
    assert_eq!(
        bob.recv_turn().await,
        vec![ServerEvent::chunk("for bob"), ServerEvent::End]
    );

    alice.disconnect();
    bob.disconnect();
    alice_task.await.unwrap().unwrap();
    bob_task.await.unwrap().unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn test_publish_failure_is_reported() {
    let shutdown = CancellationToken::new();
    let bridge = BrokerBridge::connect(
        Arc::new(Unreachable),
        BrokerSettings::default(),
        shutdown.clone(),
    )
    .await
    .unwrap();

    let store = ConversationStore::new();
    let (mut client, task) = connect(&store, &bridge);
    let session_id = open_session(&mut client).await;

    client.send(&ClientFrame::turn("hi")).unwrap();
    assert_eq!(
        client.recv_turn().await,
        vec![
            ServerEvent::Start,
            ServerEvent::Error {
                content: "Broker publish failed: broker unreachable".to_string(),
            },
        ]
    );
    assert_eq!(store.history(&session_id).unwrap(), vec![Turn::user("hi")]);

    client.disconnect();
    task.await.unwrap().unwrap();
    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_silent_broker_times_out() {
    let broker = InMemoryBroker::new();
    let settings = BrokerSettings {
        idle_timeout: Some(Duration::from_secs(5)),
        ..BrokerSettings::default()
    };
    let shutdown = CancellationToken::new();
    let bridge = BrokerBridge::connect(Arc::new(broker), settings, shutdown.clone())
        .await
        .unwrap();

    let store = ConversationStore::new();
    let (mut client, task) = connect(&store, &bridge);
    open_session(&mut client).await;

    client.send(&ClientFrame::turn("anyone?")).unwrap();
    assert_eq!(
        client.recv_turn().await,
        vec![
            ServerEvent::Start,
            ServerEvent::Error {
                content: "No response received within 5s".to_string(),
            },
        ]
    );

    client.disconnect();
    task.await.unwrap().unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn test_closed_reply_topic_fails_the_turn() {
    let broker = InMemoryBroker::new();
    let settings = BrokerSettings::default();
    let shutdown = CancellationToken::new();
    let bridge = BrokerBridge::connect(Arc::new(broker.clone()), settings.clone(), shutdown.clone())
        .await
        .unwrap();

    let store = ConversationStore::new();
    let (mut client, task) = connect(&store, &bridge);
    open_session(&mut client).await;

    client.send(&ClientFrame::turn("hi")).unwrap();
    assert_eq!(client.recv().await, Some(ServerEvent::Start));
    broker.close(&settings.reply_topic);

    let Some(ServerEvent::Error { content }) = client.recv().await else {
        panic!("expected error event");
    };
    assert!(content.starts_with("Broker consume failed"));

    client.disconnect();
    task.await.unwrap().unwrap();
    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_turn_after_timeout_is_answered() {
    let broker = InMemoryBroker::new();
    let settings = BrokerSettings {
        idle_timeout: Some(Duration::from_secs(5)),
        ..BrokerSettings::default()
    };
    let shutdown = CancellationToken::new();
    let bridge = BrokerBridge::connect(Arc::new(broker.clone()), settings.clone(), shutdown.clone())
        .await
        .unwrap();

    let store = ConversationStore::new();
    let (mut client, task) = connect(&store, &bridge);
    let session_id = open_session(&mut client).await;

    client.send(&ClientFrame::turn("anyone?")).unwrap();
    let events = client.recv_turn().await;
    assert!(matches!(events.last(), Some(ServerEvent::Error { .. })));

    for (question, answer) in [("again?", "here"), ("still?", "yes")] {
        client.send(&ClientFrame::turn(question)).unwrap();
        assert_eq!(client.recv().await, Some(ServerEvent::Start));
        reply(&broker, &settings, &session_id, answer, false).await;
        reply(&broker, &settings, &session_id, "", true).await;
        assert_eq!(
            client.recv_turn().await,
            vec![ServerEvent::chunk(answer), ServerEvent::End]
        );
    }
    assert_eq!(
        store.history(&session_id).unwrap(),
        vec![
            Turn::user("anyone?"),
            Turn::user("again?"),
            Turn::assistant("here"),
            Turn::user("still?"),
            Turn::assistant("yes"),
        ]
    );

    client.disconnect();
    task.await.unwrap().unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn test_reply_to_turn_abandoned_during_publish_is_skipped() {
    let broker = InMemoryBroker::new();
    let settings = BrokerSettings::default();
    let shutdown = CancellationToken::new();
    let transport = StallFirstAck {
        inner: broker.clone(),
        stalled: AtomicBool::new(false),
    };
    let bridge = BrokerBridge::connect(Arc::new(transport), settings.clone(), shutdown.clone())
        .await
        .unwrap();

    let store = ConversationStore::new();
    let (mut first, first_task) = connect(&store, &bridge);
    let session_id = open_session(&mut first).await;
    first.send(&ClientFrame::turn("one")).unwrap();
    assert_eq!(first.recv().await, Some(ServerEvent::Start));
    first.disconnect();
    first_task.await.unwrap().unwrap();

    // The first turn still reached the broker and gets answered late.
    reply(&broker, &settings, &session_id, "stale", false).await;
    reply(&broker, &settings, &session_id, "", true).await;

    let (mut second, second_task) = connect(&store, &bridge);
    second.send(&ClientFrame::init(Some(&session_id))).unwrap();
    assert_eq!(
        second.recv().await,
        Some(ServerEvent::Session {
            session_id: session_id.clone(),
        })
    );
    assert_eq!(
        second.recv().await,
        Some(ServerEvent::history(&Turn::user("one")))
    );

    second.send(&ClientFrame::turn("two")).unwrap();
    assert_eq!(second.recv().await, Some(ServerEvent::Start));
    reply(&broker, &settings, &session_id, "fresh", false).await;
    reply(&broker, &settings, &session_id, "", true).await;
    assert_eq!(
        second.recv_turn().await,
        vec![ServerEvent::chunk("fresh"), ServerEvent::End]
    );

    second.disconnect();
    second_task.await.unwrap().unwrap();
    shutdown.cancel();
}
