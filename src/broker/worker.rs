//! Completion worker for broker mode.
//!
//! Consumes [`TurnRecord`]s from the user topic, streams a reply for each
//! through an [`UpstreamStream`] and publishes the fragments to the reply
//! topic. Each turn is answered on its own, from the system prompt and the
//! turn alone, since the user topic carries no history.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::llm::{Turn, UpstreamStream};

use super::transport::{PubSubTransport, RecordStream};
use super::{BrokerSettings, ReplyRecord, TurnRecord};

/// Consumer group the worker joins on the user topic.
pub const WORKER_GROUP: &str = "relay_completion_worker";

/// Answers published user turns.
#[derive(Clone)]
pub struct CompletionWorker {
    transport: Arc<dyn PubSubTransport>,
    upstream: Arc<dyn UpstreamStream>,
    settings: BrokerSettings,
    system_prompt: String,
}

impl std::fmt::Debug for CompletionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionWorker")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl CompletionWorker {
    /// Create a worker.
    #[must_use]
    pub fn new(
        transport: Arc<dyn PubSubTransport>,
        upstream: Arc<dyn UpstreamStream>,
        settings: BrokerSettings,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            upstream,
            settings,
            system_prompt: system_prompt.into(),
        }
    }

    /// Join the worker group and start answering turns in the background.
    ///
    /// The subscription is in place when this returns, so no turn
    /// published afterwards is missed.
    pub async fn spawn(self, shutdown: CancellationToken) -> Result<JoinHandle<()>, RelayError> {
        let records = self
            .transport
            .subscribe(&self.settings.user_topic, WORKER_GROUP)
            .await?;

        info!(
            name: "worker.started",
            topic = %self.settings.user_topic,
            group = WORKER_GROUP,
            "Completion worker started"
        );
        Ok(tokio::spawn(self.run(records, shutdown)))
    }

    async fn run(self, mut records: RecordStream, shutdown: CancellationToken) {
        loop {
            let record = tokio::select! {
                () = shutdown.cancelled() => break,
                record = records.next() => record,
            };
            let Some(record) = record else { break };

            let turn: TurnRecord = match serde_json::from_slice(&record.payload) {
                Ok(turn) => turn,
                Err(e) => {
                    warn!(name: "worker.decode_failed", error = %e, "Skipping undecodable turn record");
                    continue;
                }
            };

            let worker = self.clone();
            tokio::spawn(async move { worker.answer(turn).await });
        }
        info!(name: "worker.stopped", "Completion worker stopped");
    }

    /// Stream one reply and publish it fragment by fragment, closing it
    /// with an empty `done` record even when the upstream fails.
    async fn answer(&self, turn: TurnRecord) {
        let session_id = turn.session_id;
        let transcript = [
            Turn::system(self.system_prompt.clone()),
            Turn {
                role: turn.role,
                content: turn.content,
            },
        ];

        match self.upstream.stream(&transcript).await {
            Ok(mut deltas) => {
                while let Some(next) = deltas.next().await {
                    match next {
                        Ok(delta) if delta.text.is_empty() => {}
                        Ok(delta) => {
                            if let Err(e) = self.send(&session_id, delta.text, false).await {
                                error!(name: "worker.publish_failed", session_id = %session_id, error = %e, "Dropping reply");
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(name: "worker.upstream_failed", session_id = %session_id, error = %e, "Upstream failed mid-reply");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(name: "worker.upstream_failed", session_id = %session_id, error = %e, "Upstream request failed");
            }
        }

        if let Err(e) = self.send(&session_id, String::new(), true).await {
            error!(name: "worker.publish_failed", session_id = %session_id, error = %e, "Could not close reply");
        } else {
            debug!(name: "worker.reply_done", session_id = %session_id, "Reply published");
        }
    }

    async fn send(&self, session_id: &str, content: String, done: bool) -> Result<(), RelayError> {
        let record = ReplyRecord {
            session_id: session_id.to_string(),
            content,
            done,
        };
        let payload = record
            .encode()
            .map_err(|e| RelayError::BrokerPublish(e.to_string()))?;
        self.transport
            .publish(&self.settings.reply_topic, session_id, payload)
            .await
    }
}
