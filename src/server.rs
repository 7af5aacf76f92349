use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::AppState;
use crate::broker::{BrokerBridge, CompletionWorker, InMemoryBroker, PubSubTransport};
use crate::channel::{Backend, SessionChannel, split_socket};
use crate::config::{AppConfig, RelayMode};
use crate::llm::{ChatCompletionsClient, UpstreamStream};
use crate::session::{ConversationStore, EvictionHook, EvictionPolicy};

/// Start the relay and serve until Ctrl-C.
pub async fn start_server(config: Arc<AppConfig>) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let state = build_state(&config, &shutdown).await?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    info!(
        name: "server.started",
        address = %addr,
        mode = state.backend.name(),
        "Server started"
    );

    let signal = shutdown.clone();
    axum::serve(listener, build_router(state).into_make_service())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(name: "server.signal_failed", error = %e, "Could not listen for Ctrl-C");
            }
            info!(name: "server.stopping", "Shutdown requested");
            signal.cancel();
        })
        .await
        .context("server failure")?;

    shutdown.cancel();
    info!(name: "server.stopped", "Server stopped");
    Ok(())
}

/// Build the application state for `config`.
///
/// Broker mode runs over an [`InMemoryBroker`]. Background tasks stop when
/// `shutdown` is cancelled.
pub async fn build_state(
    config: &AppConfig,
    shutdown: &CancellationToken,
) -> anyhow::Result<AppState> {
    build_state_with_transport(config, Arc::new(InMemoryBroker::new()), shutdown).await
}

/// Build the application state, using `transport` in broker mode.
pub async fn build_state_with_transport(
    config: &AppConfig,
    transport: Arc<dyn PubSubTransport>,
    shutdown: &CancellationToken,
) -> anyhow::Result<AppState> {
    let settings = config.llm_settings();
    info!(
        name: "llm.config.loaded",
        base_url = %settings.base_url,
        model = %settings.model,
        api_key_set = settings.api_key.is_some(),
        "LLM configuration loaded"
    );
    let upstream: Arc<dyn UpstreamStream> = Arc::new(ChatCompletionsClient::new(settings));

    let policy = config.eviction_policy()?;
    if policy == EvictionPolicy::None {
        warn!(
            name: "session.unbounded",
            "Session eviction is disabled; the store grows for the life of the process"
        );
    }

    let (backend, on_evict) = match config.relay.mode {
        RelayMode::Upstream => (Backend::Upstream(Arc::clone(&upstream)), None),
        RelayMode::Broker => {
            let broker_settings = config.broker_settings();
            if config.broker.embedded_worker {
                let _worker = CompletionWorker::new(
                    Arc::clone(&transport),
                    Arc::clone(&upstream),
                    broker_settings.clone(),
                    config.session.system_prompt.clone(),
                )
                .spawn(shutdown.child_token())
                .await
                .context("failed to start completion worker")?;
            } else {
                warn!(
                    name: "broker.no_worker",
                    "Embedded worker disabled; replies must come from another producer"
                );
            }

            let bridge = BrokerBridge::connect(transport, broker_settings, shutdown.child_token())
                .await
                .context("failed to connect broker bridge")?;
            let released = bridge.clone();
            let hook: EvictionHook = Arc::new(move |ids: &[String]| {
                for id in ids {
                    released.release(id);
                }
            });
            (Backend::Broker(bridge), Some(hook))
        }
    };

    let sessions =
        ConversationStore::with_config(config.session.system_prompt.clone(), policy, on_evict);
    if matches!(policy, EvictionPolicy::Ttl(_)) {
        spawn_sweeper(
            sessions.clone(),
            config.sweep_interval(),
            shutdown.child_token(),
        );
    }

    Ok(AppState { sessions, backend })
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/chat", get(ws_chat))
        .route("/healthz", get(healthz))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Periodically evict idle sessions.
pub fn spawn_sweeper(
    sessions: ConversationStore,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = sessions.sweep();
                    if !evicted.is_empty() {
                        debug!(name: "session.swept", evicted = evicted.len(), "Swept idle sessions");
                    }
                }
            }
        }
    })
}

/// GET /ws/chat - upgrade to a chat connection.
async fn ws_chat(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (source, sink) = split_socket(socket);
    let mut channel = SessionChannel::new(source, sink, state.sessions, state.backend);
    if let Err(e) = channel.run().await {
        debug!(name: "channel.transport_failed", error = %e, "Connection ended by transport error");
    }
}

/// GET /healthz - liveness and session count.
async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "mode": state.backend.name(),
        "sessions": state.sessions.len(),
    }))
}
