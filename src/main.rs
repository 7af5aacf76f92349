//! Chat relay server
//!
//! Entry point: loads configuration, initializes logging and serves the
//! relay until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use mimalloc::MiMalloc;
use tracing::info;

use chat_relay::config::AppConfig;
use chat_relay::{server, telemetry};

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present)
    let _ = dotenvy::dotenv();

    telemetry::init();

    let config = AppConfig::load().context("failed to load configuration")?;
    info!(
        name: "config.loaded",
        mode = ?config.relay.mode,
        port = config.server.port,
        eviction = ?config.session.eviction,
        "Configuration loaded"
    );

    server::start_server(Arc::new(config)).await
}
