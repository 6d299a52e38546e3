mod config;
mod feed;
mod server;

use crate::{
    config::ServerConfig,
    feed::{FeedConfig, run_feed},
    server::run_websocket_server,
};
use barter_candles::{EngineConfig, EngineError, EngineRegistry};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Initialize logging
    init_logging();

    info!("Starting barter-candles server");

    if let Err(error) = run().await {
        error!(%error, "barter-candles server failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), EngineError> {
    let server_config = ServerConfig::from_env()?;
    let engine_config =
        EngineConfig::from_env()?.with_event_buffer_size(server_config.ws_buffer_size);

    info!(
        symbols = ?engine_config.symbols,
        timeframes = ?engine_config.timeframes,
        data_dir = ?engine_config.data_dir,
        "engine configuration"
    );
    info!("WebSocket broadcast buffer size: {}", server_config.ws_buffer_size);

    // Pipelines restore from the candle log before any client or trade is accepted
    let registry = Arc::new(EngineRegistry::init(&engine_config)?);

    let listener = TcpListener::bind(server_config.ws_addr).await?;
    let server_task = tokio::spawn(run_websocket_server(listener, registry.clone()));
    info!("Clients can connect to receive real-time candle and structure events");

    let feed_config = FeedConfig {
        url: server_config.stream_url(&engine_config.symbols)?,
        read_timeout: server_config.read_timeout,
        reconnect_initial: server_config.reconnect_initial,
        reconnect_max: server_config.reconnect_max,
    };
    let (tick_tx, mut tick_rx) = mpsc::channel(server_config.tick_buffer_size);
    let feed_task = tokio::spawn(run_feed(feed_config, tick_tx));

    loop {
        tokio::select! {
            tick = tick_rx.recv() => match tick {
                Some(tick) => {
                    registry.dispatch(tick);
                }
                None => {
                    warn!("trade feed stopped");
                    break;
                }
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    error!(%error, "failed to listen for shutdown signal");
                }
                info!("Shutdown requested");
                break;
            }
        }
    }

    feed_task.abort();
    server_task.abort();
    let _ = server_task.await;

    // Clients only hold weak handles, a strong one exists only while a history request runs
    match Arc::try_unwrap(registry) {
        Ok(registry) => registry.shutdown().await,
        Err(_) => warn!("history request in flight, skipping graceful pipeline shutdown"),
    }

    Ok(())
}

/// Initialize logging, `LOG_FORMAT=json` switches to JSON lines.
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}
