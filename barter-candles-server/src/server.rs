//! Client facing WebSocket server
//!
//! Every client receives a welcome message and then the engine event stream, optionally
//! filtered by a `subscribe` request. `history` requests are answered with a consistent
//! snapshot of one pipeline.

use barter_candles::{EngineEvent, EngineRegistry, HistorySnapshot, Timeframe};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc, watch},
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Replies queued per client before its receive task is back-pressured.
const REPLY_BUFFER_SIZE: usize = 64;

/// Requests a client may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Filter the event stream, a missing field matches everything.
    Subscribe {
        symbol: Option<String>,
        timeframe: Option<Timeframe>,
    },
    History {
        symbol: String,
        timeframe: Timeframe,
    },
}

/// Messages sent to a client besides the engine events themselves.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Welcome {
        message: String,
        timestamp: DateTime<Utc>,
        pipelines: Vec<String>,
    },
    Subscribed {
        symbol: Option<SmolStr>,
        timeframe: Option<Timeframe>,
    },
    History {
        data: HistorySnapshot,
    },
    Error {
        message: String,
    },
}

/// Event filter of one client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subscription {
    pub symbol: Option<SmolStr>,
    pub timeframe: Option<Timeframe>,
}

impl Subscription {
    pub fn new(symbol: Option<&str>, timeframe: Option<Timeframe>) -> Self {
        Self {
            symbol: symbol.map(|symbol| SmolStr::new(symbol.trim().to_ascii_lowercase())),
            timeframe,
        }
    }

    pub fn matches(&self, event: &EngineEvent) -> bool {
        self.symbol
            .as_ref()
            .is_none_or(|symbol| *symbol == event.symbol)
            && self
                .timeframe
                .is_none_or(|timeframe| timeframe == event.timeframe)
    }
}

/// Accept clients until the listener fails.
///
/// Clients only hold a [`Weak`] handle to the registry, so once this task stops the owner can
/// reclaim the registry for a graceful shutdown while clients are still connected.
pub async fn run_websocket_server(listener: TcpListener, registry: Arc<EngineRegistry>) {
    match listener.local_addr() {
        Ok(addr) => info!("WebSocket server listening on ws://{}", addr),
        Err(error) => warn!(%error, "WebSocket server listening on unknown address"),
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                info!("New WebSocket connection from {}", peer_addr);
                tokio::spawn(handle_client(stream, peer_addr, Arc::downgrade(&registry)));
            }
            Err(error) => {
                error!(%error, "failed to accept WebSocket connection");
                return;
            }
        }
    }
}

/// Handle individual WebSocket client connection
async fn handle_client(stream: TcpStream, peer_addr: SocketAddr, registry: Weak<EngineRegistry>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", peer_addr, e);
            return;
        }
    };

    info!("WebSocket handshake completed for {}", peer_addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerMessage>(REPLY_BUFFER_SIZE);
    let (subscription_tx, subscription_rx) = watch::channel(Subscription::default());

    let Some((mut events, welcome)) = registry.upgrade().map(|registry| {
        let welcome = ServerMessage::Welcome {
            message: "Connected to barter-candles engine".to_string(),
            timestamp: Utc::now(),
            pipelines: registry
                .keys()
                .into_iter()
                .map(|(symbol, timeframe)| format!("{symbol}@{timeframe}"))
                .collect(),
        };
        (registry.subscribe(), welcome)
    }) else {
        info!("Engine shutting down, closing connection from {}", peer_addr);
        return;
    };
    if let Ok(msg) = serde_json::to_string(&welcome) {
        let _ = ws_sender.send(Message::Text(msg.into())).await;
    }

    // Events and replies share the single sink
    let mut send_task = tokio::spawn(async move {
        loop {
            let json = tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        if !subscription_rx.borrow().matches(&event) {
                            continue;
                        }
                        serde_json::to_string(&event)
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Slow clients skip events rather than being disconnected
                        warn!("Client {} lagged, skipped {} events", peer_addr, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Event channel closed for {}", peer_addr);
                        break;
                    }
                },
                reply = reply_rx.recv() => match reply {
                    Some(reply) => serde_json::to_string(&reply),
                    None => break,
                },
            };

            match json {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("Failed to serialise message for {}: {}", peer_addr, e),
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) => {
                    debug!("Received ping from {}", peer_addr);
                }
                Ok(Message::Text(text)) => {
                    let reply = match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(request) => respond(&registry, &subscription_tx, request).await,
                        Err(e) => {
                            debug!("Invalid request from {}: {}", peer_addr, e);
                            ServerMessage::Error {
                                message: format!("invalid request: {e}"),
                            }
                        }
                    };
                    if reply_tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("WebSocket error for {}: {}", peer_addr, e);
                    break;
                }
                _ => {}
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => {
            info!("Send task completed for {}", peer_addr);
            recv_task.abort();
        }
        _ = &mut recv_task => {
            info!("Receive task completed for {}", peer_addr);
            send_task.abort();
        }
    }

    info!("WebSocket connection closed for {}", peer_addr);
}

async fn respond(
    registry: &Weak<EngineRegistry>,
    subscription_tx: &watch::Sender<Subscription>,
    request: ClientMessage,
) -> ServerMessage {
    match request {
        ClientMessage::Subscribe { symbol, timeframe } => {
            let subscription = Subscription::new(symbol.as_deref(), timeframe);
            subscription_tx.send_replace(subscription.clone());
            ServerMessage::Subscribed {
                symbol: subscription.symbol,
                timeframe: subscription.timeframe,
            }
        }
        ClientMessage::History { symbol, timeframe } => {
            let Some(registry) = registry.upgrade() else {
                return ServerMessage::Error {
                    message: "engine is shutting down".to_string(),
                };
            };
            match registry.snapshot(&symbol, timeframe).await {
                Ok(data) => ServerMessage::History { data },
                Err(error) => ServerMessage::Error {
                    message: error.to_string(),
                },
            }
        }
    }
}
