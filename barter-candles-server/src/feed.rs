//! Exchange trade feed with automatic reconnection
//!
//! Connects to the combined aggTrade stream, parses every text frame into a [`Tick`] and forwards
//! it to the engine. Transport failures only ever affect this task: it reconnects with
//! exponential backoff and pipelines keep their state across reconnects.

use barter_candles::{Tick, parse_tick};
use futures::StreamExt;
use std::time::Duration;
use tokio::{sync::mpsc, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

/// Trade feed configuration
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: Url,
    pub read_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

/// Exponential reconnect delay: `initial`, doubling per failure up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Called after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Why a connected session ended.
#[derive(Debug)]
enum SessionEnd {
    /// Engine side dropped the tick receiver, stop for good.
    ReceiverDropped,
    /// Connection lost, reconnect.
    Disconnected,
}

/// Run the feed until the tick receiver is dropped.
pub async fn run_feed(config: FeedConfig, tick_tx: mpsc::Sender<Tick>) {
    info!(url = %config.url, "starting trade feed");
    let mut backoff = Backoff::new(config.reconnect_initial, config.reconnect_max);

    loop {
        match connect_async(config.url.as_str()).await {
            Ok((ws_stream, _)) => {
                info!(url = %config.url, "connected to trade feed");
                backoff.reset();

                let (_, read) = ws_stream.split();
                let end = read_session(read, &config, &tick_tx).await;

                if let SessionEnd::ReceiverDropped = end {
                    info!("tick receiver dropped, stopping trade feed");
                    return;
                }
            }
            Err(error) => {
                error!(url = %config.url, %error, "failed to connect to trade feed");
            }
        }

        let delay = backoff.next_delay();
        warn!(?delay, "trade feed disconnected, waiting before reconnecting");
        tokio::time::sleep(delay).await;
    }
}

async fn read_session<S, E>(
    mut read: S,
    config: &FeedConfig,
    tick_tx: &mpsc::Sender<Tick>,
) -> SessionEnd
where
    S: futures::Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    loop {
        let message = match timeout(config.read_timeout, read.next()).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                info!("trade feed stream ended");
                return SessionEnd::Disconnected;
            }
            Err(_) => {
                warn!(timeout = ?config.read_timeout, "no data from trade feed, reconnecting");
                return SessionEnd::Disconnected;
            }
        };

        match message {
            Ok(Message::Text(text)) => match parse_tick(&text) {
                Ok(tick) => {
                    if tick_tx.send(tick).await.is_err() {
                        return SessionEnd::ReceiverDropped;
                    }
                }
                Err(error) => {
                    // Subscription acks and other non-trade frames end up here as well
                    debug!(%error, payload = %text.as_str(), "dropping unparsable trade frame");
                }
            },
            Ok(Message::Close(frame)) => {
                info!(?frame, "trade feed closed connection");
                return SessionEnd::Disconnected;
            }
            Ok(_) => {
                // Ping/Pong handled by tungstenite
            }
            Err(error) => {
                error!(%error, "trade feed error");
                return SessionEnd::Disconnected;
            }
        }
    }
}
