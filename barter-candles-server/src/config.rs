use barter_candles::EngineError;
use smol_str::SmolStr;
use std::{net::SocketAddr, str::FromStr, time::Duration};
use url::Url;

/// Server configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address the client WebSocket server binds to
    pub ws_addr: SocketAddr,
    /// Event broadcast buffer size, lagging clients skip messages beyond this
    pub ws_buffer_size: usize,
    /// Trade feed base URL, eg/ wss://fstream.binance.com
    pub feed_url: String,
    /// Reconnect when no frame arrives within this window
    pub read_timeout: Duration,
    /// First reconnect delay, doubled after every failed attempt
    pub reconnect_initial: Duration,
    /// Upper bound of the reconnect delay
    pub reconnect_max: Duration,
    /// Parsed ticks buffered between the feed and the engine
    pub tick_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_addr: SocketAddr::from(([0, 0, 0, 0], 9001)),
            ws_buffer_size: 10_000,
            feed_url: "wss://fstream.binance.com".to_string(),
            read_timeout: Duration::from_secs(120),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            tick_buffer_size: 10_000,
        }
    }
}

impl ServerConfig {
    /// Build from `WS_ADDR`, `WS_BUFFER_SIZE`, `FEED_URL` and `FEED_READ_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let ws_addr = parse_or(&lookup, "WS_ADDR", defaults.ws_addr)?;
        let ws_buffer_size = parse_or(&lookup, "WS_BUFFER_SIZE", defaults.ws_buffer_size)?;
        let feed_url = match lookup("FEED_URL") {
            Some(raw) => parse_feed_url(raw.trim())?.to_string(),
            None => defaults.feed_url.clone(),
        };
        let read_timeout = parse_or(
            &lookup,
            "FEED_READ_TIMEOUT_SECS",
            defaults.read_timeout.as_secs(),
        )?;

        if ws_buffer_size == 0 {
            return Err(EngineError::Config {
                key: "WS_BUFFER_SIZE",
                reason: "must be greater than zero".to_string(),
            });
        }
        if read_timeout == 0 {
            return Err(EngineError::Config {
                key: "FEED_READ_TIMEOUT_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            ws_addr,
            ws_buffer_size,
            feed_url,
            read_timeout: Duration::from_secs(read_timeout),
            ..defaults
        })
    }

    /// Combined aggTrade stream URL for the given symbols:
    /// `<feed_url>/stream?streams=btcusdt@aggTrade/ethusdt@aggTrade`.
    pub fn stream_url(&self, symbols: &[SmolStr]) -> Result<Url, EngineError> {
        if symbols.is_empty() {
            return Err(EngineError::Config {
                key: "CANDLE_SYMBOLS",
                reason: "no symbols to subscribe to".to_string(),
            });
        }

        let streams = symbols
            .iter()
            .map(|symbol| format!("{}@aggTrade", symbol.to_lowercase()))
            .collect::<Vec<_>>()
            .join("/");

        let mut url = parse_feed_url(&self.feed_url)?;
        url.set_path("/stream");
        url.set_query(Some(&format!("streams={streams}")));
        Ok(url)
    }
}

fn parse_feed_url(raw: &str) -> Result<Url, EngineError> {
    Url::parse(raw).map_err(|error| EngineError::Config {
        key: "FEED_URL",
        reason: format!("'{raw}': {error}"),
    })
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, EngineError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|error| EngineError::Config {
                key,
                reason: format!("'{raw}': {error}"),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.ws_addr.to_string(), "0.0.0.0:9001");
        assert_eq!(config.read_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_config_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("WS_ADDR", "127.0.0.1:9100"),
            ("WS_BUFFER_SIZE", "500"),
            ("FEED_URL", "wss://stream.binance.com:9443"),
            ("FEED_READ_TIMEOUT_SECS", "30"),
        ]))
        .unwrap();

        assert_eq!(config.ws_addr.port(), 9100);
        assert_eq!(config.ws_buffer_size, 500);
        assert_eq!(config.feed_url, "wss://stream.binance.com:9443/");
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert_eq!(config.reconnect_max, ServerConfig::default().reconnect_max);
    }

    #[test]
    fn test_config_rejects_invalid_values() {
        struct TestCase {
            input: (&'static str, &'static str),
            expected: &'static str,
        }

        let tests = vec![
            TestCase {
                // TC0: not a socket address
                input: ("WS_ADDR", "localhost"),
                expected: "WS_ADDR",
            },
            TestCase {
                // TC1: zero buffer
                input: ("WS_BUFFER_SIZE", "0"),
                expected: "WS_BUFFER_SIZE",
            },
            TestCase {
                // TC2: relative url
                input: ("FEED_URL", "fstream.binance.com"),
                expected: "FEED_URL",
            },
            TestCase {
                // TC3: negative timeout
                input: ("FEED_READ_TIMEOUT_SECS", "-1"),
                expected: "FEED_READ_TIMEOUT_SECS",
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            match ServerConfig::from_lookup(lookup(&[test.input])) {
                Err(EngineError::Config { key, .. }) => {
                    assert_eq!(key, test.expected, "TC{} failed", index)
                }
                other => panic!("TC{index} expected config error, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_stream_url() {
        let config = ServerConfig::default();
        let url = config
            .stream_url(&[SmolStr::new("btcusdt"), SmolStr::new("ETHUSDT")])
            .unwrap();

        assert_eq!(
            url.as_str(),
            "wss://fstream.binance.com/stream?streams=btcusdt@aggTrade/ethusdt@aggTrade"
        );
        assert!(config.stream_url(&[]).is_err());
    }
}
