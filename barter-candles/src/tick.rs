//! Trade tick normalisation.
//!
//! Parses exchange `aggTrade` payloads (raw or wrapped in a combined-stream envelope) into a
//! validated [`Tick`]. Anything that does not parse or fails the shape checks is rejected with a
//! recoverable [`EngineError`] so the ingestion loop can log and drop it.

use crate::error::EngineError;
use serde::{Deserialize, Deserializer, Serialize};
use smol_str::SmolStr;
use std::{borrow::Cow, str::FromStr};

/// Normalised trade tick.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Tick {
    /// Lower-cased market symbol (eg/ "btcusdt").
    pub symbol: SmolStr,
    pub price: f64,
    pub quantity: f64,
    /// Exchange trade time in epoch milliseconds.
    pub time_ms: i64,
}

impl Tick {
    /// Construct a validated [`Tick`].
    pub fn new(
        symbol: impl AsRef<str>,
        price: f64,
        quantity: f64,
        time_ms: i64,
    ) -> Result<Self, EngineError> {
        if !price.is_finite() || price <= 0.0 {
            return Err(EngineError::InvalidTick(format!(
                "price must be positive and finite, got {price}"
            )));
        }
        if !quantity.is_finite() || quantity < 0.0 {
            return Err(EngineError::InvalidTick(format!(
                "quantity must be non-negative and finite, got {quantity}"
            )));
        }
        if time_ms <= 0 {
            return Err(EngineError::InvalidTick(format!(
                "event time must be positive, got {time_ms}"
            )));
        }

        let symbol = symbol.as_ref().trim();
        if symbol.is_empty() {
            return Err(EngineError::InvalidTick("symbol is empty".to_string()));
        }

        Ok(Self {
            symbol: SmolStr::new(symbol.to_ascii_lowercase()),
            price,
            quantity,
            time_ms,
        })
    }

    /// Trade time truncated to whole seconds.
    pub fn second(&self) -> i64 {
        self.time_ms.div_euclid(1000)
    }
}

/// ### Raw Payload Examples
/// Aggregated trade:
///```json
/// {
///     "e": "aggTrade",
///     "E": 123456789,
///     "s": "BTCUSDT",
///     "a": 5933014,
///     "p": "0.001",
///     "q": "100",
///     "f": 100,
///     "l": 105,
///     "T": 123456785,
///     "m": true
/// }
/// ```
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct AggTrade {
    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "p", deserialize_with = "de_str")]
    pub price: f64,

    #[serde(rename = "q", deserialize_with = "de_str")]
    pub quantity: f64,

    #[serde(rename = "T")]
    pub time_ms: i64,
}

/// Messages received on a trade stream connection.
#[derive(Clone, PartialEq, Debug, Deserialize)]
#[serde(untagged)]
pub enum TradeMessage {
    /// Combined stream envelope: `{"stream":"btcusdt@aggTrade","data":{..}}`.
    Combined { stream: String, data: AggTrade },
    Raw(AggTrade),
}

impl TradeMessage {
    fn into_trade(self) -> AggTrade {
        match self {
            TradeMessage::Combined { data, .. } => data,
            TradeMessage::Raw(trade) => trade,
        }
    }
}

impl TryFrom<AggTrade> for Tick {
    type Error = EngineError;

    fn try_from(trade: AggTrade) -> Result<Self, Self::Error> {
        Tick::new(&trade.symbol, trade.price, trade.quantity, trade.time_ms)
    }
}

/// Parse a single text frame from the trade feed into a validated [`Tick`].
pub fn parse_tick(payload: &str) -> Result<Tick, EngineError> {
    serde_json::from_str::<TradeMessage>(payload)?
        .into_trade()
        .try_into()
}

/// Deserialize a `String` as the desired type.
fn de_str<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let data: Cow<'de, str> = Deserialize::deserialize(deserializer)?;
    data.parse::<T>().map_err(serde::de::Error::custom)
}
