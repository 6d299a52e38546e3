//! Outbound pipeline events and history snapshots.
//!
//! Serialised as `{"symbol":..,"timeframe":..,"type":..,"data":..}` where `type` is one of
//! `tick-update`, `closed`, `structure-add`, `structure-remove`, `structure-break` or
//! `divergence-new`.

use crate::{
    candle::Candle,
    divergence::DivergenceMarker,
    structure::{LevelId, StructureBreak, StructureLevel},
    timeframe::Timeframe,
};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EngineEvent {
    pub symbol: SmolStr,
    pub timeframe: Timeframe,
    #[serde(flatten)]
    pub kind: EngineEventKind,
}

impl EngineEvent {
    pub fn new(symbol: SmolStr, timeframe: Timeframe, kind: EngineEventKind) -> Self {
        Self {
            symbol,
            timeframe,
            kind,
        }
    }

    /// Event `type` tag as sent on the wire.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EngineEventKind::TickUpdate(_) => "tick-update",
            EngineEventKind::Closed(_) => "closed",
            EngineEventKind::StructureAdd(_) => "structure-add",
            EngineEventKind::StructureRemove { .. } => "structure-remove",
            EngineEventKind::StructureBreak(_) => "structure-break",
            EngineEventKind::DivergenceNew(_) => "divergence-new",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum EngineEventKind {
    /// Live candle after a tick was folded in.
    TickUpdate(Candle),
    /// Candle finalized when a later bucket opened.
    Closed(Candle),
    StructureAdd(StructureLevel),
    /// Ids of every level mitigated by a single trade.
    StructureRemove { ids: Vec<LevelId> },
    StructureBreak(StructureBreak),
    DivergenceNew(DivergenceMarker),
}

/// Point-in-time copy of one pipeline's state.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HistorySnapshot {
    pub symbol: SmolStr,
    pub timeframe: Timeframe,
    /// Finalized candles, oldest first.
    pub candles: Vec<Candle>,
    pub live: Option<Candle>,
    pub levels: Vec<StructureLevel>,
    pub breaks: Vec<StructureBreak>,
    pub divergences: Vec<DivergenceMarker>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{divergence::DivergenceKind, structure::LevelKind};
    use serde_json::json;

    fn event(kind: EngineEventKind) -> EngineEvent {
        EngineEvent::new(SmolStr::new("btcusdt"), Timeframe::MINUTE, kind)
    }

    #[test]
    fn test_engine_event_serialisation() {
        struct TestCase {
            input: EngineEvent,
            expected: serde_json::Value,
        }

        let tests = vec![
            TestCase {
                // TC0: structure-remove carries all ids
                input: event(EngineEventKind::StructureRemove { ids: vec![3, 7] }),
                expected: json!({
                    "symbol": "btcusdt",
                    "timeframe": "1m",
                    "type": "structure-remove",
                    "data": { "ids": [3, 7] }
                }),
            },
            TestCase {
                // TC1: structure-add
                input: event(EngineEventKind::StructureAdd(StructureLevel {
                    id: 1,
                    kind: LevelKind::BullOrderBlock,
                    top: 101.5,
                    bottom: 99.0,
                    created_at: 120,
                })),
                expected: json!({
                    "symbol": "btcusdt",
                    "timeframe": "1m",
                    "type": "structure-add",
                    "data": {
                        "id": 1,
                        "kind": "BullOrderBlock",
                        "top": 101.5,
                        "bottom": 99.0,
                        "created_at": 120
                    }
                }),
            },
            TestCase {
                // TC2: divergence-new
                input: event(EngineEventKind::DivergenceNew(DivergenceMarker {
                    time: 420,
                    kind: DivergenceKind::RegularBearish,
                    price: 6.0,
                    rsi: 60.0,
                })),
                expected: json!({
                    "symbol": "btcusdt",
                    "timeframe": "1m",
                    "type": "divergence-new",
                    "data": { "time": 420, "kind": "RegularBearish", "price": 6.0, "rsi": 60.0 }
                }),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = serde_json::to_value(&test.input).unwrap();
            assert_eq!(actual, test.expected, "TC{} failed", index);
            assert_eq!(
                actual["type"],
                test.input.kind_name(),
                "TC{} kind_name failed",
                index
            );
        }
    }

    #[test]
    fn test_candle_event_absent_ema_is_null() {
        let candle = Candle {
            symbol: SmolStr::new("btcusdt"),
            timeframe: Timeframe::SECOND,
            start_time: 100,
            open: 10.0,
            high: 10.0,
            low: 10.0,
            close: 10.0,
            volume: 2.0,
            rsi: 50.0,
            ema_fast: None,
            ema_slow: None,
        };
        let closed = EngineEvent::new(
            SmolStr::new("btcusdt"),
            Timeframe::SECOND,
            EngineEventKind::Closed(candle),
        );

        let value = serde_json::to_value(&closed).unwrap();
        assert_eq!(value["type"], "closed");
        assert_eq!(value["timeframe"], "1s");
        assert_eq!(value["data"]["start_time"], 100);
        assert!(value["data"]["ema_fast"].is_null());

        let decoded = serde_json::from_value::<EngineEvent>(value).unwrap();
        assert_eq!(decoded, closed);
    }
}
