//! Barter Candles - real-time candle and market structure engine
//!
//! Turns a stream of exchange trade ticks into multi-timeframe OHLCV candles and derives, per
//! (symbol, timeframe):
//! - Wilder RSI and fast/slow EMA, updated incrementally on every tick
//! - swing pivots, BOS/CHoCH structure breaks and order blocks, mitigated on every tick
//! - regular and hidden RSI divergences between consecutive pivots
//!
//! Finalized candles are appended to a durable log and everything else is recomputed from it on
//! start-up. The [`EngineRegistry`] runs one [`Pipeline`] per pair on its own Tokio task and
//! publishes every [`EngineEvent`] on a broadcast channel.
pub mod candle;
pub mod config;
pub mod divergence;
pub mod error;
pub mod event;
pub mod indicator;
pub mod pivot;
pub mod pipeline;
pub mod registry;
pub mod store;
pub mod structure;
pub mod tick;
pub mod timeframe;

// Re-export commonly used types for convenience
pub use candle::{Candle, CandleAggregator, HistoryBuffer, TickOutcome};
pub use config::{AnalysisConfig, EngineConfig};
pub use divergence::{DivergenceDetector, DivergenceKind, DivergenceMarker};
pub use error::EngineError;
pub use event::{EngineEvent, EngineEventKind, HistorySnapshot};
pub use indicator::{Ema, IndicatorSet, IndicatorValues, Rsi, ema_series, rsi_series};
pub use pipeline::Pipeline;
pub use registry::EngineRegistry;
pub use store::{CandleRecord, CandleStore, FileCandleStore, MemoryCandleStore};
pub use structure::{
    BreakKind, LevelId, LevelKind, StructureBreak, StructureEngine, StructureLevel, Trend,
};
pub use tick::{Tick, parse_tick};
pub use timeframe::Timeframe;
