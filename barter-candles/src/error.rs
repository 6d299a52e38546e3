use crate::timeframe::Timeframe;
use smol_str::SmolStr;
use thiserror::Error;

/// All errors generated in `barter-candles`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to deserialise trade payload: {0}")]
    Deserialise(#[from] serde_json::Error),

    #[error("invalid trade tick: {0}")]
    InvalidTick(String),

    #[error("invalid timeframe: {0}")]
    InvalidTimeframe(String),

    #[error("invalid configuration for {key}: {reason}")]
    Config { key: &'static str, reason: String },

    #[error("malformed candle record on line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no pipeline registered for {symbol} {timeframe}")]
    UnknownPipeline { symbol: SmolStr, timeframe: Timeframe },

    #[error("pipeline worker for {symbol} {timeframe} has shut down")]
    PipelineClosed { symbol: SmolStr, timeframe: Timeframe },
}

impl EngineError {
    /// Determine if an error only affects a single input item (eg/ one trade message or one
    /// persisted line) and processing should simply continue with the next one.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Deserialise(_)
            | EngineError::InvalidTick(_)
            | EngineError::MalformedRecord { .. } => true,
            _ => false,
        }
    }
}
