use crate::candle::HistoryBuffer;
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Number of candles required on each side of a pivot.
pub const PIVOT_WING: usize = 2;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, Deserialize, Serialize)]
pub enum PivotKind {
    High,
    Low,
}

/// Confirmed swing pivot.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct Pivot {
    pub kind: PivotKind,
    /// Absolute close sequence number of the pivot candle.
    pub index: u64,
    pub time: i64,
    pub price: f64,
    pub rsi: f64,
}

/// Pivots confirmed by the most recent close.
///
/// The candidate is the candle [`PIVOT_WING`] positions before the newest finalized candle; its
/// high (low) must be strictly greater (less) than the highs (lows) of the two candles on either
/// side. Both a high and a low pivot may be confirmed on the same candle (outside bar).
pub fn confirmed_pivots(history: &HistoryBuffer) -> Vec<Pivot> {
    let len = history.len();
    if len < PIVOT_WING * 2 + 1 {
        return Vec::new();
    }

    let centre = len - 1 - PIVOT_WING;
    let Some(candidate) = history.get(centre) else {
        return Vec::new();
    };

    let neighbours = (centre - PIVOT_WING..=centre + PIVOT_WING)
        .filter(|position| *position != centre)
        .filter_map(|position| history.get(position))
        .collect::<Vec<_>>();

    let mut pivots = Vec::with_capacity(2);

    if neighbours.iter().all(|other| candidate.high > other.high) {
        pivots.push(Pivot {
            kind: PivotKind::High,
            index: history.sequence(centre),
            time: candidate.start_time,
            price: candidate.high,
            rsi: candidate.rsi,
        });
    }

    if neighbours.iter().all(|other| candidate.low < other.low) {
        pivots.push(Pivot {
            kind: PivotKind::Low,
            index: history.sequence(centre),
            time: candidate.start_time,
            price: candidate.low,
            rsi: candidate.rsi,
        });
    }

    pivots
}
