//! Price/RSI divergence detection between consecutive same-type pivots.

use crate::{
    candle::HistoryBuffer,
    pivot::{Pivot, PivotKind, confirmed_pivots},
};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// Confirmed pivots retained per side; only the most recent is compared against.
const PIVOT_MEMORY: usize = 16;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, Deserialize, Serialize)]
pub enum DivergenceKind {
    RegularBearish,
    HiddenBearish,
    RegularBullish,
    HiddenBullish,
}

/// Divergence marker, stamped with the second pivot of the pair.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DivergenceMarker {
    pub time: i64,
    pub kind: DivergenceKind,
    pub price: f64,
    pub rsi: f64,
}

#[derive(Debug, Clone)]
pub struct DivergenceDetector {
    highs: VecDeque<Pivot>,
    lows: VecDeque<Pivot>,
    /// Most recent emitted markers, used both as the query buffer and for de-duplication.
    markers: VecDeque<DivergenceMarker>,
    lookback: u64,
    memory: usize,
}

impl DivergenceDetector {
    pub fn new(lookback: u64, memory: usize) -> Self {
        let memory = memory.max(1);
        Self {
            highs: VecDeque::with_capacity(PIVOT_MEMORY),
            lows: VecDeque::with_capacity(PIVOT_MEMORY),
            markers: VecDeque::with_capacity(memory),
            lookback,
            memory,
        }
    }

    /// Process the newest finalized candle, returning newly emitted markers.
    pub fn on_close(&mut self, history: &HistoryBuffer) -> Vec<DivergenceMarker> {
        confirmed_pivots(history)
            .into_iter()
            .filter_map(|pivot| self.on_pivot(pivot))
            .collect()
    }

    /// Compare a newly confirmed pivot with the preceding pivot of the same kind.
    pub fn on_pivot(&mut self, pivot: Pivot) -> Option<DivergenceMarker> {
        let pivots = match pivot.kind {
            PivotKind::High => &mut self.highs,
            PivotKind::Low => &mut self.lows,
        };

        // Same pivot re-confirmed (eg/ replayed close) is not a new pair
        if pivots.back().is_some_and(|last| last.index >= pivot.index) {
            return None;
        }

        let previous = pivots.back().copied();
        if pivots.len() >= PIVOT_MEMORY {
            pivots.pop_front();
        }
        pivots.push_back(pivot);

        let previous = previous.filter(|prev| pivot.index - prev.index <= self.lookback)?;
        let kind = classify(&previous, &pivot)?;

        let marker = DivergenceMarker {
            time: pivot.time,
            kind,
            price: pivot.price,
            rsi: pivot.rsi,
        };

        let duplicate = self
            .markers
            .iter()
            .any(|emitted| emitted.time == marker.time && emitted.kind == marker.kind);
        if duplicate {
            return None;
        }

        debug!(?marker, "divergence detected");
        if self.markers.len() >= self.memory {
            self.markers.pop_front();
        }
        self.markers.push_back(marker.clone());

        Some(marker)
    }

    pub fn markers(&self) -> Vec<DivergenceMarker> {
        self.markers.iter().cloned().collect()
    }
}

fn classify(previous: &Pivot, current: &Pivot) -> Option<DivergenceKind> {
    let price_higher = current.price > previous.price;
    let price_lower = current.price < previous.price;
    let rsi_higher = current.rsi > previous.rsi;
    let rsi_lower = current.rsi < previous.rsi;

    match current.kind {
        PivotKind::High if price_higher && rsi_lower => Some(DivergenceKind::RegularBearish),
        PivotKind::High if price_lower && rsi_higher => Some(DivergenceKind::HiddenBearish),
        PivotKind::Low if price_lower && rsi_higher => Some(DivergenceKind::RegularBullish),
        PivotKind::Low if price_higher && rsi_lower => Some(DivergenceKind::HiddenBullish),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pivot::test_utils::bar;

    fn pivot(kind: PivotKind, index: u64, price: f64, rsi: f64) -> Pivot {
        Pivot {
            kind,
            index,
            time: index as i64 * 60,
            price,
            rsi,
        }
    }

    #[test]
    fn test_classify_pivot_pairs() {
        struct TestCase {
            input: (Pivot, Pivot),
            expected: Option<DivergenceKind>,
        }

        let tests = vec![
            TestCase {
                // TC0: higher high, lower rsi
                input: (
                    pivot(PivotKind::High, 1, 10.0, 70.0),
                    pivot(PivotKind::High, 9, 11.0, 60.0),
                ),
                expected: Some(DivergenceKind::RegularBearish),
            },
            TestCase {
                // TC1: lower high, higher rsi
                input: (
                    pivot(PivotKind::High, 1, 10.0, 60.0),
                    pivot(PivotKind::High, 9, 9.0, 70.0),
                ),
                expected: Some(DivergenceKind::HiddenBearish),
            },
            TestCase {
                // TC2: lower low, higher rsi
                input: (pivot(PivotKind::Low, 1, 10.0, 30.0), pivot(PivotKind::Low, 9, 9.0, 35.0)),
                expected: Some(DivergenceKind::RegularBullish),
            },
            TestCase {
                // TC3: higher low, lower rsi
                input: (pivot(PivotKind::Low, 1, 10.0, 35.0), pivot(PivotKind::Low, 9, 11.0, 30.0)),
                expected: Some(DivergenceKind::HiddenBullish),
            },
            TestCase {
                // TC4: price and rsi agree
                input: (
                    pivot(PivotKind::High, 1, 10.0, 60.0),
                    pivot(PivotKind::High, 9, 11.0, 70.0),
                ),
                expected: None,
            },
            TestCase {
                // TC5: equal price is not a divergence
                input: (
                    pivot(PivotKind::High, 1, 10.0, 70.0),
                    pivot(PivotKind::High, 9, 10.0, 60.0),
                ),
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let (previous, current) = test.input;
            let actual = classify(&previous, &current);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_regular_bearish_emitted_once_at_second_pivot() {
        let mut detector = DivergenceDetector::new(60, 50);
        let mut history = HistoryBuffer::new(100);

        // Pivot highs at index 2 (5.0, rsi 70) and index 7 (6.0, rsi 60)
        let highs = [1.0, 2.0, 5.0, 2.0, 1.0, 1.0, 2.0, 6.0, 2.0, 1.0, 1.0, 1.0];
        let rsi = |index: usize| match index {
            2 => 70.0,
            7 => 60.0,
            _ => 50.0,
        };

        let mut emitted = Vec::new();
        for (index, high) in highs.iter().enumerate() {
            history.push(bar(index as i64, high - 0.5, *high, high - 0.5, *high, rsi(index)));
            emitted.extend(detector.on_close(&history));

            // Re-running the same close must not emit again
            assert!(detector.on_close(&history).is_empty());
        }

        assert_eq!(
            emitted,
            vec![DivergenceMarker {
                time: 7 * 60,
                kind: DivergenceKind::RegularBearish,
                price: 6.0,
                rsi: 60.0,
            }]
        );
        assert_eq!(detector.markers().len(), 1);
    }

    #[test]
    fn test_pivots_beyond_lookback_are_not_paired() {
        let mut detector = DivergenceDetector::new(60, 50);

        assert!(detector.on_pivot(pivot(PivotKind::High, 0, 10.0, 70.0)).is_none());
        assert!(detector.on_pivot(pivot(PivotKind::High, 61, 11.0, 60.0)).is_none());

        // Within 60 of the previous high
        assert_eq!(
            detector
                .on_pivot(pivot(PivotKind::High, 121, 12.0, 50.0))
                .map(|marker| marker.kind),
            Some(DivergenceKind::RegularBearish)
        );
    }

    #[test]
    fn test_marker_dedup_by_time_and_kind() {
        let mut detector = DivergenceDetector::new(60, 50);
        detector.on_pivot(pivot(PivotKind::Low, 0, 10.0, 30.0));
        let first = detector.on_pivot(pivot(PivotKind::Low, 5, 9.0, 35.0));
        assert!(first.is_some());

        // A replayed detector state that pairs into the same (time, kind) is suppressed
        detector.lows.clear();
        detector.on_pivot(pivot(PivotKind::Low, 1, 10.0, 30.0));
        assert!(detector.on_pivot(pivot(PivotKind::Low, 5, 9.0, 35.0)).is_none());
        assert_eq!(detector.markers().len(), 1);
    }

    #[test]
    fn test_marker_buffer_is_bounded() {
        let mut detector = DivergenceDetector::new(60, 3);
        detector.on_pivot(pivot(PivotKind::High, 0, 1.0, 90.0));

        for index in 1..=5_u64 {
            let price = 1.0 + index as f64;
            let rsi = 90.0 - index as f64;
            assert!(detector.on_pivot(pivot(PivotKind::High, index, price, rsi)).is_some());
        }

        let markers = detector.markers();
        assert_eq!(markers.len(), 3);
        assert_eq!(markers[0].time, 3 * 60);
    }
}
