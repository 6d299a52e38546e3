//! Tick to OHLCV candle aggregation
//!
//! Aggregates trade ticks into timeframe-aligned candles and keeps a bounded history of
//! finalized candles. Uses tick timestamps (not wall clock) for candle boundaries, so a candle
//! only closes when a tick from a later bucket arrives.

use crate::{
    indicator::{IndicatorSet, IndicatorValues},
    timeframe::Timeframe,
};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{collections::VecDeque, fmt};

/// A single OHLCV candle with the indicator values computed at its latest close.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Candle {
    pub symbol: SmolStr,
    pub timeframe: Timeframe,
    /// Bucket start in unix seconds, aligned to the timeframe grid.
    pub start_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub rsi: f64,
    pub ema_fast: Option<f64>,
    pub ema_slow: Option<f64>,
}

impl Candle {
    fn open_with(
        symbol: SmolStr,
        timeframe: Timeframe,
        start_time: i64,
        price: f64,
        quantity: f64,
        indicators: IndicatorValues,
    ) -> Self {
        let mut candle = Self {
            symbol,
            timeframe,
            start_time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: quantity,
            rsi: 0.0,
            ema_fast: None,
            ema_slow: None,
        };
        candle.set_indicators(indicators);
        candle
    }

    fn apply_trade(&mut self, price: f64, quantity: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += quantity;
    }

    pub(crate) fn set_indicators(&mut self, values: IndicatorValues) {
        self.rsi = values.rsi;
        self.ema_fast = values.ema_fast;
        self.ema_slow = values.ema_slow;
    }

    /// Down candle (close below open).
    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    /// Up candle (close above open).
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }
}

impl fmt::Display for Candle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = DateTime::from_timestamp(self.start_time, 0)
            .map(|time| time.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| self.start_time.to_string());
        let direction = if self.close >= self.open { "▲" } else { "▼" };

        write!(
            f,
            "[{time}] {direction} O:{:.2} | H:{:.2} | L:{:.2} | C:{:.2} | Vol:{:.3}",
            self.open, self.high, self.low, self.close, self.volume
        )
    }
}

/// Result of feeding one tick into a [`CandleAggregator`].
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// First tick after Empty opened a live candle.
    Opened,
    /// Tick folded into the live candle.
    Updated,
    /// Tick crossed into a later bucket: the previous live candle was finalized and a new one
    /// opened with the triggering tick.
    Rolled(Candle),
    /// Tick belongs to an earlier or already finalized bucket and was ignored.
    Stale,
}

/// Aggregates ticks into timeframe aligned OHLCV candles
/// Uses tick timestamps for candle boundaries
#[derive(Debug, Clone)]
pub struct CandleAggregator {
    symbol: SmolStr,
    timeframe: Timeframe,
    indicators: IndicatorSet,
    /// Live candle (Accumulating) or `None` (Empty).
    current: Option<Candle>,
    /// Start of the most recently finalized bucket, never decreases.
    last_finalized: Option<i64>,
}

impl CandleAggregator {
    pub fn new(symbol: SmolStr, timeframe: Timeframe, indicators: IndicatorSet) -> Self {
        Self {
            symbol,
            timeframe,
            indicators,
            current: None,
            last_finalized: None,
        }
    }

    /// Resume after reloading history: indicator state already advanced over the loaded closes
    /// and the start of the last loaded candle as the finalized watermark.
    pub fn resume(&mut self, indicators: IndicatorSet, last_finalized: Option<i64>) {
        self.indicators = indicators;
        self.current = None;
        self.last_finalized = last_finalized;
    }

    /// Feed a tick: `price`, `quantity` and its trade time in whole seconds.
    pub fn update(&mut self, price: f64, quantity: f64, second: i64) -> TickOutcome {
        let bucket = self.timeframe.align(second);

        if self.last_finalized.is_some_and(|finalized| bucket <= finalized) {
            return TickOutcome::Stale;
        }

        match self.current.as_mut() {
            None => {
                let values = self.indicators.peek(price);
                self.current = Some(Candle::open_with(
                    self.symbol.clone(),
                    self.timeframe,
                    bucket,
                    price,
                    quantity,
                    values,
                ));
                TickOutcome::Opened
            }
            Some(candle) if bucket == candle.start_time => {
                candle.apply_trade(price, quantity);
                candle.set_indicators(self.indicators.peek(candle.close));
                TickOutcome::Updated
            }
            Some(candle) if bucket > candle.start_time => {
                let mut closed = candle.clone();
                closed.set_indicators(self.indicators.push(closed.close));
                self.last_finalized = Some(closed.start_time);

                let values = self.indicators.peek(price);
                *candle = Candle::open_with(
                    self.symbol.clone(),
                    self.timeframe,
                    bucket,
                    price,
                    quantity,
                    values,
                );

                TickOutcome::Rolled(closed)
            }
            Some(_) => TickOutcome::Stale,
        }
    }

    /// Current live candle, if any.
    pub fn live(&self) -> Option<&Candle> {
        self.current.as_ref()
    }

    /// Start of the last finalized bucket.
    pub fn last_finalized(&self) -> Option<i64> {
        self.last_finalized
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }
}

/// Ring buffer storing the N most recent finalized candles
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    candles: VecDeque<Candle>,
    max_size: usize,
    /// Number of candles evicted from the front so far.
    evicted: u64,
}

impl HistoryBuffer {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            candles: VecDeque::with_capacity(max_size.min(4_096)),
            max_size,
            evicted: 0,
        }
    }

    pub fn push(&mut self, candle: Candle) {
        if self.candles.len() >= self.max_size {
            self.candles.pop_front();
            self.evicted += 1;
        }
        self.candles.push_back(candle);
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&Candle> {
        self.candles.get(position)
    }

    /// Absolute close sequence number of the candle at `position` (stable across eviction).
    pub fn sequence(&self, position: usize) -> u64 {
        self.evicted + position as u64
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Candle> + ExactSizeIterator {
        self.candles.iter()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn to_vec(&self) -> Vec<Candle> {
        self.candles.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator(timeframe: u64) -> CandleAggregator {
        CandleAggregator::new(
            SmolStr::new("btcusdt"),
            Timeframe::from_secs(timeframe),
            IndicatorSet::new(14, 9, 21),
        )
    }

    fn candle(start_time: i64, close: f64) -> Candle {
        Candle {
            symbol: SmolStr::new("btcusdt"),
            timeframe: Timeframe::SECOND,
            start_time,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            rsi: 50.0,
            ema_fast: None,
            ema_slow: None,
        }
    }

    #[test]
    fn test_aggregator_example_sequence() {
        let mut agg = aggregator(1);

        assert_eq!(agg.update(10.0, 1.0, 100), TickOutcome::Opened);
        assert_eq!(agg.update(10.0, 1.0, 100), TickOutcome::Updated);

        let live = agg.live().unwrap();
        assert_eq!(live.start_time, 100);
        assert_eq!(live.close, 10.0);
        assert_eq!(live.volume, 2.0);

        let TickOutcome::Rolled(closed) = agg.update(11.0, 1.0, 101) else {
            panic!("expected candle 100 to be finalized");
        };
        assert_eq!(closed.start_time, 100);
        assert_eq!(
            (closed.open, closed.high, closed.low, closed.close, closed.volume),
            (10.0, 10.0, 10.0, 10.0, 2.0)
        );

        let live = agg.live().unwrap();
        assert_eq!(live.start_time, 101);
        assert_eq!(
            (live.open, live.high, live.low, live.close, live.volume),
            (11.0, 11.0, 11.0, 11.0, 1.0)
        );
        assert_eq!(agg.last_finalized(), Some(100));
    }

    #[test]
    fn test_aggregator_bar_alignment() {
        let mut agg = aggregator(5);

        // First tick at 1001s lands in the 1000s bucket
        assert_eq!(agg.update(100.0, 1.0, 1001), TickOutcome::Opened);
        assert_eq!(agg.live().unwrap().start_time, 1000);

        // 1004s is the same 5s window
        assert_eq!(agg.update(101.0, 1.0, 1004), TickOutcome::Updated);

        // 1005s starts a new window
        let TickOutcome::Rolled(bar) = agg.update(99.0, 2.0, 1005) else {
            panic!("should emit bar when crossing 5s boundary");
        };
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 101.0);
        assert_eq!(bar.low, 100.0);
        assert_eq!(bar.close, 101.0);
        assert_eq!(agg.live().unwrap().start_time, 1005);
    }

    #[test]
    fn test_aggregator_ignores_stale_ticks() {
        let mut agg = aggregator(60);

        agg.update(100.0, 1.0, 120);
        assert!(matches!(agg.update(101.0, 1.0, 180), TickOutcome::Rolled(_)));

        // Late tick for the finalized 120 bucket
        assert_eq!(agg.update(500.0, 1.0, 150), TickOutcome::Stale);
        // Tick older than anything seen
        assert_eq!(agg.update(500.0, 1.0, 10), TickOutcome::Stale);

        let live = agg.live().unwrap();
        assert_eq!(live.start_time, 180);
        assert_eq!(live.high, 101.0);
        assert_eq!(live.volume, 1.0);
    }

    #[test]
    fn test_aggregator_gap_skips_empty_buckets() {
        let mut agg = aggregator(1);
        agg.update(10.0, 1.0, 100);

        let TickOutcome::Rolled(closed) = agg.update(12.0, 1.0, 110) else {
            panic!("expected roll");
        };
        assert_eq!(closed.start_time, 100);
        assert_eq!(agg.live().unwrap().start_time, 110);
    }

    #[test]
    fn test_aggregator_resume_respects_watermark() {
        let mut agg = aggregator(1);
        agg.resume(IndicatorSet::new(14, 9, 21), Some(200));

        assert_eq!(agg.update(10.0, 1.0, 200), TickOutcome::Stale);
        assert_eq!(agg.update(10.0, 1.0, 199), TickOutcome::Stale);
        assert_eq!(agg.update(10.0, 1.0, 201), TickOutcome::Opened);
    }

    #[test]
    fn test_aggregator_live_indicators_match_finalized() {
        let mut agg = aggregator(1);
        let mut last_live = None;

        for second in 0..40_i64 {
            let price = 100.0 + (second % 7) as f64 - (second % 3) as f64;
            if let TickOutcome::Rolled(closed) = agg.update(price, 1.0, 1_000 + second) {
                let live: Candle = last_live.take().unwrap();
                assert_eq!(closed.rsi, live.rsi);
                assert_eq!(closed.ema_fast, live.ema_fast);
                assert_eq!(closed.ema_slow, live.ema_slow);
            }
            last_live = agg.live().cloned();
        }
    }

    #[test]
    fn test_history_buffer_ring_behavior() {
        let mut buffer = HistoryBuffer::new(3);

        for i in 0..5 {
            buffer.push(candle(i, i as f64));
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.get(0).unwrap().start_time, 2);
        assert_eq!(buffer.last().unwrap().close, 4.0);
        assert_eq!(buffer.sequence(0), 2);
        assert_eq!(buffer.sequence(2), 4);
        assert_eq!(buffer.iter().rev().nth(1).unwrap().start_time, 3);
    }

    #[test]
    fn test_candle_display() {
        let mut up = candle(0, 10.0);
        up.close = 11.0;
        up.high = 11.0;
        assert_eq!(
            up.to_string(),
            "[00:00:00] ▲ O:10.00 | H:11.00 | L:10.00 | C:11.00 | Vol:1.000"
        );
    }
}
