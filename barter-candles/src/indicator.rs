/// Indicator utilities for candle close series
///
/// Provides Wilder RSI and EMA both as bulk series functions (used when rebuilding from persisted
/// history) and as incremental state machines (used for live updates). Both forms share the same
/// recurrence so a live value always matches the bulk value at the same index.
use serde::{Deserialize, Serialize};

/// RSI reported while fewer than two closes exist.
pub const RSI_NEUTRAL: f64 = 50.0;

/// Exponential Moving Average (EMA) calculator
///
/// Seeded with the simple average of the first `period` closes, then
/// `ema = (close - ema) * k + ema` with `k = 2 / (period + 1)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Ema {
    /// EMA period
    period: usize,
    /// Smoothing factor (k)
    alpha: f64,
    /// Sum of closes while warming up
    seed_sum: f64,
    /// Current EMA value
    value: Option<f64>,
    /// Number of data points processed
    count: usize,
}

impl Ema {
    /// Create a new EMA calculator
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            alpha: 2.0 / (period as f64 + 1.0),
            seed_sum: 0.0,
            value: None,
            count: 0,
        }
    }

    /// Value the EMA would take if `close` were the next data point, without consuming it.
    pub fn peek(&self, close: f64) -> Option<f64> {
        match self.value {
            Some(current) => Some((close - current) * self.alpha + current),
            None if self.count + 1 == self.period => {
                Some((self.seed_sum + close) / self.period as f64)
            }
            None => None,
        }
    }

    /// Update EMA with a new value
    pub fn update(&mut self, close: f64) -> Option<f64> {
        let next = self.peek(close);
        self.count += 1;
        if self.value.is_none() {
            self.seed_sum += close;
        }
        self.value = next;
        next
    }

    /// Get current EMA value
    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Wilder Relative Strength Index calculator
///
/// Average gain/loss use a growing-window mean while `i < period`, then Wilder smoothing
/// `avg = (avg * (period - 1) + value) / period`. `i` is the index of the close in the series.
#[derive(Debug, Clone, PartialEq)]
pub struct Rsi {
    period: usize,
    prev_close: Option<f64>,
    avg_gain: f64,
    avg_loss: f64,
    /// Number of closes processed
    count: usize,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_close: None,
            avg_gain: 0.0,
            avg_loss: 0.0,
            count: 0,
        }
    }

    /// Compute (avg_gain, avg_loss, rsi) for `close` appended at index `self.count`.
    fn step(&self, close: f64) -> (f64, f64, f64) {
        let Some(prev_close) = self.prev_close else {
            return (self.avg_gain, self.avg_loss, RSI_NEUTRAL);
        };

        let diff = close - prev_close;
        let gain = diff.max(0.0);
        let loss = (-diff).max(0.0);

        let index = self.count;
        let (avg_gain, avg_loss) = if index < self.period {
            let n = index as f64;
            (
                (self.avg_gain * (n - 1.0) + gain) / n,
                (self.avg_loss * (n - 1.0) + loss) / n,
            )
        } else {
            let p = self.period as f64;
            (
                (self.avg_gain * (p - 1.0) + gain) / p,
                (self.avg_loss * (p - 1.0) + loss) / p,
            )
        };

        (avg_gain, avg_loss, rsi_from_averages(avg_gain, avg_loss))
    }

    /// RSI value if `close` were the next data point, without consuming it.
    pub fn peek(&self, close: f64) -> f64 {
        self.step(close).2
    }

    pub fn update(&mut self, close: f64) -> f64 {
        let (avg_gain, avg_loss, value) = self.step(close);
        self.avg_gain = avg_gain;
        self.avg_loss = avg_loss;
        self.prev_close = Some(close);
        self.count += 1;
        value
    }
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// EMA value for every close in the series (`None` until warm).
pub fn ema_series(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut ema = Ema::new(period);
    closes.iter().map(|close| ema.update(*close)).collect()
}

/// Wilder RSI value for every close in the series.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<f64> {
    let mut rsi = Rsi::new(period);
    closes.iter().map(|close| rsi.update(*close)).collect()
}

/// Indicator values attached to a candle.
#[derive(Debug, Copy, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct IndicatorValues {
    pub rsi: f64,
    pub ema_fast: Option<f64>,
    pub ema_slow: Option<f64>,
}

/// RSI plus fast/slow EMA state advanced over finalized closes only.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorSet {
    rsi: Rsi,
    ema_fast: Ema,
    ema_slow: Ema,
}

impl IndicatorSet {
    pub fn new(rsi_period: usize, ema_fast_period: usize, ema_slow_period: usize) -> Self {
        Self {
            rsi: Rsi::new(rsi_period),
            ema_fast: Ema::new(ema_fast_period),
            ema_slow: Ema::new(ema_slow_period),
        }
    }

    /// Live values for a candle whose current close is `close`.
    pub fn peek(&self, close: f64) -> IndicatorValues {
        IndicatorValues {
            rsi: self.rsi.peek(close),
            ema_fast: self.ema_fast.peek(close),
            ema_slow: self.ema_slow.peek(close),
        }
    }

    /// Consume a finalized close, returning the values the finalized candle carries.
    pub fn push(&mut self, close: f64) -> IndicatorValues {
        IndicatorValues {
            rsi: self.rsi.update(close),
            ema_fast: self.ema_fast.update(close),
            ema_slow: self.ema_slow.update(close),
        }
    }
}
