//! Engine configuration.
//!
//! Every setting has a default matching the reference deployment and may be overridden through
//! the environment (see [`EngineConfig::from_env`]).

use crate::{error::EngineError, timeframe::Timeframe};
use itertools::Itertools;
use smol_str::SmolStr;
use std::{path::PathBuf, str::FromStr};

/// Tunables shared by every pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    /// Finalized candles kept in memory (and reloaded on start-up) per pipeline.
    pub history_capacity: usize,
    pub rsi_period: usize,
    pub ema_fast: usize,
    pub ema_slow: usize,
    /// Candles scanned backwards for an order block after a break.
    pub order_block_lookback: usize,
    /// Maximum close index gap between two pivots compared for divergence.
    pub divergence_lookback: u64,
    /// Divergence markers retained (and checked for duplicates).
    pub marker_memory: usize,
    /// Structure breaks retained for snapshots.
    pub break_memory: usize,
    /// Upper bound of the active structure level set, oldest levels are evicted first.
    pub max_active_levels: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            history_capacity: 50_000,
            rsi_period: 14,
            ema_fast: 9,
            ema_slow: 21,
            order_block_lookback: 50,
            divergence_lookback: 60,
            marker_memory: 50,
            break_memory: 50,
            max_active_levels: 500,
        }
    }
}

impl AnalysisConfig {
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_rsi_period(mut self, period: usize) -> Self {
        self.rsi_period = period;
        self
    }

    pub fn with_ema_periods(mut self, fast: usize, slow: usize) -> Self {
        self.ema_fast = fast;
        self.ema_slow = slow;
        self
    }

    pub fn with_order_block_lookback(mut self, lookback: usize) -> Self {
        self.order_block_lookback = lookback;
        self
    }

    pub fn with_divergence_lookback(mut self, lookback: u64) -> Self {
        self.divergence_lookback = lookback;
        self
    }

    pub fn with_marker_memory(mut self, memory: usize) -> Self {
        self.marker_memory = memory;
        self
    }

    pub fn with_break_memory(mut self, memory: usize) -> Self {
        self.break_memory = memory;
        self
    }

    pub fn with_max_active_levels(mut self, max: usize) -> Self {
        self.max_active_levels = max;
        self
    }
}

/// Which pipelines to run and where to persist them.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Lower-cased exchange symbols, eg/ "btcusdt".
    pub symbols: Vec<SmolStr>,
    pub timeframes: Vec<Timeframe>,
    /// Directory for the per pipeline candle logs. `None` keeps candles in memory only.
    pub data_dir: Option<PathBuf>,
    /// Capacity of each pipeline worker's command channel.
    pub command_buffer_size: usize,
    /// Capacity of the shared event broadcast channel.
    pub event_buffer_size: usize,
    pub analysis: AnalysisConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: vec![SmolStr::new_static("btcusdt")],
            timeframes: vec![
                Timeframe::SECOND,
                Timeframe::MINUTE,
                Timeframe::from_secs(5 * 60),
                Timeframe::from_secs(15 * 60),
                Timeframe::HOUR,
            ],
            data_dir: None,
            command_buffer_size: 4_096,
            event_buffer_size: 10_000,
            analysis: AnalysisConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new<S>(symbols: impl IntoIterator<Item = S>, timeframes: Vec<Timeframe>) -> Self
    where
        S: AsRef<str>,
    {
        Self {
            symbols: normalise_symbols(symbols),
            timeframes,
            ..Default::default()
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    pub fn with_command_buffer_size(mut self, size: usize) -> Self {
        self.command_buffer_size = size;
        self
    }

    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }

    pub fn with_analysis(mut self, analysis: AnalysisConfig) -> Self {
        self.analysis = analysis;
        self
    }

    /// Build from `CANDLE_*` environment variables, falling back to defaults for unset keys.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (environment, test map, ...).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let analysis_defaults = AnalysisConfig::default();

        let symbols = match lookup("CANDLE_SYMBOLS") {
            Some(raw) => {
                let symbols = normalise_symbols(raw.split(','));
                if symbols.is_empty() {
                    return Err(EngineError::Config {
                        key: "CANDLE_SYMBOLS",
                        reason: "at least one symbol is required".to_string(),
                    });
                }
                symbols
            }
            None => defaults.symbols,
        };

        let timeframes = match lookup("CANDLE_TIMEFRAMES") {
            Some(raw) => {
                let timeframes = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(Timeframe::from_str)
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .unique()
                    .collect::<Vec<_>>();
                if timeframes.is_empty() {
                    return Err(EngineError::Config {
                        key: "CANDLE_TIMEFRAMES",
                        reason: "at least one timeframe is required".to_string(),
                    });
                }
                timeframes
            }
            None => defaults.timeframes,
        };

        let data_dir = lookup("CANDLE_DATA_DIR")
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
            .map(PathBuf::from);

        let analysis = AnalysisConfig {
            history_capacity: parse_or(
                &lookup,
                "CANDLE_HISTORY_CAPACITY",
                analysis_defaults.history_capacity,
            )?,
            rsi_period: parse_or(&lookup, "CANDLE_RSI_PERIOD", analysis_defaults.rsi_period)?,
            ema_fast: parse_or(&lookup, "CANDLE_EMA_FAST", analysis_defaults.ema_fast)?,
            ema_slow: parse_or(&lookup, "CANDLE_EMA_SLOW", analysis_defaults.ema_slow)?,
            order_block_lookback: parse_or(
                &lookup,
                "CANDLE_OB_LOOKBACK",
                analysis_defaults.order_block_lookback,
            )?,
            divergence_lookback: parse_or(
                &lookup,
                "CANDLE_DIVERGENCE_LOOKBACK",
                analysis_defaults.divergence_lookback,
            )?,
            marker_memory: parse_or(
                &lookup,
                "CANDLE_MARKER_MEMORY",
                analysis_defaults.marker_memory,
            )?,
            break_memory: parse_or(
                &lookup,
                "CANDLE_BREAK_MEMORY",
                analysis_defaults.break_memory,
            )?,
            max_active_levels: parse_or(
                &lookup,
                "CANDLE_MAX_ACTIVE_LEVELS",
                analysis_defaults.max_active_levels,
            )?,
        };

        Ok(Self {
            symbols,
            timeframes,
            data_dir,
            analysis,
            ..defaults
        })
    }
}

fn normalise_symbols<S>(symbols: impl IntoIterator<Item = S>) -> Vec<SmolStr>
where
    S: AsRef<str>,
{
    symbols
        .into_iter()
        .map(|symbol| symbol.as_ref().trim().to_lowercase())
        .filter(|symbol| !symbol.is_empty())
        .unique()
        .map(SmolStr::from)
        .collect()
}

/// Parse a positive integer setting, using `default` when the key is unset.
fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, EngineError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };

    let value = raw.trim().parse::<T>().map_err(|error| EngineError::Config {
        key,
        reason: format!("'{raw}': {error}"),
    })?;

    if value <= T::default() {
        return Err(EngineError::Config {
            key,
            reason: format!("'{raw}' must be greater than zero"),
        });
    }

    Ok(value)
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
    fn test_from_lookup_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(
            config.timeframes.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["1s", "1m", "5m", "15m", "1h"]
        );
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("CANDLE_SYMBOLS", "BTCUSDT, ethusdt,,btcusdt"),
            ("CANDLE_TIMEFRAMES", "1m,5m,1m"),
            ("CANDLE_DATA_DIR", "/var/lib/candles"),
            ("CANDLE_HISTORY_CAPACITY", "1000"),
            ("CANDLE_OB_LOOKBACK", "20"),
            ("CANDLE_BREAK_MEMORY", "5"),
            ("CANDLE_MAX_ACTIVE_LEVELS", "64"),
        ]))
        .unwrap();

        assert_eq!(config.symbols, vec!["btcusdt", "ethusdt"]);
        assert_eq!(
            config.timeframes,
            vec![Timeframe::MINUTE, Timeframe::from_secs(300)]
        );
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/candles")));
        assert_eq!(config.analysis.history_capacity, 1000);
        assert_eq!(config.analysis.order_block_lookback, 20);
        assert_eq!(config.analysis.rsi_period, 14);
        assert_eq!(config.analysis.break_memory, 5);
        assert_eq!(config.analysis.max_active_levels, 64);
    }

    #[test]
    fn test_from_lookup_rejects_invalid_values() {
        struct TestCase {
            input: (&'static str, &'static str),
            expected: &'static str,
        }

        let tests = vec![
            TestCase {
                // TC0: not a number
                input: ("CANDLE_RSI_PERIOD", "fourteen"),
                expected: "CANDLE_RSI_PERIOD",
            },
            TestCase {
                // TC1: zero period
                input: ("CANDLE_EMA_FAST", "0"),
                expected: "CANDLE_EMA_FAST",
            },
            TestCase {
                // TC2: only separators
                input: ("CANDLE_SYMBOLS", " , "),
                expected: "CANDLE_SYMBOLS",
            },
            TestCase {
                // TC3: empty timeframe list
                input: ("CANDLE_TIMEFRAMES", ","),
                expected: "CANDLE_TIMEFRAMES",
            },
            TestCase {
                // TC4: zero level cap
                input: ("CANDLE_MAX_ACTIVE_LEVELS", "0"),
                expected: "CANDLE_MAX_ACTIVE_LEVELS",
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = EngineConfig::from_lookup(lookup(&[test.input]));
            match actual {
                Err(EngineError::Config { key, .. }) => {
                    assert_eq!(key, test.expected, "TC{} failed", index)
                }
                other => panic!("TC{index} expected config error, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_from_lookup_bad_timeframe() {
        let actual = EngineConfig::from_lookup(lookup(&[("CANDLE_TIMEFRAMES", "1m,7x")]));
        assert!(matches!(actual, Err(EngineError::InvalidTimeframe(_))));
    }

    #[test]
    fn test_builders() {
        let analysis = AnalysisConfig::default()
            .with_history_capacity(10)
            .with_rsi_period(7)
            .with_ema_periods(5, 13)
            .with_order_block_lookback(30)
            .with_divergence_lookback(40)
            .with_marker_memory(8)
            .with_break_memory(4)
            .with_max_active_levels(100);

        let config = EngineConfig::new(["ETHUSDT"], vec![Timeframe::SECOND])
            .with_data_dir("/tmp/candles")
            .with_command_buffer_size(32)
            .with_event_buffer_size(16)
            .with_analysis(analysis.clone());

        assert_eq!(config.symbols, vec!["ethusdt"]);
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/candles")));
        assert_eq!(config.command_buffer_size, 32);
        assert_eq!(config.event_buffer_size, 16);
        assert_eq!(
            config.analysis,
            AnalysisConfig {
                history_capacity: 10,
                rsi_period: 7,
                ema_fast: 5,
                ema_slow: 13,
                order_block_lookback: 30,
                divergence_lookback: 40,
                marker_memory: 8,
                break_memory: 4,
                max_active_levels: 100,
            }
        );
        assert_eq!(config.analysis, analysis);
    }
}
