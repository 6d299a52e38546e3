//! Append-only persistence of finalized candles.
//!
//! Only raw OHLCV is persisted, one line per candle: `start_time,open,high,low,close,volume`.
//! Indicators, structure and divergence are recomputed from these records on start-up.

use crate::{candle::Candle, error::EngineError, timeframe::Timeframe};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, warn};

/// Persisted form of a finalized [`Candle`].
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct CandleRecord {
    pub start_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl From<&Candle> for CandleRecord {
    fn from(candle: &Candle) -> Self {
        Self {
            start_time: candle.start_time,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
        }
    }
}

impl CandleRecord {
    /// Encode as a single log line (without the trailing newline).
    ///
    /// `f64` Display is the shortest representation that parses back to the same value.
    pub fn to_line(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.start_time, self.open, self.high, self.low, self.close, self.volume
        )
    }

    /// Decode a log line. `line` is the 1-based line number used for error reporting.
    pub fn parse_line(input: &str, line: usize) -> Result<Self, EngineError> {
        let malformed = |reason: String| EngineError::MalformedRecord { line, reason };

        let fields = input.trim().split(',').collect::<Vec<_>>();
        let [start_time, open, high, low, close, volume] = *fields.as_slice() else {
            return Err(malformed(format!("expected 6 fields, found {}", fields.len())));
        };

        let start_time = start_time
            .trim()
            .parse::<i64>()
            .map_err(|error| malformed(format!("start_time: {error}")))?;

        let price = |name: &str, raw: &str| -> Result<f64, EngineError> {
            let value = raw
                .trim()
                .parse::<f64>()
                .map_err(|error| malformed(format!("{name}: {error}")))?;
            if value.is_finite() {
                Ok(value)
            } else {
                Err(malformed(format!("{name}: non-finite value")))
            }
        };

        Ok(Self {
            start_time,
            open: price("open", open)?,
            high: price("high", high)?,
            low: price("low", low)?,
            close: price("close", close)?,
            volume: price("volume", volume)?,
        })
    }
}

/// Durable sink and source of finalized candles for one pipeline.
pub trait CandleStore: Send {
    /// Append one finalized candle. Calls arrive in strictly increasing `start_time` order.
    fn append(&mut self, candle: &Candle) -> Result<(), EngineError>;

    /// Read every persisted record in write order. A store that has never been written to
    /// yields an empty `Vec`.
    fn load(&self) -> Result<Vec<CandleRecord>, EngineError>;
}

/// [`CandleStore`] backed by a CSV style log file at `<data_dir>/<symbol>_<timeframe>.csv`.
#[derive(Debug)]
pub struct FileCandleStore {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileCandleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }

    /// Store for the given pipeline inside `data_dir`.
    pub fn for_pipeline(data_dir: &Path, symbol: &str, timeframe: Timeframe) -> Self {
        Self::new(data_dir.join(format!("{symbol}_{timeframe}.csv")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>, EngineError> {
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            debug!(path = %self.path.display(), "opened candle log for append");
            self.writer = Some(BufWriter::new(file));
        }

        self.writer
            .as_mut()
            .ok_or_else(|| EngineError::Io(std::io::Error::other("candle log writer unavailable")))
    }
}

impl CandleStore for FileCandleStore {
    fn append(&mut self, candle: &Candle) -> Result<(), EngineError> {
        let line = CandleRecord::from(candle).to_line();
        let writer = self.writer()?;
        writeln!(writer, "{line}")?;
        // One record per close, flushed so a crash loses at most the live candle
        writer.flush()?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<CandleRecord>, EngineError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut records: Vec<CandleRecord> = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let record = match CandleRecord::parse_line(&line, index + 1) {
                Ok(record) => record,
                Err(error) => {
                    warn!(path = %self.path.display(), %error, "skipping malformed candle record");
                    continue;
                }
            };

            if records
                .last()
                .is_some_and(|last| record.start_time <= last.start_time)
            {
                warn!(
                    path = %self.path.display(),
                    line = index + 1,
                    start_time = record.start_time,
                    "skipping out of order candle record"
                );
                continue;
            }

            records.push(record);
        }

        Ok(records)
    }
}

/// [`CandleStore`] kept in memory, used when no data directory is configured.
///
/// Clones share the same records, so a test can keep a handle and inspect what a pipeline wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryCandleStore {
    records: Arc<Mutex<Vec<CandleRecord>>>,
}

impl MemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<CandleRecord>) -> Self {
        Self {
            records: Arc::new(Mutex::new(records)),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl CandleStore for MemoryCandleStore {
    fn append(&mut self, candle: &Candle) -> Result<(), EngineError> {
        self.records.lock().push(CandleRecord::from(candle));
        Ok(())
    }

    fn load(&self) -> Result<Vec<CandleRecord>, EngineError> {
        Ok(self.records.lock().clone())
    }
}
