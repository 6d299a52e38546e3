use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Candle interval in whole seconds.
///
/// Textual form uses the largest whole unit: `1s`, `15s`, `1m`, `5m`, `1h`, `4h`, `1d`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe(u64);

impl Timeframe {
    pub const SECOND: Self = Self(1);
    pub const MINUTE: Self = Self(60);
    pub const HOUR: Self = Self(3_600);
    pub const DAY: Self = Self(86_400);

    /// Construct a [`Timeframe`], rejecting a zero length interval.
    pub fn new(secs: u64) -> Result<Self, EngineError> {
        if secs == 0 {
            return Err(EngineError::InvalidTimeframe(
                "timeframe must be at least 1 second".to_string(),
            ));
        }
        Ok(Self(secs))
    }

    /// Construct a [`Timeframe`] from a known non-zero number of seconds (0 is clamped to 1).
    pub const fn from_secs(secs: u64) -> Self {
        if secs == 0 { Self(1) } else { Self(secs) }
    }

    pub const fn secs(&self) -> u64 {
        self.0
    }

    /// Align a unix second onto this timeframe's grid.
    ///
    /// Uses floor division so pre-epoch seconds still align downwards.
    pub fn align(&self, second: i64) -> i64 {
        let secs = self.0 as i64;
        second.div_euclid(secs) * secs
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0;
        match secs {
            s if s % Self::DAY.0 == 0 => write!(f, "{}d", s / Self::DAY.0),
            s if s % Self::HOUR.0 == 0 => write!(f, "{}h", s / Self::HOUR.0),
            s if s % Self::MINUTE.0 == 0 => write!(f, "{}m", s / Self::MINUTE.0),
            s => write!(f, "{s}s"),
        }
    }
}

impl FromStr for Timeframe {
    type Err = EngineError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        let invalid = || EngineError::InvalidTimeframe(input.to_string());

        let split = input
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        let (count, unit) = input.split_at(split);
        let count = count.parse::<u64>().map_err(|_| invalid())?;

        let multiplier = match unit {
            "s" => 1,
            "m" => Self::MINUTE.0,
            "h" => Self::HOUR.0,
            "d" => Self::DAY.0,
            _ => return Err(invalid()),
        };

        count
            .checked_mul(multiplier)
            .ok_or_else(invalid)
            .and_then(Self::new)
    }
}

impl TryFrom<String> for Timeframe {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(value: Timeframe) -> Self {
        value.to_string()
    }
}
