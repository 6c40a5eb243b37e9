//! Candle timeframes and UTC window alignment
//!
//! Window boundaries for a timeframe are every multiple of its duration since
//! the Unix epoch. Live and batch processing both go through
//! [`Timeframe::window_start`], so alignment can never differ between them.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const NANOS_PER_SECOND: i64 = 1_000_000_000;
pub const NANOS_PER_DAY: i64 = 86_400 * NANOS_PER_SECOND;

// 1970-01-01 counted from 0001-01-01 (proleptic Gregorian).
const UNIX_EPOCH_DAYS_FROM_CE: i64 = 719_163;

/// Supported candle timeframes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    /// 15 seconds
    #[serde(rename = "15s", alias = "S15")]
    S15,
    /// 1 minute
    #[serde(rename = "1m", alias = "M1")]
    M1,
    /// 5 minutes
    #[serde(rename = "5m", alias = "M5")]
    M5,
    /// 15 minutes
    #[serde(rename = "15m", alias = "M15")]
    M15,
    /// 30 minutes
    #[serde(rename = "30m", alias = "M30")]
    M30,
    /// 1 hour
    #[serde(rename = "1h", alias = "H1")]
    H1,
    /// 4 hours
    #[serde(rename = "4h", alias = "H4")]
    H4,
    /// 24 hours
    #[serde(rename = "24h", alias = "D1", alias = "1d")]
    D1,
}

impl Timeframe {
    /// Duration of this timeframe in nanoseconds.
    pub fn duration_nanos(&self) -> i64 {
        match self {
            Timeframe::S15 => 15 * NANOS_PER_SECOND,
            Timeframe::M1 => 60 * NANOS_PER_SECOND,
            Timeframe::M5 => 5 * 60 * NANOS_PER_SECOND,
            Timeframe::M15 => 15 * 60 * NANOS_PER_SECOND,
            Timeframe::M30 => 30 * 60 * NANOS_PER_SECOND,
            Timeframe::H1 => 3600 * NANOS_PER_SECOND,
            Timeframe::H4 => 4 * 3600 * NANOS_PER_SECOND,
            Timeframe::D1 => NANOS_PER_DAY,
        }
    }

    /// All timeframes, finest first.
    pub fn all() -> &'static [Timeframe] {
        &[
            Timeframe::S15,
            Timeframe::M1,
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::M30,
            Timeframe::H1,
            Timeframe::H4,
            Timeframe::D1,
        ]
    }

    /// Start of the window containing `timestamp_nanos` (floor, also for pre-epoch times).
    pub fn window_start(&self, timestamp_nanos: i64) -> i64 {
        let duration = self.duration_nanos();
        timestamp_nanos.div_euclid(duration) * duration
    }

    /// Half-open `[start, end)` window containing `timestamp_nanos`.
    pub fn window_bounds(&self, timestamp_nanos: i64) -> (i64, i64) {
        let start = self.window_start(timestamp_nanos);
        (start, start + self.duration_nanos())
    }

    /// Whether windows of `self` tile windows of `coarser` exactly.
    pub fn divides(&self, coarser: Timeframe) -> bool {
        coarser.duration_nanos() > self.duration_nanos()
            && coarser.duration_nanos() % self.duration_nanos() == 0
    }

    pub fn label(&self) -> &'static str {
        match self {
            Timeframe::S15 => "15s",
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "24h",
        }
    }

    /// Window duration in seconds, for per-second rates.
    pub fn duration_secs_f64(&self) -> f64 {
        self.duration_nanos() as f64 / NANOS_PER_SECOND as f64
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1d" | "D1" => Ok(Timeframe::D1),
            other => Timeframe::all()
                .iter()
                .copied()
                .find(|tf| tf.label() == other || format!("{tf:?}") == other)
                .ok_or_else(|| format!("unknown timeframe: {s}")),
        }
    }
}

/// UTC calendar day containing `timestamp_nanos`.
pub fn utc_day(timestamp_nanos: i64) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_nanos(timestamp_nanos).date_naive()
}

/// Unix nanos of midnight UTC at the start of `day`.
pub fn day_start_nanos(day: NaiveDate) -> i64 {
    let days = i64::from(day.num_days_from_ce()) - UNIX_EPOCH_DAYS_FROM_CE;
    days * NANOS_PER_DAY
}
