//! Diagnostic taxonomy for the aggregation engine
//!
//! Almost every abnormal condition on the ingestion, aggregation and feature
//! path is non-fatal: it is counted and logged, and processing of every other
//! instrument continues. This module names those conditions so counters,
//! logs and alerts share one vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::ids::InstrumentId;
use crate::timeframe::Timeframe;

/// Non-fatal conditions surfaced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Diagnostic {
    /// Unknown or unconfigured kind/instrument; tick dropped.
    Unroutable,
    /// Tick id already seen inside the dedup window; tick dropped.
    DuplicateTick,
    /// Tick older than the current open window; tick dropped.
    LateTickDropped,
    /// Indicator lookback not satisfied; field marked absent.
    InsufficientHistory,
    /// Persist flush failed (retried, then dead-lettered).
    StorageWriteFailure,
    /// A block or partition could not be decoded.
    StorageDecodeError,
    /// A slow subscriber lost its oldest queued item.
    SubscriberBackpressure,
}

impl Diagnostic {
    pub const ALL: [Diagnostic; 7] = [
        Diagnostic::Unroutable,
        Diagnostic::DuplicateTick,
        Diagnostic::LateTickDropped,
        Diagnostic::InsufficientHistory,
        Diagnostic::StorageWriteFailure,
        Diagnostic::StorageDecodeError,
        Diagnostic::SubscriberBackpressure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Diagnostic::Unroutable => "unroutable",
            Diagnostic::DuplicateTick => "duplicate_tick",
            Diagnostic::LateTickDropped => "late_tick_dropped",
            Diagnostic::InsufficientHistory => "insufficient_history",
            Diagnostic::StorageWriteFailure => "storage_write_failure",
            Diagnostic::StorageDecodeError => "storage_decode_error",
            Diagnostic::SubscriberBackpressure => "subscriber_backpressure",
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tick arrived for a window that is already closed.
///
/// Returned by the candle builder; the tick is discarded and the emitted
/// candle is never touched again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("late tick for {instrument_id}@{timeframe}: event_time {event_time} < open window start {window_start}")]
pub struct LateTickDropped {
    pub instrument_id: InstrumentId,
    pub timeframe: Timeframe,
    pub event_time: i64,
    pub window_start: i64,
}
