//! Immutable OHLCV candle snapshot
//!
//! Produced by the candle builder when a window closes. Empty windows keep
//! their OHLC fields absent instead of zero-filling or carrying the previous
//! close forward.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::InstrumentId;
use crate::numeric::{Price, Quantity};
use crate::timeframe::Timeframe;

/// A closed window summary for one (instrument, timeframe).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub instrument_id: InstrumentId,
    pub timeframe: Timeframe,
    /// Inclusive window start, Unix nanos.
    pub window_start: i64,
    /// Exclusive window end, Unix nanos.
    pub window_end: i64,
    pub open: Option<Price>,
    pub high: Option<Price>,
    pub low: Option<Price>,
    pub close: Option<Price>,
    /// Sum of trade sizes.
    pub volume: Quantity,
    pub trade_count: u64,
    /// Σ price·size over all trades in the window.
    pub vwap_numerator: Decimal,

    // Last-non-null values carried from derivative tickers, funding updates
    // and book snapshots.
    pub mark_price: Option<Price>,
    pub index_price: Option<Price>,
    pub open_interest: Option<Quantity>,
    pub funding_rate: Option<Decimal>,
    pub best_bid: Option<Price>,
    pub best_ask: Option<Price>,

    pub liquidation_volume: Quantity,
    pub liquidation_count: u64,

    /// When the close was observed, Unix nanos.
    pub completion_time: i64,
    /// True when no trades fell in the window; OHLC are then `None`.
    pub is_empty: bool,
}

impl Candle {
    /// Volume-weighted average price, absent for empty windows.
    pub fn vwap(&self) -> Option<Decimal> {
        let volume = self.volume.as_decimal();
        if volume.is_zero() {
            None
        } else {
            Some(self.vwap_numerator / volume)
        }
    }

    /// Validate candle integrity (OHLC ordering, emptiness, window shape).
    pub fn is_valid(&self) -> bool {
        if self.window_end <= self.window_start
            || self.window_end - self.window_start != self.timeframe.duration_nanos()
        {
            return false;
        }

        match (self.open, self.high, self.low, self.close) {
            (Some(open), Some(high), Some(low), Some(close)) => {
                !self.is_empty
                    && self.trade_count > 0
                    && high >= open
                    && high >= close
                    && low <= open
                    && low <= close
                    && high >= low
            }
            (None, None, None, None) => {
                self.is_empty && self.trade_count == 0 && self.volume.is_zero()
            }
            _ => false,
        }
    }

    /// Whether `timestamp` falls in this candle's half-open window.
    pub fn contains(&self, timestamp: i64) -> bool {
        self.window_start <= timestamp && timestamp < self.window_end
    }
}
