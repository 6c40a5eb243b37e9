//! Tick and data-kind definitions
//!
//! A `Tick` is one validated market-data event handed to the router by the
//! transport. Its kind is derived from the payload variant, so the declared
//! kind and the payload can never disagree.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ids::{InstrumentId, TickId};
use crate::numeric::{Price, Quantity};

/// Closed set of data kinds the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Trade,
    BookSnapshot,
    DerivativeTicker,
    Liquidation,
    OptionQuote,
    FundingRate,
}

impl DataKind {
    /// Number of variants; sizes the router's dispatch table.
    pub const COUNT: usize = 6;

    pub const ALL: [DataKind; DataKind::COUNT] = [
        DataKind::Trade,
        DataKind::BookSnapshot,
        DataKind::DerivativeTicker,
        DataKind::Liquidation,
        DataKind::OptionQuote,
        DataKind::FundingRate,
    ];

    /// Dense index in `0..COUNT`.
    pub fn index(&self) -> usize {
        match self {
            DataKind::Trade => 0,
            DataKind::BookSnapshot => 1,
            DataKind::DerivativeTicker => 2,
            DataKind::Liquidation => 3,
            DataKind::OptionQuote => 4,
            DataKind::FundingRate => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Trade => "trade",
            DataKind::BookSnapshot => "book_snapshot",
            DataKind::DerivativeTicker => "derivative_ticker",
            DataKind::Liquidation => "liquidation",
            DataKind::OptionQuote => "option_quote",
            DataKind::FundingRate => "funding_rate",
        }
    }

    /// Whether ticks of this kind contribute to candle accumulators.
    pub fn folds_into_candles(&self) -> bool {
        !matches!(self, DataKind::OptionQuote)
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown data kind: {s}"))
    }
}

/// Aggressor side of a trade or liquidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Call => "call",
            OptionType::Put => "put",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "call" => Some(OptionType::Call),
            "put" => Some(OptionType::Put),
            _ => None,
        }
    }
}

/// One price level of an order-book snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Price,
    pub size: Quantity,
}

/// Kind-specific tick content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TickPayload {
    Trade {
        price: Price,
        size: Quantity,
        side: Side,
        /// Venue flag marking the trade as a forced liquidation fill.
        #[serde(default)]
        liquidation: bool,
    },
    BookSnapshot {
        /// Best first.
        bids: Vec<BookLevel>,
        /// Best first.
        asks: Vec<BookLevel>,
    },
    DerivativeTicker {
        mark_price: Option<Price>,
        index_price: Option<Price>,
        open_interest: Option<Quantity>,
        funding_rate: Option<rust_decimal::Decimal>,
    },
    Liquidation {
        price: Price,
        size: Quantity,
        side: Side,
    },
    OptionQuote {
        strike: Price,
        /// Unix nanos.
        expiry: i64,
        option_type: OptionType,
        bid: Option<Price>,
        ask: Option<Price>,
        mark_iv: Option<rust_decimal::Decimal>,
        underlying_price: Option<Price>,
    },
    FundingRate {
        rate: rust_decimal::Decimal,
        /// Unix nanos of the next funding event, when published.
        next_funding_time: Option<i64>,
    },
}

impl TickPayload {
    pub fn kind(&self) -> DataKind {
        match self {
            TickPayload::Trade { .. } => DataKind::Trade,
            TickPayload::BookSnapshot { .. } => DataKind::BookSnapshot,
            TickPayload::DerivativeTicker { .. } => DataKind::DerivativeTicker,
            TickPayload::Liquidation { .. } => DataKind::Liquidation,
            TickPayload::OptionQuote { .. } => DataKind::OptionQuote,
            TickPayload::FundingRate { .. } => DataKind::FundingRate,
        }
    }
}

/// A validated market-data event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Transport-supplied identifier for dedup; `None` disables dedup for this tick.
    pub tick_id: Option<TickId>,
    pub instrument_id: InstrumentId,
    /// Venue timestamp, Unix nanos. Drives window assignment.
    pub event_time: i64,
    /// Local receive timestamp, Unix nanos.
    pub ingest_time: i64,
    pub payload: TickPayload,
}

impl Tick {
    pub fn new(instrument_id: InstrumentId, event_time: i64, payload: TickPayload) -> Self {
        Self {
            tick_id: None,
            instrument_id,
            event_time,
            ingest_time: event_time,
            payload,
        }
    }

    pub fn with_id(mut self, tick_id: TickId) -> Self {
        self.tick_id = Some(tick_id);
        self
    }

    pub fn with_ingest_time(mut self, ingest_time: i64) -> Self {
        self.ingest_time = ingest_time;
        self
    }

    /// Convenience constructor for a plain trade.
    pub fn trade(
        instrument_id: InstrumentId,
        event_time: i64,
        price: Price,
        size: Quantity,
        side: Side,
    ) -> Self {
        Self::new(
            instrument_id,
            event_time,
            TickPayload::Trade {
                price,
                size,
                side,
                liquidation: false,
            },
        )
    }

    pub fn kind(&self) -> DataKind {
        self.payload.kind()
    }
}
