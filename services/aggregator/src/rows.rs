//! Storage rows for ticks and candles
//!
//! Each data kind persists to its own dataset (`trade`, `book_snapshot`, ...)
//! and each candle timeframe to `candles_<label>`. Rows are keyed by event
//! time for ticks and by window start for candles. Every tick schema starts
//! with `instrument`, `ingest_time`, `tick_id`; book levels are kept as JSON
//! text next to the best bid and ask.

use feed_types::candle::Candle;
use feed_types::features::FeatureVector;
use feed_types::ids::{InstrumentId, TickId};
use feed_types::numeric::{Price, Quantity};
use feed_types::tick::{BookLevel, DataKind, OptionType, Side, Tick, TickPayload};
use feed_types::timeframe::Timeframe;
use rust_decimal::Decimal;
use storage::{Column, ColumnType, Row, Schema, Value};
use thiserror::Error;

/// Prefix of feature columns in candle schemas.
pub const FEATURE_PREFIX: &str = "f_";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RowError {
    #[error("row ended before column {0}")]
    Missing(usize),

    #[error("column {column}: {detail}")]
    Invalid { column: usize, detail: String },
}

pub fn tick_dataset(kind: DataKind) -> &'static str {
    kind.as_str()
}

pub fn candle_dataset(timeframe: Timeframe) -> String {
    format!("candles_{}", timeframe.label())
}

fn required(name: &str, ty: ColumnType) -> Column {
    Column::required(name, ty)
}

fn nullable(name: &str, ty: ColumnType) -> Column {
    Column::nullable(name, ty)
}

// ── Tick rows ───────────────────────────────────────────────────────

pub fn tick_schema(kind: DataKind) -> Schema {
    let mut columns = vec![
        required("instrument", ColumnType::Text),
        required("ingest_time", ColumnType::Int64),
        nullable("tick_id", ColumnType::Text),
    ];
    columns.extend(match kind {
        DataKind::Trade => vec![
            required("price", ColumnType::Decimal),
            required("size", ColumnType::Decimal),
            required("side", ColumnType::Text),
            required("liquidation", ColumnType::Bool),
        ],
        DataKind::BookSnapshot => vec![
            nullable("best_bid", ColumnType::Decimal),
            nullable("best_ask", ColumnType::Decimal),
            required("bids", ColumnType::Text),
            required("asks", ColumnType::Text),
        ],
        DataKind::DerivativeTicker => vec![
            nullable("mark_price", ColumnType::Decimal),
            nullable("index_price", ColumnType::Decimal),
            nullable("open_interest", ColumnType::Decimal),
            nullable("funding_rate", ColumnType::Decimal),
        ],
        DataKind::Liquidation => vec![
            required("price", ColumnType::Decimal),
            required("size", ColumnType::Decimal),
            required("side", ColumnType::Text),
        ],
        DataKind::OptionQuote => vec![
            required("strike", ColumnType::Decimal),
            required("expiry", ColumnType::Int64),
            required("option_type", ColumnType::Text),
            nullable("bid", ColumnType::Decimal),
            nullable("ask", ColumnType::Decimal),
            nullable("mark_iv", ColumnType::Decimal),
            nullable("underlying_price", ColumnType::Decimal),
        ],
        DataKind::FundingRate => vec![
            required("rate", ColumnType::Decimal),
            nullable("next_funding_time", ColumnType::Int64),
        ],
    });
    Schema { columns }
}

fn price(p: Option<Price>) -> Value {
    Value::from(p.map(|p| p.as_decimal()))
}

fn quantity(q: Option<Quantity>) -> Value {
    Value::from(q.map(|q| q.as_decimal()))
}

fn levels_json(levels: &[BookLevel]) -> Value {
    Value::Text(serde_json::to_string(levels).unwrap_or_else(|_| "[]".to_string()))
}

pub fn tick_to_row(tick: &Tick) -> Row {
    let mut values = vec![
        Value::Text(tick.instrument_id.as_str().to_string()),
        Value::Int64(tick.ingest_time),
        Value::from(tick.tick_id.map(|id| id.to_string())),
    ];
    match &tick.payload {
        TickPayload::Trade {
            price,
            size,
            side,
            liquidation,
        } => values.extend([
            Value::Decimal(price.as_decimal()),
            Value::Decimal(size.as_decimal()),
            Value::Text(side.as_str().to_string()),
            Value::Bool(*liquidation),
        ]),
        TickPayload::BookSnapshot { bids, asks } => values.extend([
            self::price(bids.first().map(|l| l.price)),
            self::price(asks.first().map(|l| l.price)),
            levels_json(bids),
            levels_json(asks),
        ]),
        TickPayload::DerivativeTicker {
            mark_price,
            index_price,
            open_interest,
            funding_rate,
        } => values.extend([
            self::price(*mark_price),
            self::price(*index_price),
            quantity(*open_interest),
            Value::from(*funding_rate),
        ]),
        TickPayload::Liquidation { price, size, side } => values.extend([
            Value::Decimal(price.as_decimal()),
            Value::Decimal(size.as_decimal()),
            Value::Text(side.as_str().to_string()),
        ]),
        TickPayload::OptionQuote {
            strike,
            expiry,
            option_type,
            bid,
            ask,
            mark_iv,
            underlying_price,
        } => values.extend([
            Value::Decimal(strike.as_decimal()),
            Value::Int64(*expiry),
            Value::Text(option_type.as_str().to_string()),
            self::price(*bid),
            self::price(*ask),
            Value::from(*mark_iv),
            self::price(*underlying_price),
        ]),
        TickPayload::FundingRate {
            rate,
            next_funding_time,
        } => values.extend([Value::Decimal(*rate), Value::from(*next_funding_time)]),
    }
    Row::new(tick.event_time, values)
}

/// Sequential reader over a row's values.
struct Cursor<'a> {
    values: &'a [Value],
    column: usize,
}

impl<'a> Cursor<'a> {
    fn new(row: &'a Row) -> Self {
        Self {
            values: &row.values,
            column: 0,
        }
    }

    fn next(&mut self) -> Result<&'a Value, RowError> {
        let value = self.values.get(self.column).ok_or(RowError::Missing(self.column))?;
        self.column += 1;
        Ok(value)
    }

    fn invalid(&self, detail: impl Into<String>) -> RowError {
        RowError::Invalid {
            column: self.column.saturating_sub(1),
            detail: detail.into(),
        }
    }

    fn text(&mut self) -> Result<&'a str, RowError> {
        let v = self.next()?;
        v.as_str().ok_or_else(|| self.invalid(format!("expected text, got {v:?}")))
    }

    fn opt_text(&mut self) -> Result<Option<&'a str>, RowError> {
        match self.next()? {
            Value::Null => Ok(None),
            Value::Text(s) => Ok(Some(s)),
            other => Err(self.invalid(format!("expected text, got {other:?}"))),
        }
    }

    fn i64(&mut self) -> Result<i64, RowError> {
        let v = self.next()?;
        v.as_i64().ok_or_else(|| self.invalid(format!("expected int64, got {v:?}")))
    }

    fn opt_i64(&mut self) -> Result<Option<i64>, RowError> {
        match self.next()? {
            Value::Null => Ok(None),
            Value::Int64(v) => Ok(Some(*v)),
            other => Err(self.invalid(format!("expected int64, got {other:?}"))),
        }
    }

    fn u64(&mut self) -> Result<u64, RowError> {
        let v = self.next()?;
        v.as_u64().ok_or_else(|| self.invalid(format!("expected uint64, got {v:?}")))
    }

    fn bool(&mut self) -> Result<bool, RowError> {
        let v = self.next()?;
        v.as_bool().ok_or_else(|| self.invalid(format!("expected bool, got {v:?}")))
    }

    fn decimal(&mut self) -> Result<Decimal, RowError> {
        let v = self.next()?;
        v.as_decimal().ok_or_else(|| self.invalid(format!("expected decimal, got {v:?}")))
    }

    fn opt_decimal(&mut self) -> Result<Option<Decimal>, RowError> {
        match self.next()? {
            Value::Null => Ok(None),
            Value::Decimal(d) => Ok(Some(*d)),
            other => Err(self.invalid(format!("expected decimal, got {other:?}"))),
        }
    }

    fn opt_f64(&mut self) -> Result<Option<f64>, RowError> {
        match self.next()? {
            Value::Null => Ok(None),
            Value::Float64(v) => Ok(Some(*v)),
            other => Err(self.invalid(format!("expected float64, got {other:?}"))),
        }
    }

    fn price(&mut self) -> Result<Price, RowError> {
        self.decimal().map(Price::new)
    }

    fn opt_price(&mut self) -> Result<Option<Price>, RowError> {
        Ok(self.opt_decimal()?.map(Price::new))
    }

    fn quantity(&mut self) -> Result<Quantity, RowError> {
        let d = self.decimal()?;
        Quantity::try_new(d).ok_or_else(|| self.invalid(format!("negative quantity {d}")))
    }

    fn opt_quantity(&mut self) -> Result<Option<Quantity>, RowError> {
        match self.opt_decimal()? {
            None => Ok(None),
            Some(d) => Quantity::try_new(d)
                .map(Some)
                .ok_or_else(|| self.invalid(format!("negative quantity {d}"))),
        }
    }

    fn side(&mut self) -> Result<Side, RowError> {
        let s = self.text()?;
        Side::parse(s).ok_or_else(|| self.invalid(format!("unknown side {s:?}")))
    }

    fn instrument(&mut self) -> Result<InstrumentId, RowError> {
        let s = self.text()?;
        InstrumentId::try_new(s).ok_or_else(|| self.invalid(format!("bad instrument id {s:?}")))
    }

    fn levels(&mut self) -> Result<Vec<BookLevel>, RowError> {
        let s = self.text()?;
        serde_json::from_str(s).map_err(|e| self.invalid(format!("bad book levels: {e}")))
    }
}

/// Rebuild a tick of `kind` from a row written by `tick_to_row`.
pub fn row_to_tick(kind: DataKind, row: &Row) -> Result<Tick, RowError> {
    let mut c = Cursor::new(row);
    let instrument_id = c.instrument()?;
    let ingest_time = c.i64()?;
    let tick_id = match c.opt_text()? {
        None => None,
        Some(s) => Some(TickId::parse(s).ok_or_else(|| c.invalid(format!("bad tick id {s:?}")))?),
    };

    let payload = match kind {
        DataKind::Trade => TickPayload::Trade {
            price: c.price()?,
            size: c.quantity()?,
            side: c.side()?,
            liquidation: c.bool()?,
        },
        DataKind::BookSnapshot => {
            let _best_bid = c.opt_decimal()?;
            let _best_ask = c.opt_decimal()?;
            TickPayload::BookSnapshot {
                bids: c.levels()?,
                asks: c.levels()?,
            }
        }
        DataKind::DerivativeTicker => TickPayload::DerivativeTicker {
            mark_price: c.opt_price()?,
            index_price: c.opt_price()?,
            open_interest: c.opt_quantity()?,
            funding_rate: c.opt_decimal()?,
        },
        DataKind::Liquidation => TickPayload::Liquidation {
            price: c.price()?,
            size: c.quantity()?,
            side: c.side()?,
        },
        DataKind::OptionQuote => TickPayload::OptionQuote {
            strike: c.price()?,
            expiry: c.i64()?,
            option_type: {
                let s = c.text()?;
                OptionType::parse(s).ok_or_else(|| c.invalid(format!("unknown option type {s:?}")))?
            },
            bid: c.opt_price()?,
            ask: c.opt_price()?,
            mark_iv: c.opt_decimal()?,
            underlying_price: c.opt_price()?,
        },
        DataKind::FundingRate => TickPayload::FundingRate {
            rate: c.decimal()?,
            next_funding_time: c.opt_i64()?,
        },
    };

    Ok(Tick {
        tick_id,
        instrument_id,
        event_time: row.ts,
        ingest_time,
        payload,
    })
}

// ── Candle rows ─────────────────────────────────────────────────────

/// Candle columns followed by one nullable `f_<name>` column per feature.
pub fn candle_schema(feature_names: &[String]) -> Schema {
    let mut columns = vec![
        required("instrument", ColumnType::Text),
        required("timeframe", ColumnType::Text),
        required("window_end", ColumnType::Int64),
        nullable("open", ColumnType::Decimal),
        nullable("high", ColumnType::Decimal),
        nullable("low", ColumnType::Decimal),
        nullable("close", ColumnType::Decimal),
        required("volume", ColumnType::Decimal),
        required("trade_count", ColumnType::UInt64),
        nullable("vwap", ColumnType::Decimal),
        required("vwap_numerator", ColumnType::Decimal),
        nullable("mark_price", ColumnType::Decimal),
        nullable("index_price", ColumnType::Decimal),
        nullable("open_interest", ColumnType::Decimal),
        nullable("funding_rate", ColumnType::Decimal),
        nullable("best_bid", ColumnType::Decimal),
        nullable("best_ask", ColumnType::Decimal),
        required("liquidation_volume", ColumnType::Decimal),
        required("liquidation_count", ColumnType::UInt64),
        required("completion_time", ColumnType::Int64),
        required("is_empty", ColumnType::Bool),
    ];
    columns.extend(
        feature_names
            .iter()
            .map(|name| nullable(&format!("{FEATURE_PREFIX}{name}"), ColumnType::Float64)),
    );
    Schema { columns }
}

/// Row for `candle`. Feature columns follow `feature_names`; without a vector
/// they are null.
pub fn candle_row(candle: &Candle, features: Option<&FeatureVector>, feature_names: &[String]) -> Row {
    let mut values = vec![
        Value::Text(candle.instrument_id.as_str().to_string()),
        Value::Text(candle.timeframe.label().to_string()),
        Value::Int64(candle.window_end),
        price(candle.open),
        price(candle.high),
        price(candle.low),
        price(candle.close),
        Value::Decimal(candle.volume.as_decimal()),
        Value::UInt64(candle.trade_count),
        Value::from(candle.vwap()),
        Value::Decimal(candle.vwap_numerator),
        price(candle.mark_price),
        price(candle.index_price),
        quantity(candle.open_interest),
        Value::from(candle.funding_rate),
        price(candle.best_bid),
        price(candle.best_ask),
        Value::Decimal(candle.liquidation_volume.as_decimal()),
        Value::UInt64(candle.liquidation_count),
        Value::Int64(candle.completion_time),
        Value::Bool(candle.is_empty),
    ];
    values.extend(
        feature_names
            .iter()
            .map(|name| Value::from(features.and_then(|f| f.value(name)))),
    );
    Row::new(candle.window_start, values)
}

/// Rebuild the candle and its feature values from a `candle_row` row.
pub fn row_to_candle(row: &Row) -> Result<(Candle, Vec<Option<f64>>), RowError> {
    let mut c = Cursor::new(row);
    let instrument_id = c.instrument()?;
    let timeframe = {
        let label = c.text()?;
        label
            .parse::<Timeframe>()
            .map_err(|e| c.invalid(e))?
    };
    let window_end = c.i64()?;
    let open = c.opt_price()?;
    let high = c.opt_price()?;
    let low = c.opt_price()?;
    let close = c.opt_price()?;
    let volume = c.quantity()?;
    let trade_count = c.u64()?;
    let _vwap = c.opt_decimal()?;
    let vwap_numerator = c.decimal()?;

    let candle = Candle {
        instrument_id,
        timeframe,
        window_start: row.ts,
        window_end,
        open,
        high,
        low,
        close,
        volume,
        trade_count,
        vwap_numerator,
        mark_price: c.opt_price()?,
        index_price: c.opt_price()?,
        open_interest: c.opt_quantity()?,
        funding_rate: c.opt_decimal()?,
        best_bid: c.opt_price()?,
        best_ask: c.opt_price()?,
        liquidation_volume: c.quantity()?,
        liquidation_count: c.u64()?,
        completion_time: c.i64()?,
        is_empty: c.bool()?,
    };

    let mut features = Vec::new();
    while c.column < row.values.len() {
        features.push(c.opt_f64()?);
    }
    Ok((candle, features))
}
