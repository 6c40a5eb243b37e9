//! Multi-timeframe candle builder
//!
//! One `CandleBuilder` per (instrument, timeframe) owns the accumulator of the
//! currently open window. Windows are aligned to multiples of the timeframe
//! since the Unix epoch, the same alignment used by batch reprocessing.
//!
//! Only the finest enabled timeframe reads ticks. Every coarser timeframe is
//! fed the completed candles of a finer one through the same state machine,
//! so a 5m candle's open is always the first contained 1m open, its high the
//! max of the contained highs, and so on.
//!
//! Ticks older than the open window are dropped and reported as
//! `LateTickDropped`; an emitted candle is never touched again.

use feed_types::candle::Candle;
use feed_types::errors::LateTickDropped;
use feed_types::ids::InstrumentId;
use feed_types::numeric::{Price, Quantity};
use feed_types::tick::{Tick, TickPayload};
use feed_types::timeframe::Timeframe;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Emit empty candles for windows without trades instead of skipping them.
    pub emit_empty: bool,
    /// Wall-clock delay after `window_end` before the timer closes a window.
    pub late_grace_ms: u64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            emit_empty: true,
            late_grace_ms: 0,
        }
    }
}

impl BuilderConfig {
    pub fn late_grace_nanos(&self) -> i64 {
        i64::try_from(self.late_grace_ms)
            .unwrap_or(i64::MAX / 1_000_000)
            .saturating_mul(1_000_000)
    }
}

/// Fields that keep their last observed value across windows.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LastValues {
    pub mark_price: Option<Price>,
    pub index_price: Option<Price>,
    pub open_interest: Option<Quantity>,
    pub funding_rate: Option<Decimal>,
    pub best_bid: Option<Price>,
    pub best_ask: Option<Price>,
}

/// Mutable fold state of one open window.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleAccumulator {
    instrument_id: InstrumentId,
    timeframe: Timeframe,
    window_start: i64,
    window_end: i64,
    open: Option<Price>,
    high: Option<Price>,
    low: Option<Price>,
    close: Option<Price>,
    volume: Quantity,
    trade_count: u64,
    vwap_numerator: Decimal,
    last: LastValues,
    liquidation_volume: Quantity,
    liquidation_count: u64,
}

impl CandleAccumulator {
    /// Open the window of `timeframe` containing `timestamp`.
    pub fn new(instrument_id: InstrumentId, timeframe: Timeframe, timestamp: i64, last: LastValues) -> Self {
        let (window_start, window_end) = timeframe.window_bounds(timestamp);
        Self {
            instrument_id,
            timeframe,
            window_start,
            window_end,
            open: None,
            high: None,
            low: None,
            close: None,
            volume: Quantity::ZERO,
            trade_count: 0,
            vwap_numerator: Decimal::ZERO,
            last,
            liquidation_volume: Quantity::ZERO,
            liquidation_count: 0,
        }
    }

    pub fn window_start(&self) -> i64 {
        self.window_start
    }

    pub fn window_end(&self) -> i64 {
        self.window_end
    }

    pub fn trade_count(&self) -> u64 {
        self.trade_count
    }

    pub fn last_values(&self) -> LastValues {
        self.last
    }

    fn fold_price(&mut self, first: Price, high: Price, low: Price, last: Price) {
        if self.open.is_none() {
            self.open = Some(first);
        }
        self.high = Some(self.high.map_or(high, |h| h.max(high)));
        self.low = Some(self.low.map_or(low, |l| l.min(low)));
        self.close = Some(last);
    }

    pub fn fold_trade(&mut self, price: Price, size: Quantity) {
        self.fold_price(price, price, price, price);
        self.volume += size;
        self.trade_count += 1;
        self.vwap_numerator += price.as_decimal() * size.as_decimal();
    }

    pub fn fold_liquidation(&mut self, size: Quantity) {
        self.liquidation_volume += size;
        self.liquidation_count += 1;
    }

    /// Fold a completed finer candle into this coarser window.
    pub fn fold_candle(&mut self, candle: &Candle) {
        if let (Some(open), Some(high), Some(low), Some(close)) =
            (candle.open, candle.high, candle.low, candle.close)
        {
            self.fold_price(open, high, low, close);
        }
        self.volume += candle.volume;
        self.trade_count += candle.trade_count;
        self.vwap_numerator += candle.vwap_numerator;
        self.liquidation_volume += candle.liquidation_volume;
        self.liquidation_count += candle.liquidation_count;

        let last = &mut self.last;
        last.mark_price = candle.mark_price.or(last.mark_price);
        last.index_price = candle.index_price.or(last.index_price);
        last.open_interest = candle.open_interest.or(last.open_interest);
        last.funding_rate = candle.funding_rate.or(last.funding_rate);
        last.best_bid = candle.best_bid.or(last.best_bid);
        last.best_ask = candle.best_ask.or(last.best_ask);
    }

    /// Snapshot the window as an immutable candle.
    pub fn to_candle(&self, completion_time: i64) -> Candle {
        Candle {
            instrument_id: self.instrument_id.clone(),
            timeframe: self.timeframe,
            window_start: self.window_start,
            window_end: self.window_end,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            trade_count: self.trade_count,
            vwap_numerator: self.vwap_numerator,
            mark_price: self.last.mark_price,
            index_price: self.last.index_price,
            open_interest: self.last.open_interest,
            funding_rate: self.last.funding_rate,
            best_bid: self.last.best_bid,
            best_ask: self.last.best_ask,
            liquidation_volume: self.liquidation_volume,
            liquidation_count: self.liquidation_count,
            completion_time,
            is_empty: self.trade_count == 0,
        }
    }
}

/// Something that can be folded into a window.
pub trait WindowInput {
    fn instrument_id(&self) -> &InstrumentId;

    /// Timestamp that decides which window the input belongs to.
    fn event_time(&self) -> i64;

    fn fold_into(&self, acc: &mut CandleAccumulator);

    /// If the input is the last piece of a window ending at the returned
    /// time, that window can close without waiting for the next input.
    fn closes_at(&self) -> Option<i64> {
        None
    }
}

impl WindowInput for Tick {
    fn instrument_id(&self) -> &InstrumentId {
        &self.instrument_id
    }

    fn event_time(&self) -> i64 {
        self.event_time
    }

    fn fold_into(&self, acc: &mut CandleAccumulator) {
        match &self.payload {
            TickPayload::Trade { price, size, .. } => acc.fold_trade(*price, *size),
            TickPayload::BookSnapshot { bids, asks } => {
                if let Some(level) = bids.first() {
                    acc.last.best_bid = Some(level.price);
                }
                if let Some(level) = asks.first() {
                    acc.last.best_ask = Some(level.price);
                }
            }
            TickPayload::DerivativeTicker {
                mark_price,
                index_price,
                open_interest,
                funding_rate,
            } => {
                let last = &mut acc.last;
                last.mark_price = mark_price.or(last.mark_price);
                last.index_price = index_price.or(last.index_price);
                last.open_interest = open_interest.or(last.open_interest);
                last.funding_rate = funding_rate.or(last.funding_rate);
            }
            TickPayload::Liquidation { size, .. } => acc.fold_liquidation(*size),
            TickPayload::FundingRate { rate, .. } => acc.last.funding_rate = Some(*rate),
            TickPayload::OptionQuote { .. } => {}
        }
    }
}

impl WindowInput for Candle {
    fn instrument_id(&self) -> &InstrumentId {
        &self.instrument_id
    }

    fn event_time(&self) -> i64 {
        self.window_start
    }

    fn fold_into(&self, acc: &mut CandleAccumulator) {
        acc.fold_candle(self);
    }

    fn closes_at(&self) -> Option<i64> {
        Some(self.window_end)
    }
}

/// Window state machine for one (instrument, timeframe).
#[derive(Debug)]
pub struct CandleBuilder {
    instrument_id: InstrumentId,
    timeframe: Timeframe,
    emit_empty: bool,
    grace_nanos: i64,
    current: Option<CandleAccumulator>,
    /// End of the last closed window once the builder has been force-closed.
    watermark: Option<i64>,
    carry: LastValues,
}

impl CandleBuilder {
    pub fn new(instrument_id: InstrumentId, timeframe: Timeframe, config: &BuilderConfig) -> Self {
        Self {
            instrument_id,
            timeframe,
            emit_empty: config.emit_empty,
            grace_nanos: config.late_grace_nanos(),
            current: None,
            watermark: None,
            carry: LastValues::default(),
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn current(&self) -> Option<&CandleAccumulator> {
        self.current.as_ref()
    }

    /// Fold one input, returning every candle it closed in window order.
    pub fn on_input<I: WindowInput>(&mut self, input: &I, now: i64) -> Result<Vec<Candle>, LateTickDropped> {
        let t = input.event_time();
        let mut emitted = Vec::new();

        let open_start = match (&self.current, self.watermark) {
            (Some(acc), _) => Some(acc.window_start),
            (None, watermark) => watermark,
        };
        if let Some(start) = open_start {
            if t < start {
                return Err(LateTickDropped {
                    instrument_id: self.instrument_id.clone(),
                    timeframe: self.timeframe,
                    event_time: t,
                    window_start: start,
                });
            }
        }

        let target_start = self.timeframe.window_start(t);
        match self.current.take() {
            Some(acc) if acc.window_end > t => self.current = Some(acc),
            Some(acc) => {
                let next = acc.window_end;
                self.close(acc, now, &mut emitted);
                self.skip_to(next, target_start, now, &mut emitted);
            }
            None => {
                if let Some(watermark) = self.watermark.take() {
                    self.skip_to(watermark, target_start, now, &mut emitted);
                }
            }
        }

        let acc = self.current.get_or_insert_with(|| {
            CandleAccumulator::new(self.instrument_id.clone(), self.timeframe, t, self.carry)
        });
        input.fold_into(acc);

        if input.closes_at() == Some(acc.window_end) {
            if let Some(acc) = self.current.take() {
                let next = acc.window_end;
                self.close(acc, now, &mut emitted);
                self.open_at(next);
            }
        }
        Ok(emitted)
    }

    /// Close every window whose end plus the grace period has passed.
    pub fn on_timer(&mut self, now: i64) -> Vec<Candle> {
        let mut emitted = Vec::new();
        while let Some(acc) = self.current.take() {
            if now < acc.window_end.saturating_add(self.grace_nanos) {
                self.current = Some(acc);
                break;
            }
            let next = acc.window_end;
            self.close(acc, now, &mut emitted);
            if self.emit_empty {
                self.open_at(next);
            } else {
                let open = self.timeframe.window_start(now.saturating_sub(self.grace_nanos));
                self.open_at(open.max(next));
            }
        }
        emitted
    }

    /// Close the open window regardless of the clock. Inputs before its end
    /// are late from now on. A window that has not started by `now` is
    /// discarded instead.
    pub fn force_close(&mut self, now: i64) -> Vec<Candle> {
        let mut emitted = Vec::new();
        if let Some(acc) = self.current.take() {
            if acc.window_start > now {
                self.watermark = Some(acc.window_start);
                self.carry = acc.last;
            } else {
                self.watermark = Some(acc.window_end);
                self.close(acc, now, &mut emitted);
            }
        }
        emitted
    }

    fn close(&mut self, acc: CandleAccumulator, now: i64, emitted: &mut Vec<Candle>) {
        self.carry = acc.last;
        if acc.trade_count > 0 || self.emit_empty {
            let candle = acc.to_candle(now);
            debug!(
                instrument = %candle.instrument_id,
                timeframe = %candle.timeframe,
                window_start = candle.window_start,
                is_empty = candle.is_empty,
                "Candle closed"
            );
            emitted.push(candle);
        }
    }

    fn open_at(&mut self, window_start: i64) {
        self.current = Some(CandleAccumulator::new(
            self.instrument_id.clone(),
            self.timeframe,
            window_start,
            self.carry,
        ));
    }

    /// Emit empty candles for every window in `[from, until)` when configured to.
    fn skip_to(&mut self, from: i64, until: i64, now: i64, emitted: &mut Vec<Candle>) {
        if !self.emit_empty {
            return;
        }
        let duration = self.timeframe.duration_nanos();
        let mut start = from;
        while start < until {
            let acc = CandleAccumulator::new(self.instrument_id.clone(), self.timeframe, start, self.carry);
            emitted.push(acc.to_candle(now));
            start += duration;
        }
    }
}

/// Candles closed by one ladder call, plus inputs rejected as late.
#[derive(Debug, Default)]
pub struct LadderOutput {
    pub candles: Vec<Candle>,
    pub late: Vec<LateTickDropped>,
}

#[derive(Debug)]
struct Level {
    builder: CandleBuilder,
    /// Index of the finer level feeding this one; `None` for the base.
    source: Option<usize>,
}

/// All enabled timeframes of one instrument, finest first.
#[derive(Debug)]
pub struct TimeframeLadder {
    instrument_id: InstrumentId,
    levels: Vec<Level>,
}

impl TimeframeLadder {
    pub fn new(
        instrument_id: InstrumentId,
        timeframes: &[Timeframe],
        config: &BuilderConfig,
    ) -> Result<Self, ConfigError> {
        let mut sorted = timeframes.to_vec();
        sorted.sort();
        sorted.dedup();
        if sorted.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "instrument {instrument_id} has no timeframes"
            )));
        }

        let mut levels: Vec<Level> = Vec::with_capacity(sorted.len());
        for (i, &tf) in sorted.iter().enumerate() {
            let source = if i == 0 {
                None
            } else {
                let feeder = (0..i).rev().find(|&j| sorted[j].divides(tf));
                match feeder {
                    Some(j) => Some(j),
                    None => {
                        return Err(ConfigError::Invalid(format!(
                            "timeframe {tf} of {instrument_id} has no finer enabled timeframe dividing it"
                        )))
                    }
                }
            };
            levels.push(Level {
                builder: CandleBuilder::new(instrument_id.clone(), tf, config),
                source,
            });
        }

        Ok(Self { instrument_id, levels })
    }

    pub fn instrument_id(&self) -> &InstrumentId {
        &self.instrument_id
    }

    pub fn timeframes(&self) -> impl Iterator<Item = Timeframe> + '_ {
        self.levels.iter().map(|l| l.builder.timeframe())
    }

    /// Timeframe fed directly by ticks.
    pub fn base(&self) -> Timeframe {
        self.levels[0].builder.timeframe()
    }

    /// The timeframe feeding `timeframe`, `None` for the base or unknown timeframes.
    pub fn source_of(&self, timeframe: Timeframe) -> Option<Timeframe> {
        self.levels
            .iter()
            .find(|l| l.builder.timeframe() == timeframe)
            .and_then(|l| l.source)
            .map(|j| self.levels[j].builder.timeframe())
    }

    pub fn on_tick(&mut self, tick: &Tick, now: i64) -> LadderOutput {
        let mut out = LadderOutput::default();
        if !tick.kind().folds_into_candles() {
            return out;
        }
        match self.levels[0].builder.on_input(tick, now) {
            Ok(candles) => self.cascade(0, candles, now, &mut out),
            Err(late) => out.late.push(late),
        }
        out
    }

    pub fn on_timer(&mut self, now: i64) -> LadderOutput {
        let mut out = LadderOutput::default();
        for i in 0..self.levels.len() {
            let candles = self.levels[i].builder.on_timer(now);
            self.cascade(i, candles, now, &mut out);
        }
        out
    }

    pub fn force_close(&mut self, now: i64) -> LadderOutput {
        let mut out = LadderOutput::default();
        for i in 0..self.levels.len() {
            let candles = self.levels[i].builder.force_close(now);
            self.cascade(i, candles, now, &mut out);
        }
        out
    }

    fn cascade(&mut self, level: usize, candles: Vec<Candle>, now: i64, out: &mut LadderOutput) {
        for candle in candles {
            out.candles.push(candle.clone());
            for target in level + 1..self.levels.len() {
                if self.levels[target].source != Some(level) {
                    continue;
                }
                match self.levels[target].builder.on_input(&candle, now) {
                    Ok(closed) => self.cascade(target, closed, now, out),
                    Err(late) => out.late.push(late),
                }
            }
        }
    }
}
