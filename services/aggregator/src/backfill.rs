//! Historical reprocessing
//!
//! Replays persisted raw ticks through the same `TimeframeLadder` and
//! `FeatureCalculator` the live pipeline uses. Days are loaded one at a time
//! with full scans, so memory stays bounded by one day of one group.
//!
//! Within a day, ticks are ordered by `(event_time, kind, ingest_time)` and
//! each is folded with `now = event_time`. After the last day the ladder is
//! advanced to the end of the range, which closes every window inside it.

use std::collections::{BTreeMap, VecDeque};
use std::ops::RangeInclusive;
use std::sync::Arc;

use chrono::NaiveDate;
use feed_types::candle::Candle;
use feed_types::errors::Diagnostic;
use feed_types::features::FeatureVector;
use feed_types::tick::{DataKind, Tick};
use feed_types::timeframe::{day_start_nanos, Timeframe, NANOS_PER_DAY};
use storage::{PartitionKey, PartitionStore, ReadPolicy, StorageBackend, StorageError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::candles::{BuilderConfig, TimeframeLadder};
use crate::config::ConfigError;
use crate::features::{FeatureCalculator, FeatureSchema};
use crate::metrics::EngineMetrics;
use crate::registry::InstrumentSpec;
use crate::rows::{candle_dataset, row_to_candle, row_to_tick, tick_dataset, RowError};
use crate::sink::CandleUpdate;

#[derive(Error, Debug)]
pub enum BackfillError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Undecodable row in {key}: {source}")]
    Row { key: PartitionKey, source: RowError },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Empty day range {start}..={end}")]
    EmptyRange { start: NaiveDate, end: NaiveDate },
}

pub struct Backfill<'a, B> {
    store: &'a PartitionStore<B>,
    builder: BuilderConfig,
    policy: ReadPolicy,
    metrics: Option<Arc<EngineMetrics>>,
}

impl<'a, B: StorageBackend> Backfill<'a, B> {
    pub fn new(store: &'a PartitionStore<B>, builder: BuilderConfig) -> Self {
        Self {
            store,
            builder,
            policy: ReadPolicy::FailFast,
            metrics: None,
        }
    }

    /// Skip undecodable blocks instead of failing the replay.
    pub fn with_policy(mut self, policy: ReadPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Candles of every timeframe of `spec` for the UTC days in `days`,
    /// in the order the ladder closes them.
    pub fn reprocess(
        &self,
        spec: &InstrumentSpec,
        days: RangeInclusive<NaiveDate>,
    ) -> Result<ReprocessIter<'a, B>, BackfillError> {
        let (first, last) = (*days.start(), *days.end());
        if first > last {
            return Err(BackfillError::EmptyRange { start: first, end: last });
        }
        let ladder = TimeframeLadder::new(spec.instrument_id.clone(), &spec.timeframes, &self.builder)?;
        let kinds: Vec<DataKind> = DataKind::ALL
            .into_iter()
            .filter(|k| k.folds_into_candles() && spec.wants(*k))
            .collect();

        info!(
            instrument = %spec.instrument_id,
            start = %first,
            end = %last,
            kinds = kinds.len(),
            "Starting reprocess"
        );

        Ok(ReprocessIter {
            store: self.store,
            policy: self.policy,
            metrics: self.metrics.clone(),
            spec: spec.clone(),
            kinds,
            ladder,
            next_day: Some(first),
            last_day: last,
            end: day_start_nanos(last) + NANOS_PER_DAY + self.builder.late_grace_nanos(),
            pending: VecDeque::new(),
            finished: false,
        })
    }

    /// Reprocess, then compute features per timeframe with the batch path.
    pub fn reprocess_with_features(
        &self,
        spec: &InstrumentSpec,
        days: RangeInclusive<NaiveDate>,
        schema: Arc<FeatureSchema>,
    ) -> Result<BTreeMap<Timeframe, Vec<CandleUpdate>>, BackfillError> {
        let mut by_timeframe: BTreeMap<Timeframe, Vec<Candle>> = BTreeMap::new();
        for candle in self.reprocess(spec, days)? {
            let candle = candle?;
            by_timeframe.entry(candle.timeframe).or_default().push(candle);
        }

        let calculator = FeatureCalculator::new(schema);
        Ok(by_timeframe
            .into_iter()
            .map(|(tf, candles)| {
                let vectors = calculator.compute_batch(&candles);
                (tf, zip_features(candles, vectors))
            })
            .collect())
    }

    /// Persisted candles of `group` with `start <= window_start < end`, each
    /// with its stored feature values. Only blocks overlapping the range are read.
    pub fn load_candles(
        &self,
        group: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
    ) -> Result<Vec<(Candle, Vec<Option<f64>>)>, BackfillError> {
        let key = PartitionKey::new(candle_dataset(timeframe), group)?;
        let scan = self.store.scan_range(&key, start, end, self.policy)?;
        report_skipped(self.metrics.as_deref(), &key, scan.skipped.len());
        scan.rows
            .iter()
            .map(|row| row_to_candle(row).map_err(|source| BackfillError::Row { key: key.clone(), source }))
            .collect()
    }
}

fn report_skipped(metrics: Option<&EngineMetrics>, key: &PartitionKey, skipped: usize) {
    if skipped == 0 {
        return;
    }
    warn!(key = %key, blocks = skipped, "Skipped undecodable blocks");
    if let Some(metrics) = metrics {
        metrics.record_n(Diagnostic::StorageDecodeError, skipped as u64);
    }
}

/// Lazily reprocessed candles. Stops after the first error.
pub struct ReprocessIter<'a, B> {
    store: &'a PartitionStore<B>,
    policy: ReadPolicy,
    metrics: Option<Arc<EngineMetrics>>,
    spec: InstrumentSpec,
    kinds: Vec<DataKind>,
    ladder: TimeframeLadder,
    next_day: Option<NaiveDate>,
    last_day: NaiveDate,
    end: i64,
    pending: VecDeque<Candle>,
    finished: bool,
}

impl<B: StorageBackend> ReprocessIter<'_, B> {
    fn load_day(&self, day: NaiveDate) -> Result<Vec<Tick>, BackfillError> {
        let mut ticks = Vec::new();
        for &kind in &self.kinds {
            let key = PartitionKey::new(tick_dataset(kind), self.spec.group.as_str())?;
            let scan = self.store.scan_day(&key, day, self.policy)?;
            report_skipped(self.metrics.as_deref(), &key, scan.skipped.len());
            for row in &scan.rows {
                let tick = row_to_tick(kind, row).map_err(|source| BackfillError::Row { key: key.clone(), source })?;
                if tick.instrument_id == self.spec.instrument_id {
                    ticks.push(tick);
                }
            }
        }
        ticks.sort_by_key(|t| (t.event_time, t.kind().index(), t.ingest_time));
        debug!(instrument = %self.spec.instrument_id, day = %day, ticks = ticks.len(), "Loaded day");
        Ok(ticks)
    }

    fn advance(&mut self) -> Result<(), BackfillError> {
        match self.next_day {
            Some(day) => {
                self.next_day = day.succ_opt().filter(|d| *d <= self.last_day);
                for tick in self.load_day(day)? {
                    let out = self.ladder.on_tick(&tick, tick.event_time);
                    if !out.late.is_empty() {
                        if let Some(metrics) = &self.metrics {
                            metrics.record_n(Diagnostic::LateTickDropped, out.late.len() as u64);
                        }
                    }
                    self.pending.extend(out.candles);
                }
            }
            None => {
                self.pending.extend(self.ladder.on_timer(self.end).candles);
                self.finished = true;
            }
        }
        Ok(())
    }
}

impl<B: StorageBackend> Iterator for ReprocessIter<'_, B> {
    type Item = Result<Candle, BackfillError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(candle) = self.pending.pop_front() {
                return Some(Ok(candle));
            }
            if self.finished {
                return None;
            }
            if let Err(err) = self.advance() {
                self.finished = true;
                self.pending.clear();
                return Some(Err(err));
            }
        }
    }
}

/// Pair every candle with the feature vector at the same position.
pub fn zip_features(candles: Vec<Candle>, features: Vec<FeatureVector>) -> Vec<CandleUpdate> {
    candles
        .into_iter()
        .zip(features)
        .map(|(candle, features)| CandleUpdate { candle, features })
        .collect()
}
