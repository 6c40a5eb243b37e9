//! Rolling feature calculator
//!
//! Two entry points over one formula set:
//! - `compute_incremental` appends a closed candle to the `FeatureHistory`
//!   ring and evaluates the indicators over its contents (live path)
//! - `compute_batch` evaluates the same indicators over the trailing window
//!   ending at each candle of an ordered slice (backfill path)
//!
//! Both end in `evaluate(schema, window)` with windows of identical content,
//! so the n-th incremental vector equals the n-th batch vector exactly.

mod history;
mod indicators;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use feed_types::candle::Candle;
use feed_types::errors::Diagnostic;
use feed_types::features::FeatureVector;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use history::FeatureHistory;
pub use indicators::{default_indicators, IndicatorSpec};

use crate::config::ConfigError;
use crate::metrics::EngineMetrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub indicators: Vec<IndicatorSpec>,
    /// Ring-buffer size per (instrument, timeframe). Defaults to the longest
    /// indicator lookback.
    pub history_capacity: Option<usize>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            indicators: default_indicators(),
            history_capacity: None,
        }
    }
}

impl FeatureConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        FeatureSchema::new(self).map(|_| ())
    }
}

/// Validated, fixed indicator layout shared by every calculator.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSchema {
    specs: Vec<IndicatorSpec>,
    names: Arc<[String]>,
    capacity: usize,
}

impl FeatureSchema {
    pub fn new(config: &FeatureConfig) -> Result<Self, ConfigError> {
        let mut names: Vec<String> = Vec::with_capacity(config.indicators.len());
        for spec in &config.indicators {
            spec.validate()?;
            let name = spec.name();
            if names.contains(&name) {
                return Err(ConfigError::Invalid(format!("duplicate indicator {name}")));
            }
            names.push(name);
        }

        let max_lookback = config.indicators.iter().map(IndicatorSpec::lookback).max().unwrap_or(1);
        let capacity = config.history_capacity.unwrap_or(max_lookback);
        if let Some(spec) = config.indicators.iter().find(|s| s.lookback() > capacity) {
            return Err(ConfigError::LookbackExceedsCapacity {
                indicator: spec.name(),
                lookback: spec.lookback(),
                capacity,
            });
        }

        Ok(Self {
            specs: config.indicators.clone(),
            names: names.into(),
            capacity: capacity.max(1),
        })
    }

    pub fn names(&self) -> &Arc<[String]> {
        &self.names
    }

    pub fn specs(&self) -> &[IndicatorSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Candles kept per history; every window handed to `evaluate` is at most this long.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Indicators whose lookback is not met by `available` candles.
    pub fn insufficient(&self, available: usize) -> usize {
        self.specs.iter().filter(|s| s.lookback() > available).count()
    }
}

/// Evaluate every indicator over `window`, whose last candle is the current one.
pub fn evaluate(schema: &FeatureSchema, window: &[Candle]) -> Vec<Option<f64>> {
    schema.specs.iter().map(|s| s.compute(window)).collect()
}

pub struct FeatureCalculator {
    schema: Arc<FeatureSchema>,
    history: FeatureHistory,
    metrics: Option<Arc<EngineMetrics>>,
}

impl FeatureCalculator {
    pub fn new(schema: Arc<FeatureSchema>) -> Self {
        let history = FeatureHistory::new(schema.capacity());
        Self {
            schema,
            history,
            metrics: None,
        }
    }

    /// Count missing lookbacks and emitted vectors into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn schema(&self) -> &Arc<FeatureSchema> {
        &self.schema
    }

    pub fn history(&self) -> &FeatureHistory {
        &self.history
    }

    /// Live path: push `candle` into the history and evaluate.
    pub fn compute_incremental(&mut self, candle: Candle) -> FeatureVector {
        let instrument_id = candle.instrument_id.clone();
        let (timeframe, window_start) = (candle.timeframe, candle.window_start);

        self.history.push(candle);
        let window = self.history.window();
        let insufficient = self.schema.insufficient(window.len());
        let values = evaluate(&self.schema, window);
        self.record(insufficient);

        FeatureVector {
            instrument_id,
            timeframe,
            window_start,
            names: self.schema.names.clone(),
            values,
        }
    }

    /// Batch path: one vector per candle, each over the trailing window ending at it.
    pub fn compute_batch(&self, candles: &[Candle]) -> Vec<FeatureVector> {
        let capacity = self.schema.capacity();
        let vectors: Vec<FeatureVector> = candles
            .iter()
            .enumerate()
            .map(|(i, current)| {
                let window = &candles[(i + 1).saturating_sub(capacity)..=i];
                self.record(self.schema.insufficient(window.len()));
                FeatureVector {
                    instrument_id: current.instrument_id.clone(),
                    timeframe: current.timeframe,
                    window_start: current.window_start,
                    names: self.schema.names.clone(),
                    values: evaluate(&self.schema, window),
                }
            })
            .collect();
        debug!(candles = candles.len(), "Batch features computed");
        vectors
    }

    fn record(&self, insufficient: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.feature_vectors.fetch_add(1, Ordering::Relaxed);
            if insufficient > 0 {
                metrics.record_n(Diagnostic::InsufficientHistory, insufficient as u64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feed_types::ids::InstrumentId;
    use feed_types::numeric::{Price, Quantity};
    use feed_types::timeframe::Timeframe;
    use rust_decimal::Decimal;

    fn candle(i: i64, close: u64) -> Candle {
        let d = Timeframe::M1.duration_nanos();
        let price = Price::from_u64(close);
        Candle {
            instrument_id: InstrumentId::new("BTC-PERP"),
            timeframe: Timeframe::M1,
            window_start: i * d,
            window_end: (i + 1) * d,
            open: Some(price),
            high: Some(price),
            low: Some(price),
            close: Some(price),
            volume: Quantity::from_u64(1),
            trade_count: 1,
            vwap_numerator: Decimal::from(close),
            mark_price: None,
            index_price: None,
            open_interest: None,
            funding_rate: None,
            best_bid: None,
            best_ask: None,
            liquidation_volume: Quantity::ZERO,
            liquidation_count: 0,
            completion_time: (i + 1) * d,
            is_empty: false,
        }
    }

    fn schema(indicators: Vec<IndicatorSpec>) -> Arc<FeatureSchema> {
        Arc::new(
            FeatureSchema::new(&FeatureConfig {
                indicators,
                history_capacity: None,
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_capacity_defaults_to_max_lookback() {
        let s = schema(vec![IndicatorSpec::Sma { period: 5 }, IndicatorSpec::Rsi { period: 14 }]);
        assert_eq!(s.capacity(), 15);
        assert_eq!(s.names().to_vec(), vec!["sma_5".to_string(), "rsi_14".to_string()]);
    }

    #[test]
    fn test_lookback_exceeding_capacity_rejected() {
        let config = FeatureConfig {
            indicators: vec![IndicatorSpec::Momentum { period: 10 }],
            history_capacity: Some(10),
        };
        assert!(matches!(
            FeatureSchema::new(&config),
            Err(ConfigError::LookbackExceedsCapacity { lookback: 11, capacity: 10, .. })
        ));
    }

    #[test]
    fn test_duplicate_indicator_rejected() {
        let config = FeatureConfig {
            indicators: vec![IndicatorSpec::Sma { period: 3 }, IndicatorSpec::Sma { period: 3 }],
            history_capacity: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_absent_until_lookback_met() {
        let mut calc = FeatureCalculator::new(schema(vec![IndicatorSpec::Sma { period: 3 }]));
        let metrics = Arc::new(EngineMetrics::new());
        calc = calc.with_metrics(metrics.clone());

        assert_eq!(calc.compute_incremental(candle(0, 10)).value("sma_3"), None);
        assert_eq!(calc.compute_incremental(candle(1, 20)).value("sma_3"), None);
        assert_eq!(calc.compute_incremental(candle(2, 30)).value("sma_3"), Some(20.0));
        assert_eq!(calc.compute_incremental(candle(3, 40)).value("sma_3"), Some(30.0));
        assert_eq!(calc.history().len(), 3);
        assert_eq!(metrics.count(Diagnostic::InsufficientHistory), 2);
        assert_eq!(metrics.feature_vectors.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_batch_matches_incremental() {
        let s = schema(default_indicators());
        let candles: Vec<Candle> = (0..60).map(|i| candle(i, 100 + (i as u64 * 7) % 13)).collect();

        let batch = FeatureCalculator::new(s.clone()).compute_batch(&candles);
        let mut live = FeatureCalculator::new(s);
        for (i, c) in candles.iter().enumerate() {
            assert_eq!(live.compute_incremental(c.clone()), batch[i]);
        }
    }

    #[test]
    fn test_vector_keyed_by_candle() {
        let mut calc = FeatureCalculator::new(schema(vec![IndicatorSpec::RangeSpread]));
        let v = calc.compute_incremental(candle(7, 10));
        assert_eq!(v.window_start, 7 * Timeframe::M1.duration_nanos());
        assert_eq!(v.timeframe, Timeframe::M1);
        assert_eq!(v.value("range_spread"), Some(0.0));
    }
}
