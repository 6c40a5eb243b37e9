//! Indicator formulas
//!
//! Each indicator is a pure function of the trailing candle window, newest
//! last. Nothing carries over between calls, which is what makes the batch
//! and incremental paths agree.

use feed_types::candle::Candle;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndicatorSpec {
    Sma { period: usize },
    Ema { period: usize },
    Wma { period: usize },
    /// Close minus the close `period` candles earlier.
    Momentum { period: usize },
    /// Sample standard deviation of simple returns.
    Volatility { period: usize },
    /// Current volume over the trailing average volume (current included).
    VolumeRatio { period: usize },
    /// (close - rolling VWAP) / rolling VWAP.
    VwapDeviation { period: usize },
    Rsi { period: usize },
    /// Position of the close inside the band, 0 at the lower and 1 at the upper band.
    BollingerPosition { period: usize, k: f64 },
    /// Trades per second of window duration.
    TradeIntensity,
    AvgTradeSize,
    /// (high - low) / close.
    RangeSpread,
}

impl IndicatorSpec {
    pub fn name(&self) -> String {
        match self {
            IndicatorSpec::Sma { period } => format!("sma_{period}"),
            IndicatorSpec::Ema { period } => format!("ema_{period}"),
            IndicatorSpec::Wma { period } => format!("wma_{period}"),
            IndicatorSpec::Momentum { period } => format!("momentum_{period}"),
            IndicatorSpec::Volatility { period } => format!("volatility_{period}"),
            IndicatorSpec::VolumeRatio { period } => format!("volume_ratio_{period}"),
            IndicatorSpec::VwapDeviation { period } => format!("vwap_deviation_{period}"),
            IndicatorSpec::Rsi { period } => format!("rsi_{period}"),
            IndicatorSpec::BollingerPosition { period, k } => format!("bollinger_position_{period}_{k}"),
            IndicatorSpec::TradeIntensity => "trade_intensity".to_string(),
            IndicatorSpec::AvgTradeSize => "avg_trade_size".to_string(),
            IndicatorSpec::RangeSpread => "range_spread".to_string(),
        }
    }

    /// Number of candles, current included, the indicator needs.
    pub fn lookback(&self) -> usize {
        match self {
            IndicatorSpec::Sma { period }
            | IndicatorSpec::Ema { period }
            | IndicatorSpec::Wma { period }
            | IndicatorSpec::VolumeRatio { period }
            | IndicatorSpec::VwapDeviation { period }
            | IndicatorSpec::BollingerPosition { period, .. } => *period,
            IndicatorSpec::Momentum { period }
            | IndicatorSpec::Volatility { period }
            | IndicatorSpec::Rsi { period } => period + 1,
            IndicatorSpec::TradeIntensity | IndicatorSpec::AvgTradeSize | IndicatorSpec::RangeSpread => 1,
        }
    }

    pub fn period(&self) -> Option<usize> {
        match self {
            IndicatorSpec::Sma { period }
            | IndicatorSpec::Ema { period }
            | IndicatorSpec::Wma { period }
            | IndicatorSpec::Momentum { period }
            | IndicatorSpec::Volatility { period }
            | IndicatorSpec::VolumeRatio { period }
            | IndicatorSpec::VwapDeviation { period }
            | IndicatorSpec::Rsi { period }
            | IndicatorSpec::BollingerPosition { period, .. } => Some(*period),
            IndicatorSpec::TradeIntensity | IndicatorSpec::AvgTradeSize | IndicatorSpec::RangeSpread => None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |why: &str| Err(ConfigError::Invalid(format!("indicator {}: {why}", self.name())));
        match *self {
            _ if self.period() == Some(0) => invalid("period must be at least 1"),
            IndicatorSpec::Volatility { period } if period < 2 => invalid("period must be at least 2"),
            IndicatorSpec::BollingerPosition { k, .. } if !(k.is_finite() && k > 0.0) => {
                invalid("k must be positive")
            }
            _ => Ok(()),
        }
    }

    /// Value over `window` (oldest first, current candle last).
    pub fn compute(&self, window: &[Candle]) -> Option<f64> {
        let needed = self.lookback();
        if needed == 0 || window.len() < needed {
            return None;
        }
        let tail = &window[window.len() - needed..];
        let current = tail.last()?;

        match *self {
            IndicatorSpec::Sma { .. } => closes(tail).map(|c| mean(&c)),
            IndicatorSpec::Ema { period } => {
                let c = closes(tail)?;
                let alpha = 2.0 / (period as f64 + 1.0);
                Some(c[1..].iter().fold(c[0], |ema, x| alpha * x + (1.0 - alpha) * ema))
            }
            IndicatorSpec::Wma { .. } => {
                let c = closes(tail)?;
                let weights: f64 = (1..=c.len()).map(|w| w as f64).sum();
                let weighted: f64 = c.iter().enumerate().map(|(i, x)| (i + 1) as f64 * x).sum();
                Some(weighted / weights)
            }
            IndicatorSpec::Momentum { .. } => {
                let c = closes(tail)?;
                Some(c[c.len() - 1] - c[0])
            }
            IndicatorSpec::Volatility { .. } => {
                let r = returns(&closes(tail)?)?;
                sample_std(&r)
            }
            IndicatorSpec::VolumeRatio { .. } => {
                let volumes: Vec<f64> = tail.iter().map(|c| c.volume.to_f64()).collect();
                let avg = mean(&volumes);
                (avg > 0.0).then(|| current.volume.to_f64() / avg)
            }
            IndicatorSpec::VwapDeviation { .. } => {
                let close = current.close?.to_f64();
                let notional: f64 = tail.iter().map(|c| decimal_f64(c.vwap_numerator)).sum();
                let volume: f64 = tail.iter().map(|c| c.volume.to_f64()).sum();
                if volume <= 0.0 {
                    return None;
                }
                let vwap = notional / volume;
                (vwap != 0.0).then(|| (close - vwap) / vwap)
            }
            IndicatorSpec::Rsi { period } => {
                let c = closes(tail)?;
                let (mut gains, mut losses) = (0.0, 0.0);
                for pair in c.windows(2) {
                    let delta = pair[1] - pair[0];
                    if delta > 0.0 {
                        gains += delta;
                    } else {
                        losses -= delta;
                    }
                }
                let avg_gain = gains / period as f64;
                let avg_loss = losses / period as f64;
                Some(if avg_loss == 0.0 {
                    if avg_gain == 0.0 {
                        50.0
                    } else {
                        100.0
                    }
                } else {
                    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
                })
            }
            IndicatorSpec::BollingerPosition { k, .. } => {
                let c = closes(tail)?;
                let m = mean(&c);
                let sigma = population_std(&c, m);
                if sigma == 0.0 {
                    return None;
                }
                let lower = m - k * sigma;
                Some((c[c.len() - 1] - lower) / (2.0 * k * sigma))
            }
            IndicatorSpec::TradeIntensity => {
                Some(current.trade_count as f64 / current.timeframe.duration_secs_f64())
            }
            IndicatorSpec::AvgTradeSize => {
                (current.trade_count > 0).then(|| current.volume.to_f64() / current.trade_count as f64)
            }
            IndicatorSpec::RangeSpread => {
                let close = current.close?.to_f64();
                let range = current.high?.to_f64() - current.low?.to_f64();
                (close != 0.0).then(|| range / close)
            }
        }
    }
}

/// The indicator set used when none is configured.
pub fn default_indicators() -> Vec<IndicatorSpec> {
    vec![
        IndicatorSpec::Sma { period: 20 },
        IndicatorSpec::Ema { period: 20 },
        IndicatorSpec::Wma { period: 20 },
        IndicatorSpec::Momentum { period: 10 },
        IndicatorSpec::Volatility { period: 20 },
        IndicatorSpec::VolumeRatio { period: 20 },
        IndicatorSpec::VwapDeviation { period: 20 },
        IndicatorSpec::Rsi { period: 14 },
        IndicatorSpec::BollingerPosition { period: 20, k: 2.0 },
        IndicatorSpec::TradeIntensity,
        IndicatorSpec::AvgTradeSize,
        IndicatorSpec::RangeSpread,
    ]
}

/// Closes of every candle, or `None` if any window in range was empty.
fn closes(window: &[Candle]) -> Option<Vec<f64>> {
    window.iter().map(|c| c.close.map(|p| p.to_f64())).collect()
}

fn returns(closes: &[f64]) -> Option<Vec<f64>> {
    closes
        .windows(2)
        .map(|w| (w[0] != 0.0).then(|| w[1] / w[0] - 1.0))
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

fn population_std(values: &[f64], mean: f64) -> f64 {
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

fn decimal_f64(value: rust_decimal::Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_f64().unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use feed_types::ids::InstrumentId;
    use feed_types::numeric::{Price, Quantity};
    use feed_types::timeframe::Timeframe;
    use rust_decimal::Decimal;

    fn candle(i: i64, close: u64, volume: u64) -> Candle {
        let tf = Timeframe::M1;
        let start = i * tf.duration_nanos();
        let price = Price::from_u64(close);
        Candle {
            instrument_id: InstrumentId::new("BTC-PERP"),
            timeframe: tf,
            window_start: start,
            window_end: start + tf.duration_nanos(),
            open: Some(price),
            high: Some(Price::from_u64(close + 2)),
            low: Some(Price::from_u64(close.saturating_sub(2))),
            close: Some(price),
            volume: Quantity::from_u64(volume),
            trade_count: volume,
            vwap_numerator: Decimal::from(close * volume),
            mark_price: None,
            index_price: None,
            open_interest: None,
            funding_rate: None,
            best_bid: None,
            best_ask: None,
            liquidation_volume: Quantity::ZERO,
            liquidation_count: 0,
            completion_time: start + tf.duration_nanos(),
            is_empty: false,
        }
    }

    fn series(closes: &[u64]) -> Vec<Candle> {
        closes.iter().enumerate().map(|(i, c)| candle(i as i64, *c, 2)).collect()
    }

    fn empty(mut c: Candle) -> Candle {
        c.open = None;
        c.high = None;
        c.low = None;
        c.close = None;
        c.volume = Quantity::ZERO;
        c.trade_count = 0;
        c.vwap_numerator = Decimal::ZERO;
        c.is_empty = true;
        c
    }

    #[test]
    fn test_names() {
        assert_eq!(IndicatorSpec::Sma { period: 20 }.name(), "sma_20");
        assert_eq!(
            IndicatorSpec::BollingerPosition { period: 20, k: 2.0 }.name(),
            "bollinger_position_20_2"
        );
        assert_eq!(IndicatorSpec::RangeSpread.name(), "range_spread");
    }

    #[test]
    fn test_moving_averages() {
        let w = series(&[10, 20, 30]);
        assert_eq!(IndicatorSpec::Sma { period: 3 }.compute(&w), Some(20.0));
        // (1*10 + 2*20 + 3*30) / 6
        let wma = IndicatorSpec::Wma { period: 3 }.compute(&w).unwrap();
        assert!((wma - 140.0 / 6.0).abs() < 1e-12);
        // alpha = 0.5: 10 -> 15 -> 22.5
        assert_eq!(IndicatorSpec::Ema { period: 3 }.compute(&w), Some(22.5));
    }

    #[test]
    fn test_insufficient_history_is_absent() {
        let w = series(&[10, 20]);
        assert_eq!(IndicatorSpec::Sma { period: 3 }.compute(&w), None);
        assert_eq!(IndicatorSpec::Momentum { period: 2 }.compute(&w), None);
        assert_eq!(IndicatorSpec::Momentum { period: 1 }.compute(&w), Some(10.0));
    }

    #[test]
    fn test_empty_candle_in_lookback_is_absent() {
        let mut w = series(&[10, 20, 30]);
        w[1] = empty(w[1].clone());
        assert_eq!(IndicatorSpec::Sma { period: 3 }.compute(&w), None);
        assert_eq!(IndicatorSpec::Sma { period: 1 }.compute(&w), Some(30.0));
        // Volume-based indicators still see the empty window.
        assert!(IndicatorSpec::VolumeRatio { period: 3 }.compute(&w).is_some());
    }

    #[test]
    fn test_rsi_bounds() {
        let up = series(&[1, 2, 3, 4, 5]);
        assert_eq!(IndicatorSpec::Rsi { period: 4 }.compute(&up), Some(100.0));
        let flat = series(&[5, 5, 5, 5, 5]);
        assert_eq!(IndicatorSpec::Rsi { period: 4 }.compute(&flat), Some(50.0));
        let mixed = series(&[10, 12, 11]);
        // gains 2, losses 1 -> rs 2 -> 66.67
        let rsi = IndicatorSpec::Rsi { period: 2 }.compute(&mixed).unwrap();
        assert!((rsi - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_volatility_and_bollinger() {
        let flat = series(&[5, 5, 5]);
        assert_eq!(IndicatorSpec::Volatility { period: 2 }.compute(&flat), Some(0.0));
        assert_eq!(IndicatorSpec::BollingerPosition { period: 3, k: 2.0 }.compute(&flat), None);

        let w = series(&[10, 20, 30]);
        let pos = IndicatorSpec::BollingerPosition { period: 3, k: 1.0 }.compute(&w).unwrap();
        // sigma = sqrt(200/3); close sits mean + sigma * 1.2247 -> above the upper band
        assert!(pos > 1.0);
    }

    #[test]
    fn test_microstructure_ratios() {
        let w = series(&[100]);
        let intensity = IndicatorSpec::TradeIntensity.compute(&w).unwrap();
        assert!((intensity - 2.0 / 60.0).abs() < 1e-12);
        assert_eq!(IndicatorSpec::AvgTradeSize.compute(&w), Some(1.0));
        assert_eq!(IndicatorSpec::RangeSpread.compute(&w), Some(0.04));

        let e = vec![empty(candle(0, 100, 0))];
        assert_eq!(IndicatorSpec::TradeIntensity.compute(&e), Some(0.0));
        assert_eq!(IndicatorSpec::AvgTradeSize.compute(&e), None);
        assert_eq!(IndicatorSpec::RangeSpread.compute(&e), None);
    }

    #[test]
    fn test_vwap_deviation() {
        let w = series(&[100, 100, 110]);
        // vwap = (200 + 200 + 220) / 6 = 103.33
        let dev = IndicatorSpec::VwapDeviation { period: 3 }.compute(&w).unwrap();
        assert!((dev - (110.0 - 620.0 / 6.0) / (620.0 / 6.0)).abs() < 1e-12);
    }

    #[test]
    fn test_validate() {
        assert!(IndicatorSpec::Sma { period: 0 }.validate().is_err());
        assert!(IndicatorSpec::Volatility { period: 1 }.validate().is_err());
        assert!(IndicatorSpec::BollingerPosition { period: 20, k: 0.0 }.validate().is_err());
        assert!(IndicatorSpec::TradeIntensity.validate().is_ok());
        for spec in default_indicators() {
            assert!(spec.validate().is_ok(), "{}", spec.name());
        }
    }
}
