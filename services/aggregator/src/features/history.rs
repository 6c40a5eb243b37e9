use std::collections::VecDeque;

use feed_types::candle::Candle;

/// Bounded ring of the most recent candles of one (instrument, timeframe).
#[derive(Debug, Clone)]
pub struct FeatureHistory {
    candles: VecDeque<Candle>,
    capacity: usize,
}

impl FeatureHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            candles: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `candle`, evicting the oldest once full.
    pub fn push(&mut self, candle: Candle) {
        if self.candles.len() == self.capacity {
            self.candles.pop_front();
        }
        self.candles.push_back(candle);
    }

    /// Contents oldest first as one slice.
    pub fn window(&mut self) -> &[Candle] {
        self.candles.make_contiguous()
    }

    pub fn latest(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feed_types::ids::InstrumentId;
    use feed_types::numeric::Quantity;
    use feed_types::timeframe::Timeframe;
    use rust_decimal::Decimal;

    fn empty_candle(i: i64) -> Candle {
        let d = Timeframe::M1.duration_nanos();
        Candle {
            instrument_id: InstrumentId::new("ETH-PERP"),
            timeframe: Timeframe::M1,
            window_start: i * d,
            window_end: (i + 1) * d,
            open: None,
            high: None,
            low: None,
            close: None,
            volume: Quantity::ZERO,
            trade_count: 0,
            vwap_numerator: Decimal::ZERO,
            mark_price: None,
            index_price: None,
            open_interest: None,
            funding_rate: None,
            best_bid: None,
            best_ask: None,
            liquidation_volume: Quantity::ZERO,
            liquidation_count: 0,
            completion_time: (i + 1) * d,
            is_empty: true,
        }
    }

    #[test]
    fn test_evicts_oldest() {
        let mut history = FeatureHistory::new(3);
        for i in 0..5 {
            history.push(empty_candle(i));
        }
        assert_eq!(history.len(), 3);
        let starts: Vec<i64> = history.window().iter().map(|c| c.window_start).collect();
        let d = Timeframe::M1.duration_nanos();
        assert_eq!(starts, vec![2 * d, 3 * d, 4 * d]);
        assert_eq!(history.latest().map(|c| c.window_start), Some(4 * d));
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut history = FeatureHistory::new(0);
        history.push(empty_candle(0));
        history.push(empty_candle(1));
        assert_eq!(history.len(), 1);
        assert_eq!(history.capacity(), 1);
    }
}
