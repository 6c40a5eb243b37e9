//! Feature vector produced per closed candle

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::ids::InstrumentId;
use crate::timeframe::Timeframe;

/// Rolling indicators for one `(instrument, timeframe, window_start)`.
///
/// `names` is the calculator's fixed schema, shared between all vectors of
/// one calculator. `values[i]` is `None` when indicator `i` lacked history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub instrument_id: InstrumentId,
    pub timeframe: Timeframe,
    pub window_start: i64,
    pub names: Arc<[String]>,
    pub values: Vec<Option<f64>>,
}

impl FeatureVector {
    /// Look up an indicator by name. Outer `None`: unknown name.
    pub fn get(&self, name: &str) -> Option<Option<f64>> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.values.get(i).copied())
    }

    /// Value of a present indicator, `None` if unknown or absent.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.get(name).flatten()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<f64>)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }

    /// Number of indicators with a computed value.
    pub fn present_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }
}
