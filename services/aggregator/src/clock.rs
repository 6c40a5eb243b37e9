//! Wall-clock source
//!
//! Candle completion times and timer-driven window closes read the clock
//! through this trait so tests can drive time by hand.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time, Unix nanos.
    fn now_nanos(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> i64 {
        // Out of range only after the year 2262.
        Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
    }
}

/// Manually advanced clock for tests and deterministic replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_nanos: i64) -> Self {
        Self {
            now: AtomicI64::new(start_nanos),
        }
    }

    pub fn set(&self, nanos: i64) {
        self.now.store(nanos, Ordering::SeqCst);
    }

    pub fn advance(&self, nanos: i64) {
        self.now.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
