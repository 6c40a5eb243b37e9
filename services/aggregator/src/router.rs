//! Tick router with fallback derivation
//!
//! Classifies each incoming tick by its data kind and dispatches it through a
//! fixed routing table. Kinds without a native source in this deployment are
//! produced by fallback derivations attached to the kind they derive from.
//!
//! - The table is a fixed array indexed by `DataKind::index()`
//! - Fallback chains are resolved once in `RouterBuilder::build()`; the
//!   first candidate whose source kind is available wins
//! - A bounded window of recently seen `TickId`s drops duplicate deliveries
//!
//! Unhandled kinds and duplicates are expected in normal operation: they are
//! reported through `RoutingOutcome`, never as errors.

use std::collections::{HashSet, VecDeque};

use feed_types::ids::TickId;
use feed_types::numeric::{Price, Quantity};
use feed_types::tick::{DataKind, Tick, TickPayload};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ConfigError;

// ── Configuration ───────────────────────────────────────────────────

/// Transform producing one kind from another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Derivation {
    /// Trade → Liquidation, for trades flagged as liquidations and/or at or
    /// above a size threshold.
    LiquidationFromTrade {
        #[serde(default)]
        min_size: Option<Decimal>,
        #[serde(default)]
        require_flag: bool,
    },
    /// DerivativeTicker → FundingRate, from the ticker's funding field.
    FundingFromTicker,
    /// BookSnapshot → DerivativeTicker, mark price taken as the top-of-book mid.
    TickerFromBook,
    /// FundingRate → DerivativeTicker carrying only the funding rate.
    TickerFromFunding,
}

impl Derivation {
    pub fn source(&self) -> DataKind {
        match self {
            Derivation::LiquidationFromTrade { .. } => DataKind::Trade,
            Derivation::FundingFromTicker => DataKind::DerivativeTicker,
            Derivation::TickerFromBook => DataKind::BookSnapshot,
            Derivation::TickerFromFunding => DataKind::FundingRate,
        }
    }

    pub fn target(&self) -> DataKind {
        match self {
            Derivation::LiquidationFromTrade { .. } => DataKind::Liquidation,
            Derivation::FundingFromTicker => DataKind::FundingRate,
            Derivation::TickerFromBook | Derivation::TickerFromFunding => DataKind::DerivativeTicker,
        }
    }

    /// Derive a tick of `target()` from a tick of `source()`, if it qualifies.
    pub fn apply(&self, tick: &Tick) -> Option<Tick> {
        let payload = match (self, &tick.payload) {
            (
                Derivation::LiquidationFromTrade { min_size, require_flag },
                TickPayload::Trade { price, size, side, liquidation },
            ) => {
                if *require_flag && !liquidation {
                    return None;
                }
                if let Some(min) = min_size {
                    if size.as_decimal() < *min {
                        return None;
                    }
                }
                TickPayload::Liquidation {
                    price: *price,
                    size: *size,
                    side: *side,
                }
            }
            (
                Derivation::FundingFromTicker,
                TickPayload::DerivativeTicker {
                    funding_rate: Some(rate),
                    ..
                },
            ) => TickPayload::FundingRate {
                rate: *rate,
                next_funding_time: None,
            },
            (Derivation::TickerFromBook, TickPayload::BookSnapshot { bids, asks }) => {
                let bid = bids.first()?.price.as_decimal();
                let ask = asks.first()?.price.as_decimal();
                TickPayload::DerivativeTicker {
                    mark_price: Some(Price::new((bid + ask) / Decimal::TWO)),
                    index_price: None,
                    open_interest: None::<Quantity>,
                    funding_rate: None,
                }
            }
            (Derivation::TickerFromFunding, TickPayload::FundingRate { rate, .. }) => {
                TickPayload::DerivativeTicker {
                    mark_price: None,
                    index_price: None,
                    open_interest: None,
                    funding_rate: Some(*rate),
                }
            }
            _ => return None,
        };

        Some(Tick {
            tick_id: None,
            instrument_id: tick.instrument_id.clone(),
            event_time: tick.event_time,
            ingest_time: tick.ingest_time,
            payload,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Kinds the transport delivers natively in this deployment.
    pub available_sources: Vec<DataKind>,
    /// Kinds downstream consumers want.
    pub enabled_kinds: Vec<DataKind>,
    /// Fallback candidates in priority order.
    pub fallbacks: Vec<Derivation>,
    /// Number of recent tick ids remembered for dedup; 0 disables dedup.
    pub dedup_window: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            available_sources: DataKind::ALL.to_vec(),
            enabled_kinds: DataKind::ALL.to_vec(),
            fallbacks: vec![
                Derivation::LiquidationFromTrade {
                    min_size: None,
                    require_flag: true,
                },
                Derivation::FundingFromTicker,
                Derivation::TickerFromBook,
                Derivation::TickerFromFunding,
            ],
            dedup_window: 100_000,
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for derivation in &self.fallbacks {
            if let Derivation::LiquidationFromTrade { min_size, require_flag } = derivation {
                if min_size.is_none() && !require_flag {
                    return Err(ConfigError::Invalid(
                        "liquidation_from_trade needs min_size or require_flag".into(),
                    ));
                }
                if min_size.map_or(false, |m| m <= Decimal::ZERO) {
                    return Err(ConfigError::Invalid(
                        "liquidation_from_trade min_size must be positive".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

// ── Dedup ───────────────────────────────────────────────────────────

/// Bounded set of recently seen tick ids, evicted in arrival order.
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<TickId>,
    seen: HashSet<TickId>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(1 << 16)),
            seen: HashSet::with_capacity(capacity.min(1 << 16)),
        }
    }

    /// Record `id`; returns false if it was already inside the window.
    pub fn insert(&mut self, id: TickId) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if !self.seen.insert(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ── Routing ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct Route {
    native: bool,
    derivations: Vec<Derivation>,
}

/// Result of routing one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingOutcome {
    /// The native tick (if its kind is consumed) and every tick derived from it.
    Dispatched { native: Option<Tick>, derived: Vec<Tick> },
    /// Same `TickId` seen within the dedup window.
    Duplicate,
    /// No native handler and no fallback for this kind.
    Unhandled,
}

impl RoutingOutcome {
    /// All ticks to hand downstream, native first.
    pub fn into_ticks(self) -> Vec<Tick> {
        match self {
            RoutingOutcome::Dispatched { native, derived } => {
                native.into_iter().chain(derived).collect()
            }
            RoutingOutcome::Duplicate | RoutingOutcome::Unhandled => Vec::new(),
        }
    }
}

pub struct RouterBuilder {
    config: RouterConfig,
}

impl RouterBuilder {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// Resolve every fallback chain against the available sources.
    pub fn build(self) -> Result<TickRouter, ConfigError> {
        self.config.validate()?;
        let mut table: [Route; DataKind::COUNT] = Default::default();
        let available = |k: DataKind| self.config.available_sources.contains(&k);

        for &kind in &self.config.enabled_kinds {
            if available(kind) {
                table[kind.index()].native = true;
                continue;
            }
            let chosen = self
                .config
                .fallbacks
                .iter()
                .find(|d| d.target() == kind && available(d.source()));
            match chosen {
                Some(derivation) => {
                    info!(
                        kind = %kind,
                        source = %derivation.source(),
                        "Resolved fallback derivation"
                    );
                    table[derivation.source().index()]
                        .derivations
                        .push(derivation.clone());
                }
                None => warn!(kind = %kind, "No native source or fallback for enabled kind"),
            }
        }

        Ok(TickRouter {
            table,
            dedup: DedupWindow::new(self.config.dedup_window),
            stats: RouterStats::default(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub dispatched: u64,
    pub derived: u64,
    pub duplicates: u64,
    pub unhandled: u64,
}

pub struct TickRouter {
    table: [Route; DataKind::COUNT],
    dedup: DedupWindow,
    stats: RouterStats,
}

impl TickRouter {
    pub fn from_config(config: RouterConfig) -> Result<Self, ConfigError> {
        RouterBuilder::new(config).build()
    }

    /// Route one tick. The router keeps nothing but its id.
    pub fn route(&mut self, tick: Tick) -> RoutingOutcome {
        let kind = tick.kind();
        let route = &self.table[kind.index()];
        if !route.native && route.derivations.is_empty() {
            self.stats.unhandled += 1;
            debug!(kind = %kind, instrument = %tick.instrument_id, "Unroutable tick dropped");
            return RoutingOutcome::Unhandled;
        }

        if let Some(id) = tick.tick_id {
            if !self.dedup.insert(id) {
                self.stats.duplicates += 1;
                debug!(tick_id = %id, instrument = %tick.instrument_id, "Dropping duplicate tick");
                return RoutingOutcome::Duplicate;
            }
        }

        let derived: Vec<Tick> = route.derivations.iter().filter_map(|d| d.apply(&tick)).collect();
        self.stats.dispatched += 1;
        self.stats.derived += derived.len() as u64;

        let native = route.native.then_some(tick);
        RoutingOutcome::Dispatched { native, derived }
    }

    /// Whether ticks of `kind` reach any consumer.
    pub fn handles(&self, kind: DataKind) -> bool {
        let route = &self.table[kind.index()];
        route.native || !route.derivations.is_empty()
    }

    /// Derivations attached to ticks of `source`.
    pub fn derivations_for(&self, source: DataKind) -> &[Derivation] {
        &self.table[source.index()].derivations
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }
}
