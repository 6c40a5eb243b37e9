//! Market Data Aggregation Engine
//!
//! Turns a stream of typed ticks into:
//! - Candles on every enabled timeframe, higher timeframes composed from
//!   completed lower ones
//! - Rolling feature vectors, identical between live and batch computation
//! - A drop-oldest push stream per (instrument, timeframe)
//! - Day-partitioned columnar storage of raw ticks and candles
//!
//! # Architecture
//!
//! ```text
//!      Ticks (transport)
//!            │
//!      ┌─────▼─────┐
//!      │  Router   │  ← dedup, native dispatch, fallback derivation
//!      └─────┬─────┘
//!            │ hash(instrument)
//!   ┌────────┴────────┐
//!   │  Shard worker   │  ← TimeframeLadder + FeatureCalculator per instrument
//!   └────────┬────────┘
//!            │ (Candle, FeatureVector)
//!      ┌─────┴──────┐
//!   ┌──▼──┐     ┌───▼────┐
//!   │Serve│     │Persist │ ← writer task per partition key
//!   └─────┘     └───┬────┘
//!                   │
//!              storage crate ──► Backfill (same ladder, batch features)
//! ```

pub mod backfill;
pub mod candles;
pub mod clock;
pub mod config;
pub mod context;
pub mod features;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod router;
pub mod rows;
pub mod sink;

pub use backfill::{Backfill, BackfillError, ReprocessIter};
pub use candles::{BuilderConfig, CandleBuilder, TimeframeLadder};
pub use config::{ConfigError, EngineConfig};
pub use context::EngineContext;
pub use features::{FeatureCalculator, FeatureConfig, FeatureSchema, IndicatorSpec};
pub use metrics::EngineMetrics;
pub use pipeline::{Engine, EngineError, EngineHandle};
pub use registry::{registry_channel, InstrumentRegistry, InstrumentSpec, RegistryHandle};
pub use router::{RouterConfig, RoutingOutcome, TickRouter};
pub use sink::persist::{PartitionSink, PersistConfig, PersistRouter};
pub use sink::serve::{ServeConfig, ServeHub, Subscription};
pub use sink::{CandleUpdate, SinkRouter};

// Service version
pub const SERVICE_VERSION: &str = "0.1.0";
