//! Types library for the market data aggregation engine
//!
//! Value types shared by the router, candle builder, feature calculator and
//! sinks. Everything here is immutable once produced and freely cloned
//! between pipeline stages.
//!
//! # Modules
//! - `ids`: InstrumentId, TickId, SubscriptionId
//! - `numeric`: Decimal-backed Price and Quantity
//! - `tick`: DataKind, TickPayload, Tick
//! - `timeframe`: Timeframe and UTC window alignment
//! - `candle`: closed-window Candle snapshot
//! - `features`: FeatureVector
//! - `errors`: diagnostic taxonomy

pub mod candle;
pub mod errors;
pub mod features;
pub mod ids;
pub mod numeric;
pub mod tick;
pub mod timeframe;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::candle::*;
    pub use crate::errors::*;
    pub use crate::features::*;
    pub use crate::ids::*;
    pub use crate::numeric::*;
    pub use crate::tick::*;
    pub use crate::timeframe::*;
}
