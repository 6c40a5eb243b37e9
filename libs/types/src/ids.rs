//! Identifier types for instruments, ticks and subscriptions
//!
//! `InstrumentId` is the engine-wide key for everything keyed per instrument
//! (accumulators, feature history, partitions). `TickId` is supplied by the
//! transport and used only for duplicate suppression at the router boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a tradable instrument (e.g. `"BTC-PERP"`, `"binance:BTCUSDT"`).
///
/// Opaque to the engine: the registry maps it to data-source symbols.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentId(String);

impl InstrumentId {
    /// Create a new InstrumentId.
    ///
    /// # Panics
    /// Panics if the identifier is empty or contains whitespace.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        assert!(
            Self::is_well_formed(&id),
            "InstrumentId must be non-empty and contain no whitespace"
        );
        Self(id)
    }

    /// Fallible constructor for identifiers coming from external input.
    pub fn try_new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        Self::is_well_formed(&id).then_some(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_well_formed(id: &str) -> bool {
        !id.is_empty() && !id.chars().any(char::is_whitespace)
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstrumentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Stable identifier of a single tick, supplied by the transport.
///
/// Two deliveries of the same tick carry the same `TickId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TickId(Uuid);

impl TickId {
    /// Create a fresh time-sortable identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse from the hyphenated string form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for TickId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TickId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle returned by the serve path for one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}
