//! Read-only instrument registry
//!
//! An external collaborator owns the mapping from instrument to data-source
//! symbol, partition group, enabled timeframes and enabled data kinds. The
//! engine reads snapshots and is notified of replacements through a
//! `tokio::sync::watch` channel; it never writes.

use std::collections::BTreeMap;
use std::sync::Arc;

use feed_types::ids::InstrumentId;
use feed_types::tick::DataKind;
use feed_types::timeframe::Timeframe;
use serde::{Deserialize, Serialize};
use storage::PartitionKey;
use tokio::sync::watch;

use crate::config::ConfigError;
use crate::rows::{candle_dataset, tick_dataset};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub instrument_id: InstrumentId,
    /// Symbol at the data source, e.g. `"BTCUSDT"`.
    pub symbol: String,
    /// Partition group for persisted rows.
    pub group: String,
    pub timeframes: Vec<Timeframe>,
    pub data_kinds: Vec<DataKind>,
}

impl InstrumentSpec {
    pub fn new(
        instrument_id: InstrumentId,
        group: impl Into<String>,
        timeframes: Vec<Timeframe>,
        data_kinds: Vec<DataKind>,
    ) -> Self {
        Self {
            symbol: instrument_id.as_str().to_string(),
            instrument_id,
            group: group.into(),
            timeframes,
            data_kinds,
        }
    }

    pub fn wants(&self, kind: DataKind) -> bool {
        self.data_kinds.contains(&kind)
    }
}

/// Immutable snapshot of all configured instruments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentRegistry {
    instruments: BTreeMap<InstrumentId, Arc<InstrumentSpec>>,
}

impl InstrumentRegistry {
    pub fn from_specs(specs: impl IntoIterator<Item = InstrumentSpec>) -> Result<Self, ConfigError> {
        let mut instruments = BTreeMap::new();
        for spec in specs {
            if spec.timeframes.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "instrument {} has no timeframes",
                    spec.instrument_id
                )));
            }
            // The group must name a partition for every dataset the instrument feeds.
            let datasets = spec
                .data_kinds
                .iter()
                .map(|kind| tick_dataset(*kind).to_string())
                .chain(spec.timeframes.iter().map(|tf| candle_dataset(*tf)));
            for dataset in datasets {
                PartitionKey::new(dataset, spec.group.as_str()).map_err(|err| {
                    ConfigError::Invalid(format!(
                        "instrument {} has invalid group {:?}: {err}",
                        spec.instrument_id, spec.group
                    ))
                })?;
            }
            let id = spec.instrument_id.clone();
            if instruments.insert(id.clone(), Arc::new(spec)).is_some() {
                return Err(ConfigError::Invalid(format!("duplicate instrument {id}")));
            }
        }
        Ok(Self { instruments })
    }

    /// Parse a JSON array of `InstrumentSpec`.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let specs: Vec<InstrumentSpec> = serde_json::from_str(json)?;
        Self::from_specs(specs)
    }

    pub fn get(&self, id: &InstrumentId) -> Option<&Arc<InstrumentSpec>> {
        self.instruments.get(id)
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<InstrumentSpec>> {
        self.instruments.values()
    }
}

/// Engine-side view: latest snapshot plus change notification.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    rx: watch::Receiver<Arc<InstrumentRegistry>>,
}

impl RegistryHandle {
    /// A handle that never changes.
    pub fn fixed(registry: InstrumentRegistry) -> Self {
        let (_tx, rx) = watch::channel(Arc::new(registry));
        Self { rx }
    }

    pub fn snapshot(&self) -> Arc<InstrumentRegistry> {
        self.rx.borrow().clone()
    }

    pub fn lookup(&self, id: &InstrumentId) -> Option<Arc<InstrumentSpec>> {
        self.rx.borrow().get(id).cloned()
    }

    /// Wait for the next published snapshot. Errors once the publisher is gone.
    pub async fn changed(&mut self) -> Result<Arc<InstrumentRegistry>, watch::error::RecvError> {
        self.rx.changed().await?;
        Ok(self.snapshot())
    }
}

/// Collaborator-side handle that publishes replacement snapshots.
#[derive(Debug)]
pub struct RegistryPublisher {
    tx: watch::Sender<Arc<InstrumentRegistry>>,
}

impl RegistryPublisher {
    pub fn publish(&self, registry: InstrumentRegistry) {
        // `send_replace` succeeds with or without live receivers.
        self.tx.send_replace(Arc::new(registry));
    }
}

pub fn registry_channel(initial: InstrumentRegistry) -> (RegistryPublisher, RegistryHandle) {
    let (tx, rx) = watch::channel(Arc::new(initial));
    (RegistryPublisher { tx }, RegistryHandle { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> InstrumentSpec {
        InstrumentSpec::new(
            InstrumentId::new(id),
            "majors",
            vec![Timeframe::M1],
            vec![DataKind::Trade],
        )
    }

    #[test]
    fn test_lookup() {
        let registry = InstrumentRegistry::from_specs(vec![spec("BTC-PERP")]).unwrap();
        let handle = RegistryHandle::fixed(registry);
        assert!(handle.lookup(&InstrumentId::new("BTC-PERP")).is_some());
        assert!(handle.lookup(&InstrumentId::new("ETH-PERP")).is_none());
    }

    #[test]
    fn test_rejects_duplicates_and_empty_timeframes() {
        assert!(InstrumentRegistry::from_specs(vec![spec("A"), spec("A")]).is_err());
        let mut bad = spec("B");
        bad.timeframes.clear();
        assert!(InstrumentRegistry::from_specs(vec![bad]).is_err());
    }

    #[test]
    fn test_rejects_groups_that_are_not_partition_names() {
        for group in ["", ".", "..", "my group", "a/b", "a\\b", "tab\t"] {
            let mut bad = spec("C");
            bad.group = group.to_string();
            let err = InstrumentRegistry::from_specs(vec![bad]).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{group:?}");
        }
        let mut ok = spec("D");
        ok.group = "alt-coins_2".to_string();
        assert!(InstrumentRegistry::from_specs(vec![ok]).is_ok());
    }

    #[test]
    fn test_from_json() {
        let registry = InstrumentRegistry::from_json_str(
            r#"[{"instrument_id":"BTC-PERP","symbol":"BTCUSDT","group":"majors",
                 "timeframes":["15s","1m"],"data_kinds":["trade","derivative_ticker"]}]"#,
        )
        .unwrap();
        let btc = registry.get(&InstrumentId::new("BTC-PERP")).unwrap();
        assert_eq!(btc.symbol, "BTCUSDT");
        assert_eq!(btc.timeframes, vec![Timeframe::S15, Timeframe::M1]);
        assert!(btc.wants(DataKind::DerivativeTicker));
    }

    #[tokio::test]
    async fn test_publisher_notifies_handle() {
        let (publisher, mut handle) = registry_channel(InstrumentRegistry::default());
        assert!(handle.snapshot().is_empty());

        publisher.publish(InstrumentRegistry::from_specs(vec![spec("SOL-PERP")]).unwrap());
        let snapshot = handle.changed().await.unwrap();
        assert_eq!(snapshot.len(), 1);
    }
}
