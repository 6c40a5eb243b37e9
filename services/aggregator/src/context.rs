//! Engine context
//!
//! Everything the pipeline components share, built once at startup and
//! handed to each worker by `Arc`. There are no module-level globals.

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{ConfigError, EngineConfig};
use crate::features::FeatureSchema;
use crate::metrics::EngineMetrics;
use crate::registry::RegistryHandle;
use crate::sink::persist::{PartitionSink, PersistRouter};
use crate::sink::serve::ServeHub;
use crate::sink::SinkRouter;

pub struct EngineContext {
    pub config: Arc<EngineConfig>,
    pub metrics: Arc<EngineMetrics>,
    pub registry: RegistryHandle,
    pub clock: Arc<dyn Clock>,
    pub features: Arc<FeatureSchema>,
    pub sinks: Arc<SinkRouter>,
}

impl EngineContext {
    /// Validate `config` and wire the sinks. Configuration errors are the
    /// only fatal errors the engine raises.
    pub fn new(
        config: EngineConfig,
        registry: RegistryHandle,
        storage: Arc<dyn PartitionSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let features = Arc::new(FeatureSchema::new(&config.features)?);
        let metrics = Arc::new(EngineMetrics::new());

        let serve = ServeHub::new(config.serve.clone(), metrics.clone());
        let persist = Arc::new(PersistRouter::new(config.persist.clone(), storage, metrics.clone()));
        let sinks = Arc::new(SinkRouter::new(serve, persist, features.names().clone()));

        Ok(Self {
            config: Arc::new(config),
            metrics,
            registry,
            clock,
            features,
            sinks,
        })
    }

    pub fn serve(&self) -> &ServeHub {
        self.sinks.serve()
    }
}
