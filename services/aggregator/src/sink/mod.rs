//! Output sinks
//!
//! Every closed candle, paired with its feature vector, goes to two
//! independent destinations:
//! - `serve`: bounded per-subscriber queues, drop-oldest, never waits
//! - `persist`: buffered partition writers with retry and dead-lettering
//!
//! Serving happens first so a slow store never delays live consumers. Rows
//! that cannot be persisted under their partition key are dead-lettered.

pub mod persist;
pub mod serve;

use std::sync::Arc;

use feed_types::candle::Candle;
use feed_types::features::FeatureVector;
use feed_types::tick::{DataKind, Tick};
use storage::{PartitionKey, Row, Schema};

use crate::rows::{candle_dataset, candle_row, candle_schema, tick_dataset, tick_schema, tick_to_row};
use persist::{PersistError, PersistRouter};
use serve::ServeHub;

/// A closed candle and the features computed at its close.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleUpdate {
    pub candle: Candle,
    pub features: FeatureVector,
}

/// Fans candles and raw ticks out to the serve and persist paths.
pub struct SinkRouter {
    serve: ServeHub,
    persist: Arc<PersistRouter>,
    feature_names: Arc<[String]>,
    candle_schema: Arc<Schema>,
    tick_schemas: Vec<Arc<Schema>>,
}

impl SinkRouter {
    pub fn new(serve: ServeHub, persist: Arc<PersistRouter>, feature_names: Arc<[String]>) -> Self {
        let candle_schema = Arc::new(candle_schema(&feature_names));
        let tick_schemas = DataKind::ALL.iter().map(|k| Arc::new(tick_schema(*k))).collect();
        Self {
            serve,
            persist,
            feature_names,
            candle_schema,
            tick_schemas,
        }
    }

    pub fn serve(&self) -> &ServeHub {
        &self.serve
    }

    pub fn persist(&self) -> &Arc<PersistRouter> {
        &self.persist
    }

    pub fn candle_schema(&self) -> &Arc<Schema> {
        &self.candle_schema
    }

    /// Serve `update`, then hand its row to the `candles_<tf>/<group>` writer.
    pub async fn dispatch_candle(&self, group: &str, update: CandleUpdate) -> Result<(), PersistError> {
        let row = candle_row(&update.candle, Some(&update.features), &self.feature_names);
        let dataset = candle_dataset(update.candle.timeframe);

        self.serve.publish(update);

        if !self.persist.config().persist_candles {
            return Ok(());
        }
        self.persist_rows(dataset, group, &self.candle_schema, vec![row]).await
    }

    /// Persist raw ticks under `<kind>/<group>`, one submission per kind.
    pub async fn dispatch_ticks(&self, group: &str, ticks: &[Tick]) -> Result<(), PersistError> {
        if !self.persist.config().persist_ticks || ticks.is_empty() {
            return Ok(());
        }
        for kind in DataKind::ALL {
            let rows: Vec<_> = ticks.iter().filter(|t| t.kind() == kind).map(tick_to_row).collect();
            if rows.is_empty() {
                continue;
            }
            self.persist_rows(tick_dataset(kind).to_string(), group, &self.tick_schemas[kind.index()], rows)
                .await?;
        }
        Ok(())
    }

    async fn persist_rows(
        &self,
        dataset: String,
        group: &str,
        schema: &Arc<Schema>,
        rows: Vec<Row>,
    ) -> Result<(), PersistError> {
        if !self.persist.is_enabled() {
            return Ok(());
        }
        match PartitionKey::new(dataset.as_str(), group) {
            Ok(key) => self.persist.submit(&key, schema, rows).await,
            Err(err) => {
                let key = PartitionKey {
                    dataset,
                    group: group.to_string(),
                };
                self.persist.dead_letter(&key, schema, rows, err.to_string()).await;
                Err(err.into())
            }
        }
    }

    /// Drain the persist path. Subscribers see their queues closed.
    pub async fn close(&self) {
        self.persist.close().await;
        self.serve.close();
    }
}
