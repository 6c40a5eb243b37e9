//! Persist path: buffered, retried partition writes
//!
//! One writer task per `PartitionKey`, fed through a bounded channel so slow
//! storage never stalls candle construction. A writer flushes when the first
//! of these is reached:
//! - `max_rows` buffered rows
//! - `max_bytes` of estimated row size
//! - `max_age_ms` since the oldest unflushed row arrived
//!
//! Each flush attempt runs on the blocking pool under `flush_timeout_ms`.
//! Transient failures are retried with exponential backoff; once retries are
//! exhausted, or on a permanent failure, the batch is appended to a JSON-lines
//! dead-letter file and a critical alert is raised.
//!
//! A timed-out attempt counts as a failure, but the blocking write behind it
//! cannot be cancelled. Its retry waits on that same write instead of starting
//! another, and the batch is dead-lettered only if the write itself fails, so
//! no batch is both stored and dead-lettered.
//!
//! Producers never wait on a writer. Rows that find the writer's channel full,
//! or that cannot be routed to a writer at all, are dead-lettered on the spot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use feed_types::errors::Diagnostic;
use serde::{Deserialize, Serialize};
use storage::{PartitionKey, PartitionStore, PartitionSummary, Row, Schema, StorageBackend, StorageError, WriterConfig};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ConfigError;
use crate::metrics::{Alert, AlertLevel, EngineMetrics};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    pub enabled: bool,
    /// Persist raw ticks per data kind.
    pub persist_ticks: bool,
    /// Persist candle + feature rows per timeframe.
    pub persist_candles: bool,
    pub max_rows: usize,
    pub max_bytes: usize,
    pub max_age_ms: u64,
    /// Bounded channel between producers and each writer task.
    pub channel_capacity: usize,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub flush_timeout_ms: u64,
    pub dead_letter_dir: PathBuf,
    pub target_block_bytes: usize,
    pub max_block_rows: usize,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            persist_ticks: true,
            persist_candles: true,
            max_rows: 50_000,
            max_bytes: 8 * 1024 * 1024,
            max_age_ms: 5_000,
            channel_capacity: 4_096,
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            flush_timeout_ms: 10_000,
            dead_letter_dir: PathBuf::from("dead-letter"),
            target_block_bytes: 1024 * 1024,
            max_block_rows: 65_536,
        }
    }
}

impl PersistConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_rows == 0 || self.max_bytes == 0 {
            return Err(ConfigError::Invalid("persist.max_rows and max_bytes must be non-zero".into()));
        }
        if self.max_age_ms == 0 || self.flush_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "persist.max_age_ms and flush_timeout_ms must be non-zero".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid("persist.channel_capacity must be non-zero".into()));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "persist.initial_backoff_ms exceeds max_backoff_ms".into(),
            ));
        }
        if self.target_block_bytes == 0 || self.max_block_rows == 0 {
            return Err(ConfigError::Invalid("persist block limits must be non-zero".into()));
        }
        Ok(())
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            target_block_bytes: self.target_block_bytes,
            max_block_rows: self.max_block_rows,
        }
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Delay before retry `attempt` (1-based), doubling up to `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Persist router is closed")]
    Closed,

    #[error("Rows for {key} do not match the schema its writer was started with")]
    SchemaMismatch { key: PartitionKey },

    #[error("Writer for {0} has stopped")]
    WriterGone(PartitionKey),

    #[error("Writer queue for {0} is full, rows were dead-lettered")]
    QueueFull(PartitionKey),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Durable destination of flushed batches.
pub trait PartitionSink: Send + Sync + 'static {
    fn write_batch(
        &self,
        key: &PartitionKey,
        schema: &Schema,
        rows: &[Row],
    ) -> Result<Vec<PartitionSummary>, StorageError>;
}

impl<B: StorageBackend + 'static> PartitionSink for PartitionStore<B> {
    fn write_batch(
        &self,
        key: &PartitionKey,
        schema: &Schema,
        rows: &[Row],
    ) -> Result<Vec<PartitionSummary>, StorageError> {
        self.write_rows(key, schema, rows.to_vec())
    }
}

/// One dead-lettered batch, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub key: PartitionKey,
    pub schema: Schema,
    pub error: String,
    pub attempts: u32,
    /// Unix nanos.
    pub failed_at: i64,
    pub rows: Vec<Row>,
}

/// Dead-letter file for `key` under `dir`. Keys that were rejected as
/// partition names still get a flat file name.
pub fn dead_letter_path(dir: &Path, key: &PartitionKey) -> PathBuf {
    dir.join(format!("{}.{}.jsonl", file_safe(&key.dataset), file_safe(&key.group)))
}

fn file_safe(part: &str) -> String {
    let cleaned: String = part
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Read back every record of a dead-letter file.
pub fn read_dead_letters(path: &Path) -> Result<Vec<DeadLetterRecord>, std::io::Error> {
    let text = std::fs::read_to_string(path)?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(std::io::Error::from))
        .collect()
}

enum WriterMsg {
    Rows(Vec<Row>),
    Flush(oneshot::Sender<()>),
}

impl WriterMsg {
    fn into_rows(self) -> Vec<Row> {
        match self {
            WriterMsg::Rows(rows) => rows,
            WriterMsg::Flush(_) => Vec::new(),
        }
    }
}

struct FlushFailure {
    message: String,
    transient: bool,
}

type WriteTask = JoinHandle<Result<Vec<PartitionSummary>, StorageError>>;

enum AttemptOutcome {
    Finished(Result<Vec<PartitionSummary>, FlushFailure>),
    /// Still running on the blocking pool.
    TimedOut(WriteTask),
}

struct PartitionWriterTask {
    key: PartitionKey,
    schema: Arc<Schema>,
    config: PersistConfig,
    sink: Arc<dyn PartitionSink>,
    metrics: Arc<EngineMetrics>,
    buffer: Vec<Row>,
    buffered_bytes: usize,
    oldest: Option<Instant>,
}

impl PartitionWriterTask {
    async fn run(mut self, mut rx: mpsc::Receiver<WriterMsg>) {
        loop {
            let deadline = self.oldest.map(|t| t + self.config.max_age());
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(WriterMsg::Rows(rows)) => {
                        self.append(rows);
                        if self.buffer.len() >= self.config.max_rows
                            || self.buffered_bytes >= self.config.max_bytes
                        {
                            self.flush().await;
                        }
                    }
                    Some(WriterMsg::Flush(ack)) => {
                        self.flush().await;
                        let _ = ack.send(());
                    }
                    None => {
                        self.flush().await;
                        break;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush().await;
                }
            }
        }
        debug!(key = %self.key, "Partition writer stopped");
    }

    fn append(&mut self, rows: Vec<Row>) {
        if rows.is_empty() {
            return;
        }
        if self.oldest.is_none() {
            self.oldest = Some(Instant::now());
        }
        self.buffered_bytes += rows.iter().map(Row::estimated_size).sum::<usize>();
        self.buffer.extend(rows);
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let rows = Arc::new(std::mem::take(&mut self.buffer));
        self.buffered_bytes = 0;
        self.oldest = None;

        let mut attempts = 0;
        let mut pending: Option<WriteTask> = None;
        let result = loop {
            attempts += 1;
            let write = pending.take().unwrap_or_else(|| self.spawn_write(rows.clone()));
            let failure = match self.attempt(write).await {
                AttemptOutcome::Finished(Ok(summaries)) => break Ok(summaries),
                AttemptOutcome::Finished(Err(failure)) => failure,
                AttemptOutcome::TimedOut(write) => {
                    self.metrics.flush_timeouts.fetch_add(1, Ordering::Relaxed);
                    pending = Some(write);
                    FlushFailure {
                        message: format!("flush timed out after {:?}", self.config.flush_timeout()),
                        transient: true,
                    }
                }
            };

            self.metrics.record(Diagnostic::StorageWriteFailure);
            warn!(
                key = %self.key,
                attempt = attempts,
                transient = failure.transient,
                error = %failure.message,
                "Partition flush failed"
            );
            if !failure.transient || attempts > self.config.max_retries {
                // A timed-out write cannot be cancelled; its outcome decides the batch.
                break match pending.take() {
                    Some(write) => settled(write.await),
                    None => Err(failure),
                };
            }
            self.metrics.flush_retries.fetch_add(1, Ordering::Relaxed);
            // Retrying a timed-out attempt keeps waiting on the same write.
            if pending.is_none() {
                sleep(self.config.backoff(attempts)).await;
            }
        };

        match result {
            Ok(summaries) => {
                self.metrics.rows_persisted.fetch_add(rows.len() as u64, Ordering::Relaxed);
                self.metrics
                    .partitions_written
                    .fetch_add(summaries.len() as u64, Ordering::Relaxed);
                debug!(key = %self.key, rows = rows.len(), parts = summaries.len(), attempts, "Flushed batch");
            }
            Err(failure) => {
                dead_letter(
                    &self.config.dead_letter_dir,
                    &self.metrics,
                    &self.key,
                    &self.schema,
                    &rows,
                    failure.message,
                    attempts,
                )
                .await;
            }
        }
    }

    fn spawn_write(&self, rows: Arc<Vec<Row>>) -> WriteTask {
        let sink = self.sink.clone();
        let key = self.key.clone();
        let schema = self.schema.clone();
        tokio::task::spawn_blocking(move || sink.write_batch(&key, &schema, &rows))
    }

    async fn attempt(&self, mut write: WriteTask) -> AttemptOutcome {
        match timeout(self.config.flush_timeout(), &mut write).await {
            Ok(joined) => AttemptOutcome::Finished(settled(joined)),
            Err(_) => AttemptOutcome::TimedOut(write),
        }
    }
}

fn settled(
    joined: Result<Result<Vec<PartitionSummary>, StorageError>, JoinError>,
) -> Result<Vec<PartitionSummary>, FlushFailure> {
    match joined {
        Ok(Ok(summaries)) => Ok(summaries),
        Ok(Err(err)) => Err(FlushFailure {
            transient: err.is_transient(),
            message: err.to_string(),
        }),
        Err(join) => Err(FlushFailure {
            message: format!("write task failed: {join}"),
            transient: true,
        }),
    }
}

/// Append `rows` to the dead-letter file of `key` and raise a critical alert.
async fn dead_letter(
    dir: &Path,
    metrics: &EngineMetrics,
    key: &PartitionKey,
    schema: &Schema,
    rows: &[Row],
    error: String,
    attempts: u32,
) {
    let record = DeadLetterRecord {
        key: key.clone(),
        schema: schema.clone(),
        error,
        attempts,
        failed_at: Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX),
        rows: rows.to_vec(),
    };
    let path = dead_letter_path(dir, key);
    let written = append_line(&path, &record).await;

    metrics.batches_dead_lettered.fetch_add(1, Ordering::Relaxed);
    let message = match &written {
        Ok(()) => format!(
            "{} rows for {} dead-lettered to {} after {} attempts: {}",
            rows.len(),
            key,
            path.display(),
            attempts,
            record.error
        ),
        Err(io) => format!(
            "{} rows for {} could not be dead-lettered to {}: {}",
            rows.len(),
            key,
            path.display(),
            io
        ),
    };
    error!(key = %key, rows = rows.len(), path = %path.display(), "{message}");
    metrics.raise(Alert {
        level: AlertLevel::Critical,
        metric: "batches_dead_lettered".to_string(),
        message,
    });
}

async fn append_line(path: &Path, record: &DeadLetterRecord) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.sync_data().await
}

struct WriterHandle {
    tx: mpsc::Sender<WriterMsg>,
    schema: Arc<Schema>,
    task: JoinHandle<()>,
}

/// Routes rows to the writer task of their partition key.
pub struct PersistRouter {
    config: PersistConfig,
    sink: Arc<dyn PartitionSink>,
    metrics: Arc<EngineMetrics>,
    writers: Mutex<HashMap<PartitionKey, WriterHandle>>,
    closed: AtomicBool,
}

impl PersistRouter {
    pub fn new(config: PersistConfig, sink: Arc<dyn PartitionSink>, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            config,
            sink,
            metrics,
            writers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn writers(&self) -> std::sync::MutexGuard<'_, HashMap<PartitionKey, WriterHandle>> {
        self.writers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand `rows` to the writer for `key`, starting it on first use. Never
    /// waits: rows that cannot be queued are dead-lettered before the error
    /// is returned.
    pub async fn submit(&self, key: &PartitionKey, schema: &Arc<Schema>, rows: Vec<Row>) -> Result<(), PersistError> {
        if !self.config.enabled || rows.is_empty() {
            return Ok(());
        }
        if self.closed.load(Ordering::Acquire) {
            self.dead_letter(key, schema, rows, "persist router is closed".to_string()).await;
            return Err(PersistError::Closed);
        }

        let tx = {
            let mut writers = self.writers();
            let handle = writers.entry(key.clone()).or_insert_with(|| self.spawn_writer(key, schema.clone()));
            if handle.schema == *schema {
                Ok(handle.tx.clone())
            } else {
                Err(PersistError::SchemaMismatch { key: key.clone() })
            }
        };
        let tx = match tx {
            Ok(tx) => tx,
            Err(err) => {
                self.dead_letter(key, schema, rows, err.to_string()).await;
                return Err(err);
            }
        };

        match tx.try_send(WriterMsg::Rows(rows)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(msg)) => {
                let err = PersistError::QueueFull(key.clone());
                self.dead_letter(key, schema, msg.into_rows(), "writer queue full".to_string()).await;
                Err(err)
            }
            Err(TrySendError::Closed(msg)) => {
                let err = PersistError::WriterGone(key.clone());
                self.dead_letter(key, schema, msg.into_rows(), err.to_string()).await;
                Err(err)
            }
        }
    }

    /// Dead-letter rows that never reached a writer.
    pub async fn dead_letter(&self, key: &PartitionKey, schema: &Schema, rows: Vec<Row>, error: String) {
        if rows.is_empty() {
            return;
        }
        dead_letter(&self.config.dead_letter_dir, &self.metrics, key, schema, &rows, error, 0).await;
    }

    fn spawn_writer(&self, key: &PartitionKey, schema: Arc<Schema>) -> WriterHandle {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let task = PartitionWriterTask {
            key: key.clone(),
            schema: schema.clone(),
            config: self.config.clone(),
            sink: self.sink.clone(),
            metrics: self.metrics.clone(),
            buffer: Vec::new(),
            buffered_bytes: 0,
            oldest: None,
        };
        info!(key = %key, "Starting partition writer");
        WriterHandle {
            tx,
            schema,
            task: tokio::spawn(task.run(rx)),
        }
    }

    pub fn writer_count(&self) -> usize {
        self.writers().len()
    }

    /// Flush every writer's buffer and wait for the flushes to finish.
    pub async fn flush_all(&self) {
        let senders: Vec<mpsc::Sender<WriterMsg>> = self.writers().values().map(|h| h.tx.clone()).collect();
        let mut acks = Vec::with_capacity(senders.len());
        for tx in senders {
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx.send(WriterMsg::Flush(ack_tx)).await.is_ok() {
                acks.push(ack_rx);
            }
        }
        for ack in acks {
            let _ = ack.await;
        }
    }

    /// Stop accepting rows, then drain and stop every writer.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let handles: Vec<(PartitionKey, WriterHandle)> = self.writers().drain().collect();
        let count = handles.len();
        for (key, handle) in handles {
            drop(handle.tx);
            if let Err(err) = handle.task.await {
                error!(key = %key, error = %err, "Partition writer panicked");
            }
        }
        info!(writers = count, "Persist router closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use storage::{Column, ColumnType, MemoryBackend, Value};

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![Column::required("v", ColumnType::Int64)]).unwrap())
    }

    fn rows(range: std::ops::Range<i64>) -> Vec<Row> {
        range.map(|i| Row::new(i, vec![Value::Int64(i)])).collect()
    }

    /// Fails the first `failures` writes, then delegates to an in-memory store.
    struct FlakySink {
        failures: u32,
        calls: AtomicU32,
        store: PartitionStore<MemoryBackend>,
    }

    impl FlakySink {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                store: PartitionStore::new(MemoryBackend::new(), WriterConfig::default()),
            }
        }
    }

    impl PartitionSink for FlakySink {
        fn write_batch(
            &self,
            key: &PartitionKey,
            schema: &Schema,
            rows: &[Row],
        ) -> Result<Vec<PartitionSummary>, StorageError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk busy")));
            }
            self.store.write_batch(key, schema, rows)
        }
    }

    fn config(dir: &Path) -> PersistConfig {
        PersistConfig {
            max_rows: 10,
            max_age_ms: 50,
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            flush_timeout_ms: 1_000,
            dead_letter_dir: dir.to_path_buf(),
            ..PersistConfig::default()
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = PersistConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(10), Duration::from_millis(5_000));
        assert_eq!(config.backoff(200), Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn test_row_threshold_flushes() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(FlakySink::new(0));
        let metrics = Arc::new(EngineMetrics::new());
        let router = PersistRouter::new(config(dir.path()), sink.clone(), metrics.clone());
        let key = PartitionKey::new("trade", "majors").unwrap();

        router.submit(&key, &schema(), rows(0..10)).await.unwrap();
        router.close().await;

        assert_eq!(metrics.rows_persisted.load(Ordering::Relaxed), 10);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        let day = storage::day_of(0);
        assert_eq!(sink.store.list_parts(&key, day).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_age_threshold_flushes() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(FlakySink::new(0));
        let metrics = Arc::new(EngineMetrics::new());
        let router = PersistRouter::new(config(dir.path()), sink.clone(), metrics.clone());
        let key = PartitionKey::new("trade", "majors").unwrap();

        router.submit(&key, &schema(), rows(0..3)).await.unwrap();
        // No row or byte threshold is reached; only the 50ms age can flush.
        for _ in 0..200 {
            if metrics.rows_persisted.load(Ordering::Relaxed) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(metrics.rows_persisted.load(Ordering::Relaxed), 3);
        router.close().await;
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(FlakySink::new(2));
        let metrics = Arc::new(EngineMetrics::new());
        let router = PersistRouter::new(config(dir.path()), sink.clone(), metrics.clone());
        let key = PartitionKey::new("trade", "majors").unwrap();

        router.submit(&key, &schema(), rows(0..4)).await.unwrap();
        router.flush_all().await;

        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.flush_retries.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.count(Diagnostic::StorageWriteFailure), 2);
        assert_eq!(metrics.rows_persisted.load(Ordering::Relaxed), 4);
        assert_eq!(metrics.batches_dead_lettered.load(Ordering::Relaxed), 0);
        router.close().await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter_the_batch() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(FlakySink::new(u32::MAX));
        let metrics = Arc::new(EngineMetrics::new());
        let router = PersistRouter::new(config(dir.path()), sink.clone(), metrics.clone());
        let key = PartitionKey::new("candles_1m", "majors").unwrap();

        router.submit(&key, &schema(), rows(0..5)).await.unwrap();
        router.close().await;

        // One attempt plus two retries.
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.batches_dead_lettered.load(Ordering::Relaxed), 1);
        let alerts = metrics.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Critical);

        let records = read_dead_letters(&dead_letter_path(dir.path(), &key)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rows, rows(0..5));
        assert_eq!(records[0].attempts, 3);
        assert!(records[0].error.contains("disk busy"));
    }

    #[tokio::test]
    async fn test_schema_mismatch_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let router = PersistRouter::new(
            config(dir.path()),
            Arc::new(FlakySink::new(0)),
            Arc::new(EngineMetrics::new()),
        );
        let key = PartitionKey::new("trade", "majors").unwrap();
        router.submit(&key, &schema(), rows(0..1)).await.unwrap();

        let other = Arc::new(Schema::new(vec![Column::required("w", ColumnType::Bool)]).unwrap());
        let err = router
            .submit(&key, &other, vec![Row::new(0, vec![Value::Bool(true)])])
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::SchemaMismatch { .. }));
        router.close().await;
        assert!(matches!(
            router.submit(&key, &schema(), rows(7..8)).await,
            Err(PersistError::Closed)
        ));

        let records = read_dead_letters(&dead_letter_path(dir.path(), &key)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].schema, *other);
        assert_eq!(records[0].rows, vec![Row::new(0, vec![Value::Bool(true)])]);
        assert_eq!(records[0].attempts, 0);
        assert_eq!(records[1].rows, rows(7..8));
    }

    /// In-memory backend whose first `put_new` sleeps before storing.
    struct SlowFirstPut {
        inner: MemoryBackend,
        delay: Duration,
        first: AtomicBool,
    }

    impl StorageBackend for SlowFirstPut {
        fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
            self.inner.put(path, bytes)
        }

        fn put_new(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
            if self.first.swap(false, Ordering::SeqCst) {
                std::thread::sleep(self.delay);
            }
            self.inner.put_new(path, bytes)
        }

        fn size(&self, path: &str) -> Result<u64, StorageError> {
            self.inner.size(path)
        }

        fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>, StorageError> {
            self.inner.read_range(path, offset, len)
        }

        fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
            self.inner.list(prefix)
        }

        fn exists(&self, path: &str) -> Result<bool, StorageError> {
            self.inner.exists(path)
        }
    }

    #[tokio::test]
    async fn test_timed_out_write_that_lands_is_not_dead_lettered() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = SlowFirstPut {
            inner: MemoryBackend::new(),
            delay: Duration::from_millis(400),
            first: AtomicBool::new(true),
        };
        let store = Arc::new(PartitionStore::new(backend, WriterConfig::default()));
        let metrics = Arc::new(EngineMetrics::new());
        let config = PersistConfig {
            max_rows: 1,
            max_retries: 0,
            flush_timeout_ms: 50,
            ..config(dir.path())
        };
        let router = PersistRouter::new(config, store.clone(), metrics.clone());
        let key = PartitionKey::new("trade", "majors").unwrap();

        router.submit(&key, &schema(), vec![Row::new(111, vec![Value::Int64(111)])]).await.unwrap();
        router.submit(&key, &schema(), vec![Row::new(222, vec![Value::Int64(222)])]).await.unwrap();
        router.close().await;

        assert!(metrics.flush_timeouts.load(Ordering::Relaxed) >= 1);
        assert!(metrics.count(Diagnostic::StorageWriteFailure) >= 1);
        assert_eq!(metrics.batches_dead_lettered.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.rows_persisted.load(Ordering::Relaxed), 2);
        assert!(!dead_letter_path(dir.path(), &key).exists());

        let day = storage::day_of(0);
        assert_eq!(store.list_parts(&key, day).unwrap().len(), 2);
        let scan = store.scan_day(&key, day, storage::ReadPolicy::FailFast).unwrap();
        assert_eq!(scan.rows.iter().map(|r| r.ts).collect::<Vec<_>>(), vec![111, 222]);
    }

    /// Sleeps, then rejects the write as permanent.
    struct SlowFailingSink {
        calls: AtomicU32,
    }

    impl PartitionSink for SlowFailingSink {
        fn write_batch(&self, _: &PartitionKey, _: &Schema, _: &[Row]) -> Result<Vec<PartitionSummary>, StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            Err(StorageError::Schema("rejected".into()))
        }
    }

    #[tokio::test]
    async fn test_timed_out_write_is_retried_by_waiting_not_rewriting() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(SlowFailingSink { calls: AtomicU32::new(0) });
        let metrics = Arc::new(EngineMetrics::new());
        let config = PersistConfig {
            max_retries: 1,
            flush_timeout_ms: 50,
            ..config(dir.path())
        };
        let router = PersistRouter::new(config, sink.clone(), metrics.clone());
        let key = PartitionKey::new("trade", "majors").unwrap();

        router.submit(&key, &schema(), rows(0..3)).await.unwrap();
        router.close().await;

        // Two timed-out attempts, one write, one dead letter carrying the write's own error.
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.flush_timeouts.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.flush_retries.load(Ordering::Relaxed), 1);
        let records = read_dead_letters(&dead_letter_path(dir.path(), &key)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attempts, 2);
        assert_eq!(records[0].rows, rows(0..3));
        assert!(records[0].error.contains("rejected"));
    }

    /// Blocks every write until `open` is set.
    struct GatedSink {
        open: AtomicBool,
        calls: AtomicU32,
        store: PartitionStore<MemoryBackend>,
    }

    impl PartitionSink for GatedSink {
        fn write_batch(
            &self,
            key: &PartitionKey,
            schema: &Schema,
            rows: &[Row],
        ) -> Result<Vec<PartitionSummary>, StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            while !self.open.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            self.store.write_batch(key, schema, rows)
        }
    }

    #[tokio::test]
    async fn test_full_writer_queue_dead_letters_without_waiting() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(GatedSink {
            open: AtomicBool::new(false),
            calls: AtomicU32::new(0),
            store: PartitionStore::new(MemoryBackend::new(), WriterConfig::default()),
        });
        let metrics = Arc::new(EngineMetrics::new());
        let config = PersistConfig {
            max_rows: 1,
            channel_capacity: 1,
            ..config(dir.path())
        };
        let router = PersistRouter::new(config, sink.clone(), metrics.clone());
        let key = PartitionKey::new("trade", "majors").unwrap();

        // The writer takes the first batch and stalls on it.
        router.submit(&key, &schema(), rows(0..1)).await.unwrap();
        for _ in 0..500 {
            if sink.calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);

        // One batch fits the channel, the next one overflows.
        router.submit(&key, &schema(), rows(1..2)).await.unwrap();
        let overflow = tokio::time::timeout(Duration::from_secs(1), router.submit(&key, &schema(), rows(2..3)))
            .await
            .expect("submit must not wait for the writer");
        assert!(matches!(overflow, Err(PersistError::QueueFull(_))));

        sink.open.store(true, Ordering::SeqCst);
        router.close().await;

        assert_eq!(metrics.rows_persisted.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.batches_dead_lettered.load(Ordering::Relaxed), 1);
        let records = read_dead_letters(&dead_letter_path(dir.path(), &key)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rows, rows(2..3));
        assert_eq!(records[0].error, "writer queue full");
    }

    #[test]
    fn test_dead_letter_path_is_flat() {
        let dir = Path::new("/dl");
        let key = PartitionKey {
            dataset: "trade".to_string(),
            group: "../my group\\x".to_string(),
        };
        assert_eq!(dead_letter_path(dir, &key), Path::new("/dl/trade.___my_group_x.jsonl"));
        let key = PartitionKey::new("candles_1m", "majors").unwrap();
        assert_eq!(dead_letter_path(dir, &key), Path::new("/dl/candles_1m.majors.jsonl"));
    }
}
