//! End-to-end pipeline tests
//!
//! Ticks go in through `EngineHandle::ingest`; candles come out of a
//! subscription and out of the partition store after shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use aggregator::backfill::Backfill;
use aggregator::clock::ManualClock;
use aggregator::config::EngineConfig;
use aggregator::context::EngineContext;
use aggregator::features::default_indicators;
use aggregator::pipeline::{Engine, EngineHandle};
use aggregator::registry::{InstrumentRegistry, InstrumentSpec, RegistryHandle};
use aggregator::rows::row_to_candle;
use aggregator::sink::persist::{dead_letter_path, read_dead_letters, PartitionSink};
use aggregator::sink::serve::Subscription;
use aggregator::sink::CandleUpdate;
use feed_types::candle::Candle;
use feed_types::errors::Diagnostic;
use feed_types::ids::{InstrumentId, TickId};
use feed_types::numeric::{Price, Quantity};
use feed_types::tick::{DataKind, Side, Tick};
use feed_types::timeframe::{utc_day, Timeframe, NANOS_PER_SECOND};
use storage::{
    day_of, CountingBackend, MemoryBackend, PartitionKey, PartitionStore, PartitionSummary, ReadPolicy, Row,
    Schema, StorageError, WriterConfig,
};
use tempfile::TempDir;

// 2024-01-01T12:00:00Z
const T0: i64 = 1_704_110_400 * NANOS_PER_SECOND;

fn at(secs: i64) -> i64 {
    T0 + secs * NANOS_PER_SECOND
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn btc() -> InstrumentId {
    InstrumentId::new("BTC-PERP")
}

fn trade(t: i64, price: u64, size: u64) -> Tick {
    Tick::trade(btc(), t, Price::from_u64(price), Quantity::from_u64(size), Side::Buy).with_id(TickId::new())
}

fn spec() -> InstrumentSpec {
    InstrumentSpec::new(
        btc(),
        "majors",
        vec![Timeframe::S15, Timeframe::M1],
        vec![DataKind::Trade, DataKind::Liquidation],
    )
}

fn config(dead_letters: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.workers.shards = 2;
    config.workers.timer_interval_ms = 10;
    config.persist.max_age_ms = 20;
    config.persist.initial_backoff_ms = 1;
    config.persist.max_backoff_ms = 2;
    config.persist.max_retries = 1;
    config.persist.dead_letter_dir = dead_letters.to_path_buf();
    config
}

fn start(sink: Arc<dyn PartitionSink>, clock: Arc<ManualClock>, dead_letters: &Path) -> EngineHandle {
    let registry = RegistryHandle::fixed(InstrumentRegistry::from_specs(vec![spec()]).unwrap());
    let context = EngineContext::new(config(dead_letters), registry, sink, clock).unwrap();
    Engine::start(context).unwrap()
}

async fn next(sub: &Subscription) -> Arc<CandleUpdate> {
    tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("candle within 5s")
        .expect("subscription open")
}

fn same_bar(a: &Candle, b: &Candle) -> bool {
    a.window_start == b.window_start
        && a.window_end == b.window_end
        && a.open == b.open
        && a.high == b.high
        && a.low == b.low
        && a.close == b.close
        && a.volume == b.volume
        && a.trade_count == b.trade_count
        && a.vwap_numerator == b.vwap_numerator
        && a.is_empty == b.is_empty
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_live_candles_served_and_persisted() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = Arc::new(PartitionStore::new(MemoryBackend::new(), WriterConfig::default()));
    let clock = Arc::new(ManualClock::new(at(1)));
    let engine = start(store.clone(), clock.clone(), dir.path());
    let sub = engine.subscribe(btc(), Timeframe::S15);

    let first = trade(at(2), 100, 1);
    engine.ingest(first.clone()).await.unwrap();
    engine.ingest(first).await.unwrap();
    engine
        .ingest(Tick::trade(InstrumentId::new("DOGE-PERP"), at(3), Price::from_u64(1), Quantity::from_u64(1), Side::Sell))
        .await
        .unwrap();
    engine.ingest(trade(at(9), 105, 2)).await.unwrap();
    engine.ingest(trade(at(14), 98, 1)).await.unwrap();
    // The next window's first trade closes the first one.
    engine.ingest(trade(at(16), 101, 3)).await.unwrap();

    let update = next(&sub).await;
    let candle = &update.candle;
    assert_eq!((candle.window_start, candle.window_end), (at(0), at(15)));
    assert_eq!(candle.open, Some(Price::from_u64(100)));
    assert_eq!(candle.high, Some(Price::from_u64(105)));
    assert_eq!(candle.low, Some(Price::from_u64(98)));
    assert_eq!(candle.close, Some(Price::from_u64(98)));
    assert_eq!(candle.volume, Quantity::from_u64(4));
    assert_eq!(candle.trade_count, 3);
    assert_eq!(update.features.window_start, candle.window_start);

    // Silence: the wall-clock timer closes the next window.
    clock.set(at(31));
    let update = next(&sub).await;
    assert_eq!(update.candle.window_start, at(15));
    assert_eq!(update.candle.trade_count, 1);

    clock.set(at(45));
    let update = next(&sub).await;
    assert!(update.candle.is_empty);
    assert_eq!(update.candle.open, None);

    let metrics = engine.metrics().clone();
    engine.shutdown().await.unwrap();

    assert_eq!(metrics.count(Diagnostic::DuplicateTick), 1);
    assert_eq!(metrics.count(Diagnostic::Unroutable), 1);
    assert_eq!(metrics.batches_dead_lettered.load(std::sync::atomic::Ordering::Relaxed), 0);

    let trades = store
        .scan_day(&PartitionKey::new("trade", "majors").unwrap(), day_of(T0), ReadPolicy::FailFast)
        .unwrap();
    assert_eq!(trades.rows.len(), 4);

    let candles = store
        .scan_day(&PartitionKey::new("candles_15s", "majors").unwrap(), day_of(T0), ReadPolicy::FailFast)
        .unwrap();
    assert!(candles.rows.len() >= 3);
    let (stored, features) = row_to_candle(&candles.rows[0]).unwrap();
    assert_eq!(stored.close, Some(Price::from_u64(98)));
    assert_eq!(features.len(), default_indicators().len());

    let minute = store
        .scan_day(&PartitionKey::new("candles_1m", "majors").unwrap(), day_of(T0), ReadPolicy::FailFast)
        .unwrap();
    assert_eq!(minute.rows.len(), 1);
    let (partial, _) = row_to_candle(&minute.rows[0]).unwrap();
    assert_eq!(partial.volume, Quantity::from_u64(7));
    assert_eq!(partial.open, Some(Price::from_u64(100)));
    assert_eq!(partial.close, Some(Price::from_u64(101)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backfill_matches_live() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = Arc::new(PartitionStore::new(MemoryBackend::new(), WriterConfig::default()));
    let clock = Arc::new(ManualClock::new(at(0)));
    let engine = start(store.clone(), clock.clone(), dir.path());
    let sub = engine.subscribe(btc(), Timeframe::S15);

    let prices = [100u64, 103, 99, 101, 108, 104, 97, 102, 100, 106];
    for (i, price) in prices.iter().enumerate() {
        let t = at(i as i64 * 7 + 1);
        engine.ingest(trade(t, *price, i as u64 + 1)).await.unwrap();
    }

    // The trade at 64s closes [45s, 60s); once that candle is out every
    // trade has been folded and the clock can move.
    let mut live = Vec::new();
    while live.last().map_or(true, |c: &Candle| c.window_start < at(45)) {
        live.push(next(&sub).await.candle.clone());
    }
    clock.set(at(90));
    while live.len() < 6 {
        live.push(next(&sub).await.candle.clone());
    }
    engine.shutdown().await.unwrap();

    let backfill = Backfill::new(store.as_ref(), EngineConfig::default().candles);
    let day = utc_day(T0);
    let replayed: Vec<Candle> = backfill
        .reprocess(&spec(), day..=day)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
        .into_iter()
        .filter(|c| c.timeframe == Timeframe::S15)
        .collect();

    for candle in &live {
        let twin = replayed
            .iter()
            .find(|c| c.window_start == candle.window_start)
            .expect("window replayed");
        assert!(same_bar(candle, twin), "{candle:?} != {twin:?}");
    }
}

/// Rejects every write.
struct BrokenSink;

impl PartitionSink for BrokenSink {
    fn write_batch(&self, _: &PartitionKey, _: &Schema, _: &[Row]) -> Result<Vec<PartitionSummary>, StorageError> {
        Err(StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "volume offline")))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_storage_failure_is_contained() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(at(1)));
    let engine = start(Arc::new(BrokenSink), clock.clone(), dir.path());
    let sub = engine.subscribe(btc(), Timeframe::S15);

    engine.ingest(trade(at(2), 100, 1)).await.unwrap();
    engine.ingest(trade(at(20), 101, 1)).await.unwrap();

    // Serving continues while every flush fails.
    let update = next(&sub).await;
    assert_eq!(update.candle.close, Some(Price::from_u64(100)));

    // The failed flushes cross the storage threshold before shutdown.
    let metrics = engine.metrics().clone();
    let mut alerted = false;
    for _ in 0..500 {
        if metrics.alerts().iter().any(|a| a.metric == "storage_write_failure") {
            alerted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(alerted, "storage alert raised while running");

    engine.shutdown().await.unwrap();

    assert!(metrics.batches_dead_lettered.load(std::sync::atomic::Ordering::Relaxed) >= 2);
    assert!(metrics.count(Diagnostic::StorageWriteFailure) >= 4);
    assert!(metrics.alerts().iter().any(|a| a.metric == "batches_dead_lettered"));

    let key = PartitionKey::new("trade", "majors").unwrap();
    let records = read_dead_letters(&dead_letter_path(dir.path(), &key)).unwrap();
    let rows: usize = records.iter().map(|r| r.rows.len()).sum();
    assert_eq!(rows, 2);
    assert!(records.iter().all(|r| r.error.contains("volume offline")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_load_candles_reads_only_overlapping_blocks() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = Arc::new(PartitionStore::new(
        CountingBackend::new(MemoryBackend::new()),
        WriterConfig {
            target_block_bytes: 1 << 20,
            max_block_rows: 4,
        },
    ));
    let mut config = config(dir.path());
    // A single flush at shutdown puts every candle in one part.
    config.persist.max_age_ms = 60_000;
    let registry = RegistryHandle::fixed(InstrumentRegistry::from_specs(vec![spec()]).unwrap());
    let clock = Arc::new(ManualClock::new(at(0)));
    let context = EngineContext::new(config, registry, store.clone(), clock).unwrap();
    let engine = Engine::start(context).unwrap();
    let sub = engine.subscribe(btc(), Timeframe::S15);

    for i in 0..16 {
        engine.ingest(trade(at(15 * i + 1), 100 + i as u64, 1)).await.unwrap();
    }
    while next(&sub).await.candle.window_start < at(210) {}
    engine.shutdown().await.unwrap();

    // 15 closed windows in blocks of 4; [60s, 120s) is exactly the second block.
    let key = PartitionKey::new("candles_15s", "majors").unwrap();
    store.backend().reset();
    let full = store.scan_day(&key, day_of(T0), ReadPolicy::FailFast).unwrap();
    assert_eq!(full.rows.len(), 15);
    assert_eq!(full.blocks_read, 4);
    let full_reads = store.backend().read_calls();

    store.backend().reset();
    let backfill = Backfill::new(store.as_ref(), EngineConfig::default().candles);
    let loaded = backfill.load_candles("majors", Timeframe::S15, at(60), at(120)).unwrap();
    let sparse_reads = store.backend().read_calls();

    let starts: Vec<i64> = loaded.iter().map(|(c, _)| c.window_start).collect();
    assert_eq!(starts, vec![at(60), at(75), at(90), at(105)]);
    let closes: Vec<_> = loaded.iter().map(|(c, _)| c.close).collect();
    assert_eq!(closes, (104..=107).map(|p| Some(Price::from_u64(p))).collect::<Vec<_>>());
    assert!(loaded.iter().all(|(_, f)| f.len() == default_indicators().len()));
    assert!(sparse_reads < full_reads, "{sparse_reads} >= {full_reads}");
}

#[test]
fn test_load_candles_of_unknown_group_is_empty() {
    let store = PartitionStore::new(MemoryBackend::new(), WriterConfig::default());
    let backfill = Backfill::new(&store, EngineConfig::default().candles);
    assert!(backfill.load_candles("majors", Timeframe::M1, at(0), at(60)).unwrap().is_empty());
    assert!(backfill.load_candles("bad group", Timeframe::M1, at(0), at(60)).is_err());
}
