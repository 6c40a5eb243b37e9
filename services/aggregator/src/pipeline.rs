//! Live pipeline
//!
//! ```text
//!  transport ──ingest──► ingress task ──hash(instrument)──► shard worker × N
//!                        (TickRouter,                       (ladders, feature
//!                         registry lookup)                   calculators, timer)
//!                                                                  │
//!                                                             SinkRouter
//!                                                           serve │ persist
//! ```
//!
//! Every instrument is owned by exactly one shard worker, so its candle
//! builders and feature histories are never shared and need no locks.
//! Shards run in parallel; each has a wall-clock timer that closes windows
//! through periods of silence.
//!
//! The ingress task checks the alert thresholds on the same timer period and
//! logs each alert as it starts firing.
//!
//! Shutdown drains the ingress channel, lets every shard drain its own
//! channel, force-closes every open window, then flushes every partition
//! writer.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use feed_types::candle::Candle;
use feed_types::errors::Diagnostic;
use feed_types::ids::InstrumentId;
use feed_types::tick::Tick;
use feed_types::timeframe::Timeframe;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::candles::{LadderOutput, TimeframeLadder};
use crate::config::ConfigError;
use crate::context::EngineContext;
use crate::features::FeatureCalculator;
use crate::metrics::{AlertLevel, EngineMetrics};
use crate::registry::InstrumentSpec;
use crate::router::{RoutingOutcome, TickRouter};
use crate::sink::serve::Subscription;
use crate::sink::CandleUpdate;

/// Raw ticks buffered per group before they are handed to the persist path.
const TICK_BATCH: usize = 512;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Engine is shut down")]
    Closed,

    #[error("Ingress queue is full")]
    IngressFull,

    #[error("Worker task failed: {0}")]
    WorkerFailed(String),
}

/// Stable shard index of `instrument_id`.
pub fn shard_for(instrument_id: &InstrumentId, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    instrument_id.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

pub struct Engine;

impl Engine {
    /// Build the router and spawn the ingress task and shard workers.
    pub fn start(context: EngineContext) -> Result<EngineHandle, EngineError> {
        let context = Arc::new(context);
        let router = TickRouter::from_config(context.config.router.clone())?;
        let workers = &context.config.workers;

        let mut shard_txs = Vec::with_capacity(workers.shards);
        let mut shard_tasks = Vec::with_capacity(workers.shards);
        for index in 0..workers.shards {
            let (tx, rx) = mpsc::channel(workers.shard_capacity);
            let worker = ShardWorker::new(index, context.clone());
            shard_txs.push(tx);
            shard_tasks.push(tokio::spawn(worker.run(rx)));
        }

        let (ingress_tx, ingress_rx) = mpsc::channel(workers.ingress_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let ingress = IngressTask {
            context: context.clone(),
            router,
            shards: shard_txs,
        };
        let ingress_task = tokio::spawn(ingress.run(ingress_rx, shutdown_rx));

        info!(
            shards = workers.shards,
            timer_ms = workers.timer_interval_ms,
            instruments = context.registry.snapshot().len(),
            "Engine started"
        );

        Ok(EngineHandle {
            context,
            ingress: ingress_tx,
            shutdown: shutdown_tx,
            ingress_task,
            shard_tasks,
        })
    }
}

/// Owner-side handle of a running engine.
pub struct EngineHandle {
    context: Arc<EngineContext>,
    ingress: mpsc::Sender<Tick>,
    shutdown: oneshot::Sender<()>,
    ingress_task: JoinHandle<()>,
    shard_tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Queue one tick, waiting while the ingress channel is full.
    pub async fn ingest(&self, tick: Tick) -> Result<(), EngineError> {
        self.ingress.send(tick).await.map_err(|_| EngineError::Closed)
    }

    /// Queue one tick without waiting.
    pub fn try_ingest(&self, tick: Tick) -> Result<(), EngineError> {
        self.ingress.try_send(tick).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => EngineError::IngressFull,
            mpsc::error::TrySendError::Closed(_) => EngineError::Closed,
        })
    }

    /// Extra sender for transports that run on their own tasks.
    pub fn sender(&self) -> mpsc::Sender<Tick> {
        self.ingress.clone()
    }

    pub fn subscribe(&self, instrument_id: InstrumentId, timeframe: Timeframe) -> Subscription {
        self.context.serve().subscribe(instrument_id, timeframe)
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.context.metrics
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    /// Graceful drain. Ticks already queued are processed, open windows are
    /// force-closed and every buffered row is flushed before this returns.
    pub async fn shutdown(self) -> Result<(), EngineError> {
        info!("Engine shutting down");
        let _ = self.shutdown.send(());
        drop(self.ingress);

        let mut failure = None;
        if let Err(err) = self.ingress_task.await {
            error!(error = %err, "Ingress task failed");
            failure = Some(EngineError::WorkerFailed(err.to_string()));
        }
        for (index, task) in self.shard_tasks.into_iter().enumerate() {
            if let Err(err) = task.await {
                error!(shard = index, error = %err, "Shard worker failed");
                failure.get_or_insert(EngineError::WorkerFailed(err.to_string()));
            }
        }

        self.context.sinks.close().await;
        report_alerts(&self.context);
        info!(
            candles = self.context.metrics.candles_emitted.load(Ordering::Relaxed),
            rows = self.context.metrics.rows_persisted.load(Ordering::Relaxed),
            "Engine stopped"
        );
        failure.map_or(Ok(()), Err)
    }
}

// ── Ingress ─────────────────────────────────────────────────────────

struct ShardMsg {
    tick: Tick,
    spec: Arc<InstrumentSpec>,
}

struct IngressTask {
    context: Arc<EngineContext>,
    router: TickRouter,
    shards: Vec<mpsc::Sender<ShardMsg>>,
}

impl IngressTask {
    async fn run(mut self, mut rx: mpsc::Receiver<Tick>, mut shutdown: oneshot::Receiver<()>) {
        let mut alert_timer = interval(self.context.config.workers.timer_interval());
        alert_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = alert_timer.tick() => report_alerts(&self.context),
                tick = rx.recv() => match tick {
                    Some(tick) => self.dispatch(tick).await,
                    None => break,
                },
                _ = &mut shutdown => {
                    // Stop accepting, then finish what is already queued.
                    rx.close();
                    while let Some(tick) = rx.recv().await {
                        self.dispatch(tick).await;
                    }
                    break;
                }
            }
        }
        let stats = self.router.stats();
        info!(
            dispatched = stats.dispatched,
            derived = stats.derived,
            duplicates = stats.duplicates,
            unhandled = stats.unhandled,
            "Ingress stopped"
        );
    }

    async fn dispatch(&mut self, tick: Tick) {
        let metrics = &self.context.metrics;
        metrics.ticks_received.fetch_add(1, Ordering::Relaxed);

        let ticks = match self.router.route(tick) {
            RoutingOutcome::Duplicate => {
                metrics.record(Diagnostic::DuplicateTick);
                return;
            }
            RoutingOutcome::Unhandled => {
                metrics.record(Diagnostic::Unroutable);
                return;
            }
            RoutingOutcome::Dispatched { native, derived } => {
                if native.is_some() {
                    metrics.ticks_routed.fetch_add(1, Ordering::Relaxed);
                }
                metrics.ticks_derived.fetch_add(derived.len() as u64, Ordering::Relaxed);
                native.into_iter().chain(derived)
            }
        };

        for tick in ticks {
            let Some(spec) = self.context.registry.lookup(&tick.instrument_id) else {
                metrics.record(Diagnostic::Unroutable);
                debug!(instrument = %tick.instrument_id, "Tick for unknown instrument dropped");
                continue;
            };
            if !spec.wants(tick.kind()) {
                metrics.record(Diagnostic::Unroutable);
                debug!(instrument = %tick.instrument_id, kind = %tick.kind(), "Kind not enabled for instrument");
                continue;
            }
            let shard = shard_for(&tick.instrument_id, self.shards.len());
            if self.shards[shard].send(ShardMsg { tick, spec }).await.is_err() {
                error!(shard, "Shard worker gone, tick dropped");
            }
        }
    }
}

/// Log every threshold alert that started firing since the last check.
fn report_alerts(context: &EngineContext) {
    for alert in context.metrics.check_thresholds(&context.config.alerts) {
        match alert.level {
            AlertLevel::Warning => warn!(metric = %alert.metric, "{}", alert.message),
            AlertLevel::Critical => error!(metric = %alert.metric, "{}", alert.message),
        }
    }
}

// ── Shard workers ───────────────────────────────────────────────────

struct InstrumentState {
    spec: Arc<InstrumentSpec>,
    ladder: TimeframeLadder,
    calculators: BTreeMap<Timeframe, FeatureCalculator>,
}

impl InstrumentState {
    fn new(spec: Arc<InstrumentSpec>, context: &EngineContext) -> Result<Self, ConfigError> {
        let ladder = TimeframeLadder::new(spec.instrument_id.clone(), &spec.timeframes, &context.config.candles)?;
        let calculators = ladder
            .timeframes()
            .map(|tf| {
                let calc = FeatureCalculator::new(context.features.clone()).with_metrics(context.metrics.clone());
                (tf, calc)
            })
            .collect();
        Ok(Self { spec, ladder, calculators })
    }
}

struct ShardWorker {
    index: usize,
    context: Arc<EngineContext>,
    instruments: BTreeMap<InstrumentId, InstrumentState>,
    pending_ticks: BTreeMap<String, Vec<Tick>>,
}

impl ShardWorker {
    fn new(index: usize, context: Arc<EngineContext>) -> Self {
        Self {
            index,
            context,
            instruments: BTreeMap::new(),
            pending_ticks: BTreeMap::new(),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ShardMsg>) {
        let mut timer = interval(self.context.config.workers.timer_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.on_tick(msg).await,
                    None => break,
                },
                _ = timer.tick() => self.on_timer().await,
            }
        }
        self.drain().await;
    }

    async fn on_tick(&mut self, msg: ShardMsg) {
        let ShardMsg { tick, spec } = msg;
        let now = self.context.clock.now_nanos();
        let id = spec.instrument_id.clone();

        let stale = self.instruments.get(&id).is_some_and(|s| s.spec.timeframes != spec.timeframes);
        if stale {
            if let Some(mut old) = self.instruments.remove(&id) {
                info!(instrument = %id, shard = self.index, "Timeframes changed, rebuilding ladder");
                let out = old.ladder.force_close(now);
                emit(&self.context, &mut old, out).await;
            }
        }
        if !self.instruments.contains_key(&id) {
            match InstrumentState::new(spec.clone(), &self.context) {
                Ok(state) => {
                    debug!(instrument = %id, shard = self.index, "Instrument assigned");
                    self.instruments.insert(id.clone(), state);
                }
                Err(err) => {
                    self.context.metrics.record(Diagnostic::Unroutable);
                    warn!(instrument = %id, error = %err, "Instrument cannot be aggregated");
                    return;
                }
            }
        }

        let persist = &self.context.config.persist;
        if persist.enabled && persist.persist_ticks {
            let batch = self.pending_ticks.entry(spec.group.clone()).or_default();
            batch.push(tick.clone());
            if batch.len() >= TICK_BATCH {
                self.flush_ticks().await;
            }
        }

        let Some(state) = self.instruments.get_mut(&id) else {
            return;
        };
        let started = Instant::now();
        let out = state.ladder.on_tick(&tick, now);
        self.context.metrics.record_fold(started.elapsed().as_nanos() as u64);
        emit(&self.context, state, out).await;
    }

    async fn on_timer(&mut self) {
        let now = self.context.clock.now_nanos();
        for state in self.instruments.values_mut() {
            let out = state.ladder.on_timer(now);
            emit(&self.context, state, out).await;
        }
        self.flush_ticks().await;
    }

    async fn drain(&mut self) {
        let now = self.context.clock.now_nanos();
        for state in self.instruments.values_mut() {
            let out = state.ladder.force_close(now);
            emit(&self.context, state, out).await;
        }
        self.flush_ticks().await;
        info!(shard = self.index, instruments = self.instruments.len(), "Shard drained");
    }

    async fn flush_ticks(&mut self) {
        for (group, ticks) in std::mem::take(&mut self.pending_ticks) {
            if let Err(err) = self.context.sinks.dispatch_ticks(&group, &ticks).await {
                warn!(group = %group, ticks = ticks.len(), error = %err, "Raw ticks not persisted");
            }
        }
    }
}

/// Count late inputs, then compute features for and dispatch every closed candle.
async fn emit(context: &EngineContext, state: &mut InstrumentState, out: LadderOutput) {
    for late in &out.late {
        context.metrics.record(Diagnostic::LateTickDropped);
        debug!(
            instrument = %late.instrument_id,
            timeframe = %late.timeframe,
            event_time = late.event_time,
            window_start = late.window_start,
            "Late input dropped"
        );
    }
    for candle in out.candles {
        dispatch(context, state, candle).await;
    }
}

async fn dispatch(context: &EngineContext, state: &mut InstrumentState, candle: Candle) {
    context.metrics.record_candle(candle.is_empty);
    let Some(calc) = state.calculators.get_mut(&candle.timeframe) else {
        return;
    };
    let features = calc.compute_incremental(candle.clone());
    let timeframe = candle.timeframe;
    if let Err(err) = context
        .sinks
        .dispatch_candle(&state.spec.group, CandleUpdate { candle, features })
        .await
    {
        warn!(
            instrument = %state.spec.instrument_id,
            timeframe = %timeframe,
            error = %err,
            "Candle not persisted"
        );
    }
}
