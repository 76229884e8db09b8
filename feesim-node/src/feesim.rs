//! The steady-state scheduler tying the collector, estimators, transient
//! sim, and predictor together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use collect::{BlockGetter, BlockInfo, Collector, CollectorChannels, MempoolState, MempoolStateGetter};
use estimate::{EstimateError, UniTxSourceEstimator};
use predict::Predictor;
use sim::util::search_i64;
use sim::{
    BlockSource, FeeRate, MonotonicFn, Sim, TransientSim, TxSource,
};
use storage::{BlockStatStore, Database, PredictStore, TxStore};

use crate::config::Config;
use crate::metrics::SimTimers;

/// Why a fee estimate is not currently available.
#[derive(Debug, Clone, Error)]
pub enum FeeSimError {
    #[error("sim is in progress")]
    InProgress,
    #[error("sim is paused")]
    Paused,
    #[error("sim is shutting down")]
    Shutdown,
    #[error("mempool state not available")]
    MempoolNotAvailable,
    #[error("{0}")]
    Source(String),
}

impl From<&EstimateError> for FeeSimError {
    fn from(e: &EstimateError) -> Self {
        FeeSimError::Source(e.to_string())
    }
}

/// The four shared fields, guarded by one reader-writer lock.
struct Shared {
    result: Result<Vec<FeeRate>, FeeSimError>,
    tx_source: Result<Arc<dyn TxSource>, FeeSimError>,
    block_source: Result<Arc<dyn BlockSource>, FeeSimError>,
    done: bool,
}

/// The tx-source estimator actually wired in, per config.
pub enum TxEstimator {
    Uniform(UniTxSourceEstimator),
    Weighted {
        cfg: estimate::MultiTxSourceConfig,
        db: Arc<dyn estimate::TxDb>,
        rng: StdRng,
    },
}

impl TxEstimator {
    fn estimate(&mut self, t: i64) -> Result<Arc<dyn TxSource>, EstimateError> {
        match self {
            TxEstimator::Uniform(est) => Ok(Arc::new(est.estimate(t)?)),
            TxEstimator::Weighted { cfg, db, rng } => Ok(Arc::new(
                estimate::weighted_tx_source(t, cfg, db.as_ref(), rng.gen())?,
            )),
        }
    }
}

pub struct FeeSim {
    shared: RwLock<Shared>,
    collector: Mutex<Option<Collector>>,
    pause_tx: mpsc::Sender<bool>,
    pause_rx: Mutex<Option<mpsc::Receiver<bool>>>,
    done_tx: watch::Sender<bool>,
    predict_drops: AtomicU64,
    pub timers: Arc<SimTimers>,

    db: Arc<Database>,
    tx_store: Arc<TxStore>,
    stat_store: Arc<BlockStatStore>,
    predict_store: Arc<PredictStore>,
    state_getter: Arc<dyn MempoolStateGetter>,
    block_getter: Arc<dyn BlockGetter>,
    tx_estimator: Mutex<Option<TxEstimator>>,
    cfg: Config,
}

impl FeeSim {
    pub fn new(
        db: Arc<Database>,
        state_getter: Arc<dyn MempoolStateGetter>,
        block_getter: Arc<dyn BlockGetter>,
        tx_estimator: TxEstimator,
        cfg: Config,
    ) -> Result<FeeSim> {
        let tx_store = Arc::new(db.tx_store()?);
        let stat_store = Arc::new(db.block_stat_store()?);
        let predict_store = Arc::new(db.predict_store()?);
        let (pause_tx, pause_rx) = mpsc::channel(1);
        let (done_tx, _) = watch::channel(false);

        Ok(FeeSim {
            shared: RwLock::new(Shared {
                result: Err(FeeSimError::InProgress),
                tx_source: Err(FeeSimError::InProgress),
                block_source: Err(FeeSimError::InProgress),
                done: false,
            }),
            collector: Mutex::new(None),
            pause_tx,
            pause_rx: Mutex::new(Some(pause_rx)),
            done_tx,
            predict_drops: AtomicU64::new(0),
            timers: Arc::new(SimTimers::new()),
            db,
            tx_store,
            stat_store,
            predict_store,
            state_getter,
            block_getter,
            tx_estimator: Mutex::new(Some(tx_estimator)),
            cfg,
        })
    }

    /// Run until shutdown. Owns the collector, the sim tick loop, and the
    /// four hand-off workers.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!("feesim starting up");
        let state = self
            .state_getter
            .get_state()
            .await
            .context("initial mempool state")?;
        let time_now = state.time;
        let height_now = state.height;

        self.normalize_tx_store(time_now)
            .context("tx store normalization")?;

        let predictor = Predictor::new(
            Arc::clone(&self.predict_store) as Arc<dyn predict::PredictDb>,
            self.cfg.predict,
        )?;
        predictor.cleanup(&state)?;

        let (collector, channels) = Collector::start(
            Arc::clone(&self.state_getter),
            Arc::clone(&self.block_getter),
            Arc::clone(&self.tx_store) as Arc<dyn collect::TxSink>,
            Arc::clone(&self.stat_store) as Arc<dyn collect::BlockStatSink>,
            self.cfg.collect,
        )
        .await?;
        *self.collector.lock() = Some(collector);

        // Initial source estimates.
        let mut tx_estimator = self.tx_estimator.lock().take().expect("run called twice");
        self.set_tx_source(tx_estimator.estimate(time_now));
        self.set_block_source(estimate::block_source(
            height_now,
            &self.cfg.indblock,
            self.stat_store.as_ref(),
            rand::random(),
        ));

        let sim_loop = tokio::spawn(Arc::clone(&self).sim_loop());

        let (state_fan_tx, state_fan_rx) = mpsc::channel::<MempoolState>(10);
        let (block_fan_tx, block_fan_rx) = mpsc::channel::<Vec<BlockInfo>>(10);
        let predict_worker = tokio::spawn(
            Arc::clone(&self).predict_worker(predictor, state_fan_rx, block_fan_rx),
        );

        let (tx_est_tx, tx_est_rx) = mpsc::channel::<i64>(1);
        let tx_est_worker = tokio::spawn(Arc::clone(&self).tx_estimator_worker(tx_estimator, tx_est_rx));

        let (blk_est_tx, blk_est_rx) = mpsc::channel::<i64>(10);
        let blk_est_worker = tokio::spawn(Arc::clone(&self).block_estimator_worker(blk_est_rx));

        info!("feesim startup complete");
        self.fan_out(channels, state_fan_tx, block_fan_tx, tx_est_tx, blk_est_tx)
            .await;

        // Shutdown: drain the workers, stop the collector, flush storage.
        let _ = tokio::join!(sim_loop, predict_worker, tx_est_worker, blk_est_worker);
        let collector = self.collector.lock().take();
        if let Some(mut collector) = collector {
            collector.stop().await;
        }
        self.db.close()?;
        info!("feesim all stopped");
        Ok(())
    }

    /// The main loop: route collector output to the workers, never blocking
    /// on a slow consumer.
    async fn fan_out(
        &self,
        mut channels: CollectorChannels,
        state_fan_tx: mpsc::Sender<MempoolState>,
        block_fan_tx: mpsc::Sender<Vec<BlockInfo>>,
        tx_est_tx: mpsc::Sender<i64>,
        blk_est_tx: mpsc::Sender<i64>,
    ) {
        let mut done_rx = self.done_tx.subscribe();
        loop {
            tokio::select! {
                Some(state) = channels.states.recv() => {
                    if state_fan_tx.try_send(state.clone()).is_err() {
                        self.predict_drops.fetch_add(1, Ordering::Relaxed);
                        warn!("predictor (state) was busy");
                    }
                    if tx_est_tx.try_send(state.time).is_err() {
                        warn!("tx source estimator was busy");
                    }
                }
                Some(blocks) = channels.blocks.recv() => {
                    let last_height = blocks.last().map(|b| b.height);
                    if block_fan_tx.try_send(blocks).is_err() {
                        warn!("predictor (blocks) was busy");
                    }
                    if let Some(height) = last_height {
                        if blk_est_tx.try_send(height).is_err() {
                            warn!("block source estimator was busy");
                        }
                    }
                }
                Some(err) = channels.errors.recv() => {
                    error!("collector: {err:#}");
                }
                _ = done_rx.changed() => return,
            }
        }
    }

    /// The transient-sim tick loop: a two-phase state machine over the
    /// result channel, the pause channel, and shutdown.
    async fn sim_loop(self: Arc<Self>) {
        let mut pause_rx = self.pause_rx.lock().take().expect("sim loop started twice");
        let mut done_rx = self.done_tx.subscribe();
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(self.cfg.sim_period));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut paused = false;

        loop {
            // Result phase: start a run unless paused or prerequisites are
            // missing.
            if !paused {
                match self.setup_sim() {
                    Err(e) => self.set_result(Err(e)),
                    Ok((ts, mut result_rx)) => {
                        if self.result().is_err() {
                            self.set_result(Err(FeeSimError::InProgress));
                        }
                        debug!("transient sim started");
                        let started = Instant::now();
                        loop {
                            tokio::select! {
                                r = &mut result_rx => {
                                    if let Ok(result) = r {
                                        debug!("transient sim complete");
                                        self.timers.observe(started.elapsed());
                                        self.set_result(Ok(result));
                                    }
                                    break;
                                }
                                Some(p) = pause_rx.recv() => {
                                    if !p {
                                        continue;
                                    }
                                    stop_transient(ts).await;
                                    paused = true;
                                    self.set_result(Err(FeeSimError::Paused));
                                    break;
                                }
                                _ = done_rx.changed() => {
                                    stop_transient(ts).await;
                                    self.set_result(Err(FeeSimError::Shutdown));
                                    return;
                                }
                            }
                        }
                    }
                }
            }

            // Wait phase: sleep out the tick, tracking pause transitions.
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !paused {
                            break;
                        }
                    }
                    Some(p) = pause_rx.recv() => {
                        if p && !paused {
                            paused = true;
                            self.set_result(Err(FeeSimError::Paused));
                        } else if !p && paused {
                            paused = false;
                            ticker.reset();
                            self.set_result(Err(FeeSimError::InProgress));
                            break;
                        }
                    }
                    _ = done_rx.changed() => {
                        self.set_result(Err(FeeSimError::Shutdown));
                        return;
                    }
                }
            }
        }
    }

    /// Build a transient sim over the current state and fitted sources.
    ///
    /// The mempool is trimmed below a cutoff fee rate first: transactions
    /// whose stratum would take much longer than the simulated horizon to
    /// drain cannot affect the result.
    fn setup_sim(&self) -> Result<(TransientSim, oneshot::Receiver<Vec<FeeRate>>), FeeSimError> {
        let state = self.state().ok_or(FeeSimError::MempoolNotAvailable)?;
        let tx_source = self.tx_source()?;
        let block_source = self.block_source()?;

        let txratefn = tx_source.rate_fn();
        let capratefn = block_source.rate_fn();
        let sizefn = state.size_fn();
        let maxcap = capratefn.eval(f64::MAX);
        let max_confirms = self.cfg.transient.max_block_confirms;

        let highfee = sizefn.inverse(0.0);
        let n = if highfee > i32::MAX as f64 {
            i32::MAX as i64
        } else {
            highfee as i64
        };
        const DRAIN_BUFFER: f64 = 3.0;
        let cutoff = search_i64(n, |i| {
            let d = sizefn.eval(i as f64) / (maxcap - txratefn.eval(i as f64))
                * block_source.block_rate();
            d < DRAIN_BUFFER * max_confirms as f64 && d >= 0.0
        });

        let mempool = collect::simify_mempool(&state.entries).map_err(|e| {
            error!("simify mempool: {e:#}");
            FeeSimError::Source(e.to_string())
        })?;
        let trimmed: Vec<sim::Tx> = mempool
            .into_iter()
            .filter(|tx| tx.fee_rate >= cutoff)
            .map(|mut tx| {
                tx.parents.clear();
                tx
            })
            .collect();

        let sim = Sim::new(
            tx_source.reseed(rand::random()),
            block_source.reseed(rand::random()),
            trimmed,
        );
        debug!(
            "transient sim stablefeerate {}, lowfee {}",
            sim.stable_fee(),
            cutoff
        );
        let mut tcfg = self.cfg.transient.clone();
        tcfg.lowest_fee_rate = cutoff;
        Ok(TransientSim::start(sim, tcfg))
    }

    async fn predict_worker(
        self: Arc<Self>,
        mut predictor: Predictor,
        mut states: mpsc::Receiver<MempoolState>,
        mut blocks: mpsc::Receiver<Vec<BlockInfo>>,
    ) {
        let mut done_rx = self.done_tx.subscribe();
        loop {
            tokio::select! {
                Some(state) = states.recv() => {
                    let Ok(result) = self.result() else {
                        continue;
                    };
                    if let Err(e) = predictor.add_predicts(&state, &result) {
                        error!("add predicts: {e:#}");
                    }
                }
                Some(batch) = blocks.recv() => {
                    for block in &batch {
                        if let Err(e) = predictor.process_block(block) {
                            error!("predictor process block: {e:#}");
                        }
                    }
                    if let Some(state) = self.state() {
                        if let Err(e) = predictor.cleanup(&state) {
                            error!("predictor cleanup: {e:#}");
                        }
                    }
                }
                _ = done_rx.changed() => {
                    debug!("predict worker stopped");
                    return;
                }
            }
        }
    }

    async fn tx_estimator_worker(
        self: Arc<Self>,
        mut estimator: TxEstimator,
        mut times: mpsc::Receiver<i64>,
    ) {
        let mut done_rx = self.done_tx.subscribe();
        loop {
            let t = tokio::select! {
                Some(t) = times.recv() => t,
                _ = done_rx.changed() => {
                    debug!("tx source worker stopped");
                    return;
                }
            };

            self.set_tx_source(estimator.estimate(t));
            debug!("tx source estimate updated");

            // Compact away txs too old to matter to any window.
            if let Err(e) = self.tx_store.delete(0, t - self.cfg.tx_max_age) {
                error!("tx store compaction: {e:#}");
            }
        }
    }

    async fn block_estimator_worker(self: Arc<Self>, mut heights: mpsc::Receiver<i64>) {
        let mut done_rx = self.done_tx.subscribe();
        loop {
            let height = tokio::select! {
                Some(h) = heights.recv() => h,
                _ = done_rx.changed() => {
                    debug!("block source worker stopped");
                    return;
                }
            };

            self.set_block_source(estimate::block_source(
                height,
                &self.cfg.indblock,
                self.stat_store.as_ref(),
                rand::random(),
            ));
            debug!("block {height}: block source estimate updated");
        }
    }

    /// Re-anchor stored txs to the current wall clock: fetch the recent
    /// window, wipe the store, and re-insert with times shifted so the
    /// youngest tx is "now". If the gap to the wall clock is too wide, the
    /// old distribution is not worth keeping.
    fn normalize_tx_store(&self, time_now: i64) -> Result<()> {
        let txs = self.tx_store.get(time_now - self.cfg.tx_max_age, time_now)?;
        self.tx_store.delete(0, i64::MAX)?;
        let Some(youngest) = txs.last() else {
            info!("tx store empty; starting from scratch");
            return Ok(());
        };
        if youngest.time < time_now - self.cfg.tx_gap_tol {
            info!("tx store outdated; starting from scratch");
            return Ok(());
        }
        info!("normalizing tx store ({} txs)", txs.len());
        let shift = time_now - youngest.time;
        let shifted: Vec<estimate::Tx> = txs
            .into_iter()
            .map(|mut tx| {
                tx.time += shift;
                tx
            })
            .collect();
        self.tx_store.put(&shifted)?;
        Ok(())
    }

    // Shared-state accessors. Getters take the read lock, setters the write
    // lock.

    pub fn result(&self) -> Result<Vec<FeeRate>, FeeSimError> {
        self.shared.read().result.clone()
    }

    fn set_result(&self, result: Result<Vec<FeeRate>, FeeSimError>) {
        self.shared.write().result = result;
    }

    pub fn tx_source(&self) -> Result<Arc<dyn TxSource>, FeeSimError> {
        self.shared.read().tx_source.clone()
    }

    fn set_tx_source(&self, fit: Result<Arc<dyn TxSource>, EstimateError>) {
        match &fit {
            Err(e) if !e.is_insufficient_data() => error!("tx source estimation: {e}"),
            _ => {}
        }
        self.shared.write().tx_source = fit.map_err(|e| FeeSimError::from(&e));
    }

    pub fn block_source(&self) -> Result<Arc<dyn BlockSource>, FeeSimError> {
        self.shared.read().block_source.clone()
    }

    fn set_block_source(&self, fit: Result<sim::IndBlockSource, EstimateError>) {
        match &fit {
            Err(e) if !e.is_insufficient_data() => error!("block source estimation: {e}"),
            _ => {}
        }
        self.shared.write().block_source = fit
            .map(|src| Arc::new(src) as Arc<dyn BlockSource>)
            .map_err(|e| FeeSimError::from(&e));
    }

    pub fn state(&self) -> Option<MempoolState> {
        self.collector.lock().as_ref().and_then(|c| c.state())
    }

    pub fn predict_scores(&self) -> Result<(Vec<f64>, Vec<f64>)> {
        use predict::PredictDb;
        self.predict_store.get_scores()
    }

    pub async fn pause(&self, pause: bool) {
        let _ = self.pause_tx.send(pause).await;
        if pause {
            info!("sim paused");
        } else {
            info!("sim unpaused");
        }
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.result(), Err(FeeSimError::Paused))
    }

    /// Signal shutdown; `run` drains the workers and returns. Idempotent.
    pub fn stop(&self) {
        let mut shared = self.shared.write();
        if !shared.done {
            shared.done = true;
            self.done_tx.send_replace(true);
        }
    }

    pub fn status(&self) -> HashMap<String, String> {
        let mut status = HashMap::new();
        status.insert(
            "result".to_string(),
            match self.result() {
                Ok(_) => "OK".to_string(),
                Err(e) => e.to_string(),
            },
        );
        status.insert(
            "txsource".to_string(),
            match self.tx_source() {
                Ok(_) => "OK".to_string(),
                Err(e) => e.to_string(),
            },
        );
        status.insert(
            "blocksource".to_string(),
            match self.block_source() {
                Ok(_) => "OK".to_string(),
                Err(e) => e.to_string(),
            },
        );
        status.insert(
            "mempool".to_string(),
            match self.state() {
                Some(_) => "OK".to_string(),
                None => "mempool state not available".to_string(),
            },
        );
        status.insert(
            "predict_drops".to_string(),
            self.predict_drops.load(Ordering::Relaxed).to_string(),
        );
        status
    }
}

/// `TransientSim::stop` joins worker threads; hop off the async runtime for
/// it.
async fn stop_transient(ts: TransientSim) {
    let _ = tokio::task::spawn_blocking(move || ts.stop()).await;
}
