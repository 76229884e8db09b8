use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::process_block::process_blocks;
use crate::{BlockGetter, BlockInfo, BlockStatSink, MempoolState, MempoolStateGetter, TxSink};

/// Depth of the state/block/error hand-off queues. When a queue is full the
/// notification is dropped so polling never stalls.
const CHANNEL_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Mempool poll period in seconds.
    #[serde(rename = "pollperiod")]
    pub poll_period: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig { poll_period: 10 }
    }
}

/// Output channels of a running collector. All three must be serviced.
pub struct CollectorChannels {
    pub states: mpsc::Receiver<MempoolState>,
    pub blocks: mpsc::Receiver<Vec<BlockInfo>>,
    pub errors: mpsc::Receiver<anyhow::Error>,
}

/// Polls the node's mempool on a fixed period, persisting newly observed
/// transactions, publishing state snapshots, and producing per-block stats
/// when the height advances.
pub struct Collector {
    state: Arc<Mutex<Option<MempoolState>>>,
    done: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

struct CollectorInner {
    get_state: Arc<dyn MempoolStateGetter>,
    get_block: Arc<dyn BlockGetter>,
    txdb: Arc<dyn TxSink>,
    blkdb: Arc<dyn BlockStatSink>,
    state: Arc<Mutex<Option<MempoolState>>>,
    states_tx: mpsc::Sender<MempoolState>,
    blocks_tx: mpsc::Sender<Vec<BlockInfo>>,
    errors_tx: mpsc::Sender<anyhow::Error>,
}

impl Collector {
    /// Fetch the initial mempool state and start the polling task. Fails if
    /// the node is unreachable at startup.
    pub async fn start(
        get_state: Arc<dyn MempoolStateGetter>,
        get_block: Arc<dyn BlockGetter>,
        txdb: Arc<dyn TxSink>,
        blkdb: Arc<dyn BlockStatSink>,
        cfg: CollectorConfig,
    ) -> Result<(Collector, CollectorChannels)> {
        let initial = get_state
            .get_state()
            .await
            .context("initial mempool state")?;
        let state = Arc::new(Mutex::new(Some(initial)));

        let (states_tx, states_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (blocks_tx, blocks_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (errors_tx, errors_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (done, mut done_rx) = watch::channel(false);

        let inner = CollectorInner {
            get_state,
            get_block,
            txdb,
            blkdb,
            state: Arc::clone(&state),
            states_tx,
            blocks_tx,
            errors_tx,
        };
        let poll_period = Duration::from_secs(cfg.poll_period);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick completes immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = done_rx.changed() => {
                        inner.state.lock().take();
                        return;
                    }
                }
                inner.poll().await;
            }
        });

        Ok((
            Collector {
                state,
                done,
                task: Some(task),
            },
            CollectorChannels {
                states: states_rx,
                blocks: blocks_rx,
                errors: errors_rx,
            },
        ))
    }

    /// The most recent successfully fetched state; `None` after a fetch
    /// error or shutdown.
    pub fn state(&self) -> Option<MempoolState> {
        self.state.lock().clone()
    }

    /// Stop polling and wait for the task to wind down.
    pub async fn stop(&mut self) {
        let _ = self.done.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl CollectorInner {
    async fn poll(&self) {
        let curr = match self.get_state.get_state().await {
            Ok(curr) => curr,
            Err(e) => {
                self.state.lock().take();
                self.emit_error(e.context("get_state"));
                return;
            }
        };

        let prev = self.state.lock().replace(curr.clone());
        let Some(prev) = prev else {
            return;
        };
        assert!(prev.height <= curr.height, "block height decreased");

        // Persist the newly observed txs.
        let new_txs: Vec<estimate::Tx> = curr
            .sub(&prev)
            .entries
            .values()
            .map(|entry| estimate::Tx {
                fee_rate: entry.fee_rate,
                size: entry.size,
                time: entry.time,
                kind: 0,
            })
            .collect();
        debug!("{} new txs, {}", new_txs.len(), curr);
        if let Err(e) = self.txdb.put(&new_txs) {
            self.emit_error(e.context("tx store put"));
            return;
        }

        if self.states_tx.try_send(curr.clone()).is_err() {
            warn!("state channel full; dropping snapshot");
        }

        if prev.height == curr.height {
            return;
        }

        // The height advanced; fetch and process the new blocks.
        let mut blocks = Vec::with_capacity((curr.height - prev.height) as usize);
        for height in prev.height + 1..=curr.height {
            match self.get_block.get_block(height).await {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    self.emit_error(e.context("get_block"));
                    return;
                }
            }
        }
        let stats = process_blocks(&prev, &curr, &blocks);

        if self.blocks_tx.try_send(blocks).is_err() {
            warn!("block channel full; dropping blocks");
        }
        if let Err(e) = self.blkdb.put(&stats) {
            self.emit_error(e.context("block stat store put"));
        }
    }

    fn emit_error(&self, e: anyhow::Error) {
        if self.errors_tx.try_send(e).is_err() {
            warn!("error channel full; dropping error");
        }
    }
}
