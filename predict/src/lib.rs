//! Validation of the sim models: predict the confirmation times of observed
//! transactions, then compare with what actually happened.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use collect::{BlockInfo, MempoolState};
use sim::FeeRate;

/// A stored prediction for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPred {
    /// Predicted number of blocks until confirmation, >= 1.
    pub confirm_in: i64,
    /// Absolute block height by which confirmation was predicted.
    pub confirm_by: i64,
}

/// Persistence for predictions and the running score vectors.
pub trait PredictDb: Send + Sync {
    /// Only txids that were previously put appear in the result.
    fn get_txs(&self, txids: &[String]) -> Result<HashMap<String, TxPred>>;

    fn put_txs(&self, txs: &HashMap<String, TxPred>) -> Result<()>;

    fn get_scores(&self) -> Result<(Vec<f64>, Vec<f64>)>;

    fn put_scores(&self, attained: &[f64], exceeded: &[f64]) -> Result<()>;

    /// Delete every stored prediction whose txid is not in `txids`.
    fn reconcile(&self, txids: &[String]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    #[serde(rename = "maxblockconfirms")]
    pub max_block_confirms: usize,
    /// Score decay half-life, in blocks.
    pub halflife: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        PredictorConfig {
            max_block_confirms: 6,
            halflife: 1008, // one week
        }
    }
}

/// Records per-tx predictions against the current fee estimate and tallies
/// outcomes as blocks arrive. Single-threaded; calls must arrive in state
/// order, with `add_predicts` before any corresponding `process_block`.
pub struct Predictor {
    db: Arc<dyn PredictDb>,
    cfg: PredictorConfig,
    a: f64,
    state: Option<MempoolState>,
}

impl Predictor {
    /// Loads and size-normalizes the persisted scores: pads with zeros or
    /// truncates to exactly `max_block_confirms` entries.
    pub fn new(db: Arc<dyn PredictDb>, cfg: PredictorConfig) -> Result<Predictor> {
        let (mut attained, mut exceeded) = db.get_scores()?;
        attained.resize(cfg.max_block_confirms, 0.0);
        exceeded.resize(cfg.max_block_confirms, 0.0);
        db.put_scores(&attained, &exceeded)?;

        let a = 0.5f64.powf(1.0 / cfg.halflife as f64);
        Ok(Predictor {
            db,
            cfg,
            a,
            state: None,
        })
    }

    /// Record predictions for txs that entered the mempool since the last
    /// call, against the current result vector (sat/kB, length <= the
    /// configured max confirms).
    pub fn add_predicts(&mut self, state: &MempoolState, result: &[FeeRate]) -> Result<()> {
        let prev = self.state.replace(state.clone());
        let Some(prev) = prev else {
            return Ok(());
        };

        let diff = state.sub(&prev);
        let mut predicts = HashMap::new();
        for (txid, entry) in diff.entries {
            // Txs with in-mempool dependencies or priority inclusion don't
            // reflect the fee market.
            if !entry.depends.is_empty() || entry.high_priority {
                continue;
            }
            let confirm_in = search_result(result, entry.fee_rate) + 1;
            if confirm_in > result.len() || confirm_in > self.cfg.max_block_confirms {
                continue;
            }
            predicts.insert(
                txid,
                TxPred {
                    confirm_in: confirm_in as i64,
                    confirm_by: state.height + confirm_in as i64,
                },
            );
        }
        debug!("predictor: {} predicts added", predicts.len());
        self.db.put_txs(&predicts)
    }

    /// Tally the outcomes of stored predictions confirmed by this block,
    /// then fold them into the decayed running scores.
    pub fn process_block(&self, block: &BlockInfo) -> Result<()> {
        let m = self.cfg.max_block_confirms;
        let mut attained = vec![0.0; m];
        let mut exceeded = vec![0.0; m];
        let tallied = self.db.get_txs(&block.txids)?;
        for pred in tallied.values() {
            if block.height <= pred.confirm_by {
                attained[(pred.confirm_in - 1) as usize] += 1.0;
            } else {
                exceeded[(pred.confirm_in - 1) as usize] += 1.0;
            }
        }
        debug!("predictor: {} predicts tallied", tallied.len());

        let (mut attained_total, mut exceeded_total) = self.db.get_scores()?;
        for i in 0..m {
            attained_total[i] = self.a * attained_total[i] + attained[i];
            exceeded_total[i] = self.a * exceeded_total[i] + exceeded[i];
        }
        self.db.put_scores(&attained_total, &exceeded_total)
    }

    /// Drop stored predictions for txs no longer in the mempool (conflict
    /// orphans).
    pub fn cleanup(&self, state: &MempoolState) -> Result<()> {
        let txids: Vec<String> = state.entries.keys().cloned().collect();
        self.db.reconcile(&txids)
    }

    pub fn scores(&self) -> Result<(Vec<f64>, Vec<f64>)> {
        self.db.get_scores()
    }
}

/// The smallest index `i` such that `fee_rate >= result[i]` and `result[i]`
/// is not the no-confirmation sentinel; `result.len()` if none.
fn search_result(result: &[FeeRate], fee_rate: FeeRate) -> usize {
    result
        .iter()
        .position(|&r| fee_rate >= r && r != -1)
        .unwrap_or(result.len())
}
