use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use sim::{FeeRate, TxSize, UniTxSource};

use crate::{EstimateError, Tx, TxDb};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct UniTxSourceConfig {
    /// Minimum observation window in seconds before an estimate is usable.
    #[serde(rename = "minwindow")]
    pub min_window: i64,
    /// Maximum lookback in seconds on the first estimate.
    #[serde(rename = "maxwindow")]
    pub max_window: i64,
    /// Exponential-decay half-life in seconds.
    pub halflife: i64,
}

impl Default for UniTxSourceConfig {
    fn default() -> Self {
        UniTxSourceConfig {
            min_window: 600,
            max_window: 10800,
            halflife: 3600,
        }
    }
}

/// Estimates a uniform tx source from a sliding reservoir of observed
/// transactions with exponential time decay.
///
/// The estimator is stateful across calls; successive calls must have
/// non-decreasing `t`.
pub struct UniTxSourceEstimator {
    txs: Vec<Tx>,
    prev_time: i64,
    window: i64,
    a: f64,
    r: f64,

    db: Arc<dyn TxDb>,
    cfg: UniTxSourceConfig,
    rng: StdRng,
}

impl UniTxSourceEstimator {
    pub fn new(db: Arc<dyn TxDb>, cfg: UniTxSourceConfig, rng: StdRng) -> Self {
        let a = 0.5f64.powf(1.0 / cfg.halflife as f64);
        UniTxSourceEstimator {
            txs: Vec::new(),
            prev_time: 0,
            window: 0,
            a,
            r: 0.0,
            db,
            cfg,
            rng,
        }
    }

    pub fn estimate(&mut self, curr_time: i64) -> Result<UniTxSource, EstimateError> {
        let new_txs = if self.prev_time == 0 {
            // First call.
            let txs = self.db.get(curr_time - self.cfg.max_window, curr_time)?;
            self.prev_time = if txs.is_empty() {
                curr_time
            } else {
                txs[0].time
            };
            txs
        } else {
            self.db.get(self.prev_time + 1, curr_time)?
        };

        for tx in new_txs {
            self.add_tx(tx);
        }

        if self.window < self.cfg.min_window {
            return Err(EstimateError::TxWindow {
                window: self.window,
                min_window: self.cfg.min_window,
            });
        }

        let fee_rates: Vec<FeeRate> = self.txs.iter().map(|tx| tx.fee_rate).collect();
        let sizes: Vec<TxSize> = self.txs.iter().map(|tx| tx.size).collect();
        let txrate = self.r * self.a.ln() / (self.a.powf(self.window as f64) - 1.0);
        Ok(UniTxSource::new(fee_rates, sizes, txrate, self.rng.gen()))
    }

    fn add_tx(&mut self, tx: Tx) {
        let delta = tx.time - self.prev_time;
        self.window += delta;
        let p = self.a.powf(delta as f64);
        self.r = self.r * p + 1.0;

        let num_discard = round_random((1.0 - p) * self.txs.len() as f64, &mut self.rng);
        for _ in 0..num_discard {
            let i = self.rng.gen_range(0..self.txs.len());
            self.txs.swap_remove(i);
        }
        self.txs.push(tx);
        self.prev_time = tx.time;
    }

    pub fn reservoir_len(&self) -> usize {
        self.txs.len()
    }

    pub fn window(&self) -> i64 {
        self.window
    }
}

/// Round `f` to `floor(f)` or `floor(f) + 1` at random, such that the
/// expected value is `f`.
pub fn round_random(f: f64, rng: &mut StdRng) -> usize {
    let r = f - f.floor();
    let p: f64 = rng.gen();
    if p > r {
        f as usize
    } else {
        f as usize + 1
    }
}
