use std::collections::BTreeMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;
use serde_json::json;

use crate::util::{poisson_variate, seeded_rng, spawn_seeds};
use crate::{FeeRate, Tx, TxRateFn, TxSize, TxSource, MAX_TX_SIZE};

/// Poisson arrivals with independent (fee rate, size) drawn by stored
/// cumulative weights.
pub struct MultiTxSource {
    txs: Vec<Tx>,
    weights: Vec<f64>, // normalized
    index: Vec<f64>,   // cumulative weights, ending at 1
    txrate: f64,       // txs per second
    min_size: TxSize,
    seed: u64,
    rng: StdRng,
}

impl MultiTxSource {
    /// Panics on mismatched array lengths or non-positive weights. An empty
    /// table forces the rate to zero.
    pub fn new(
        fee_rates: Vec<FeeRate>,
        sizes: Vec<TxSize>,
        weights: Vec<f64>,
        txrate: f64,
        seed: u64,
    ) -> Self {
        assert!(
            fee_rates.len() == weights.len() && sizes.len() == weights.len(),
            "fee_rates / sizes / weights must have same len"
        );
        let txrate = if fee_rates.is_empty() { 0.0 } else { txrate };

        let mut total = 0.0;
        let mut min_size = MAX_TX_SIZE;
        let mut index = Vec::with_capacity(weights.len());
        let mut txs = Vec::with_capacity(weights.len());
        for ((&fee_rate, &size), &w) in fee_rates.iter().zip(&sizes).zip(&weights) {
            assert!(w > 0.0, "weights must be positive");
            total += w;
            index.push(total);
            if size < min_size {
                min_size = size;
            }
            txs.push(Tx {
                fee_rate,
                size,
                parents: Vec::new(),
            });
        }
        let weights: Vec<f64> = weights.iter().map(|w| w / total).collect();
        for i in &mut index {
            *i /= total;
        }

        MultiTxSource {
            txs,
            weights,
            index,
            txrate,
            min_size,
            seed,
            rng: seeded_rng(seed),
        }
    }
}

impl TxSource for MultiTxSource {
    fn generate(&mut self, t: Duration) -> Vec<Tx> {
        let l = t.as_secs_f64() * self.txrate;
        let n = poisson_variate(l, &mut self.rng);
        (0..n)
            .map(|_| {
                let x: f64 = self.rng.gen();
                let pos = self.index.partition_point(|&v| v < x);
                self.txs[pos.min(self.txs.len() - 1)].clone()
            })
            .collect()
    }

    fn copy(&self, n: usize) -> Vec<Box<dyn TxSource>> {
        spawn_seeds(self.seed, n)
            .into_iter()
            .map(|seed| {
                Box::new(MultiTxSource {
                    txs: self.txs.clone(),
                    weights: self.weights.clone(),
                    index: self.index.clone(),
                    txrate: self.txrate,
                    min_size: self.min_size,
                    seed,
                    rng: seeded_rng(seed),
                }) as Box<dyn TxSource>
            })
            .collect()
    }

    fn reseed(&self, seed: u64) -> Box<dyn TxSource> {
        Box::new(MultiTxSource {
            txs: self.txs.clone(),
            weights: self.weights.clone(),
            index: self.index.clone(),
            txrate: self.txrate,
            min_size: self.min_size,
            seed,
            rng: seeded_rng(seed),
        })
    }

    fn min_size(&self) -> TxSize {
        self.min_size
    }

    fn rate_fn(&self) -> TxRateFn {
        let mut m: BTreeMap<FeeRate, f64> = BTreeMap::new();
        for (tx, w) in self.txs.iter().zip(&self.weights) {
            *m.entry(tx.fee_rate).or_default() += tx.size as f64 * w;
        }
        let x: Vec<f64> = m.keys().map(|&k| k as f64).collect();
        let mut y = vec![0.0; x.len()];
        let mut sum = 0.0;
        for (i, (_, bytes)) in m.iter().enumerate().rev() {
            sum += bytes * self.txrate;
            y[i] = sum;
        }
        TxRateFn::new(x, y)
    }

    fn describe(&self) -> serde_json::Value {
        let fee_rates: Vec<FeeRate> = self.txs.iter().map(|tx| tx.fee_rate).collect();
        let sizes: Vec<TxSize> = self.txs.iter().map(|tx| tx.size).collect();
        json!({
            "type": "MultiTxSource",
            "feerates": fee_rates,
            "sizes": sizes,
            "weights": self.weights,
            "txrate": self.txrate,
        })
    }
}
