use std::collections::BTreeMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;
use serde_json::json;

use crate::util::{poisson_variate, seeded_rng, spawn_seeds};
use crate::{FeeRate, Tx, TxRateFn, TxSize, TxSource, MAX_TX_SIZE};

/// Poisson arrivals sampled uniformly from a stored tx table.
#[derive(Debug)]
pub struct UniTxSource {
    txs: Vec<Tx>,
    txrate: f64, // txs per second
    min_size: TxSize,
    seed: u64,
    rng: StdRng,
}

impl UniTxSource {
    /// Panics if `fee_rates` and `sizes` have different lengths. An empty
    /// table forces the rate to zero (a null source).
    pub fn new(fee_rates: Vec<FeeRate>, sizes: Vec<TxSize>, txrate: f64, seed: u64) -> Self {
        assert_eq!(
            fee_rates.len(),
            sizes.len(),
            "fee_rates and sizes must have same len"
        );
        let txrate = if fee_rates.is_empty() { 0.0 } else { txrate };
        let mut min_size = MAX_TX_SIZE;
        let txs: Vec<Tx> = fee_rates
            .into_iter()
            .zip(sizes)
            .map(|(fee_rate, size)| {
                if size < min_size {
                    min_size = size;
                }
                Tx {
                    fee_rate,
                    size,
                    parents: Vec::new(),
                }
            })
            .collect();
        UniTxSource {
            txs,
            txrate,
            min_size,
            seed,
            rng: seeded_rng(seed),
        }
    }
}

impl TxSource for UniTxSource {
    fn generate(&mut self, t: Duration) -> Vec<Tx> {
        let l = t.as_secs_f64() * self.txrate;
        let n = poisson_variate(l, &mut self.rng);
        (0..n)
            .map(|_| {
                let j = self.rng.gen_range(0..self.txs.len());
                self.txs[j].clone()
            })
            .collect()
    }

    fn copy(&self, n: usize) -> Vec<Box<dyn TxSource>> {
        spawn_seeds(self.seed, n)
            .into_iter()
            .map(|seed| {
                Box::new(UniTxSource {
                    txs: self.txs.clone(),
                    txrate: self.txrate,
                    min_size: self.min_size,
                    seed,
                    rng: seeded_rng(seed),
                }) as Box<dyn TxSource>
            })
            .collect()
    }

    fn reseed(&self, seed: u64) -> Box<dyn TxSource> {
        Box::new(UniTxSource {
            txs: self.txs.clone(),
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
        for tx in &self.txs {
            *m.entry(tx.fee_rate).or_default() += tx.size as f64;
        }
        let x: Vec<f64> = m.keys().map(|&k| k as f64).collect();
        let mut y = vec![0.0; x.len()];
        let mut sum = 0.0;
        for (i, (_, bytes)) in m.iter().enumerate().rev() {
            sum += bytes * self.txrate / self.txs.len() as f64;
            y[i] = sum;
        }
        TxRateFn::new(x, y)
    }

    fn describe(&self) -> serde_json::Value {
        let fee_rates: Vec<FeeRate> = self.txs.iter().map(|tx| tx.fee_rate).collect();
        let sizes: Vec<TxSize> = self.txs.iter().map(|tx| tx.size).collect();
        json!({
            "type": "UniTxSource",
            "feerates": fee_rates,
            "sizes": sizes,
            "txrate": self.txrate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MonotonicFn;

    #[test]
    fn generate_count_tracks_rate() {
        let mut src = UniTxSource::new(vec![10000, 20000], vec![250, 500], 2.0, 11);
        let n: usize = (0..10_000)
            .map(|_| src.generate(Duration::from_secs(10)).len())
            .sum();
        let mean = n as f64 / 10_000.0;
        assert!((mean - 20.0).abs() / 20.0 < 0.02, "mean {mean}");
    }

    #[test]
    fn null_source_generates_nothing() {
        let mut src = UniTxSource::new(Vec::new(), Vec::new(), 5.0, 12);
        assert!(src.generate(Duration::from_secs(600)).is_empty());
        assert_eq!(src.min_size(), MAX_TX_SIZE);
    }

    #[test]
    fn rate_fn_reverse_cumulative() {
        // Each tx contributes size/len * txrate to all strata at or below
        // its fee rate.
        let src = UniTxSource::new(vec![20000, 10000, 10000], vec![300, 600, 600], 2.0, 13);
        let f = src.rate_fn();
        assert_eq!(f.eval(20000.0), 200.0);
        assert_eq!(f.eval(10000.0), 1000.0);
        assert_eq!(f.eval(20001.0), 0.0);
    }
}
