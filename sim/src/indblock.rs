use std::collections::BTreeMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::Exp1;
use serde_json::json;

use crate::util::{seeded_rng, spawn_seeds};
use crate::{BlockPolicy, BlockSource, CapRateFn, FeeRate, TxSize, MAX_FEE_RATE};

/// Models max block size and min fee rate as independent uniform draws over
/// the observed samples, with exponential inter-block times.
#[derive(Debug)]
pub struct IndBlockSource {
    min_fee_rates: Vec<FeeRate>,
    max_block_sizes: Vec<TxSize>,
    blockrate: f64, // blocks per second
    seed: u64,
    rng: StdRng,
}

impl IndBlockSource {
    /// Panics on a non-positive block rate or empty sample arrays.
    pub fn new(
        min_fee_rates: Vec<FeeRate>,
        max_block_sizes: Vec<TxSize>,
        blockrate: f64,
        seed: u64,
    ) -> Self {
        assert!(blockrate > 0.0, "blockrate must be > 0");
        assert!(
            !min_fee_rates.is_empty() && !max_block_sizes.is_empty(),
            "min_fee_rates and max_block_sizes must be non-empty"
        );
        IndBlockSource {
            min_fee_rates,
            max_block_sizes,
            blockrate,
            seed,
            rng: seeded_rng(seed),
        }
    }
}

impl BlockSource for IndBlockSource {
    fn next_block(&mut self) -> (Duration, BlockPolicy) {
        let e: f64 = self.rng.sample(Exp1);
        let t = Duration::from_secs_f64(e / self.blockrate);
        let min_fee_rate = self.min_fee_rates[self.rng.gen_range(0..self.min_fee_rates.len())];
        let max_block_size = self.max_block_sizes[self.rng.gen_range(0..self.max_block_sizes.len())];
        (
            t,
            BlockPolicy {
                min_fee_rate,
                max_block_size,
            },
        )
    }

    fn copy(&self, n: usize) -> Vec<Box<dyn BlockSource>> {
        spawn_seeds(self.seed, n)
            .into_iter()
            .map(|seed| {
                Box::new(IndBlockSource {
                    min_fee_rates: self.min_fee_rates.clone(),
                    max_block_sizes: self.max_block_sizes.clone(),
                    blockrate: self.blockrate,
                    seed,
                    rng: seeded_rng(seed),
                }) as Box<dyn BlockSource>
            })
            .collect()
    }

    fn reseed(&self, seed: u64) -> Box<dyn BlockSource> {
        Box::new(IndBlockSource {
            min_fee_rates: self.min_fee_rates.clone(),
            max_block_sizes: self.max_block_sizes.clone(),
            blockrate: self.blockrate,
            seed,
            rng: seeded_rng(seed),
        })
    }

    fn rate_fn(&self) -> CapRateFn {
        let sizesum: TxSize = self.max_block_sizes.iter().sum();
        let avg_mbs = sizesum as f64 / self.max_block_sizes.len() as f64;

        // Never-mining strata produce no capacity and are excluded.
        let mut m: BTreeMap<FeeRate, f64> = BTreeMap::new();
        for &f in &self.min_fee_rates {
            if f < MAX_FEE_RATE {
                *m.entry(f).or_default() += 1.0 / self.min_fee_rates.len() as f64;
            }
        }
        let x: Vec<f64> = m.keys().map(|&k| k as f64).collect();
        let mut y = Vec::with_capacity(x.len());
        let mut ratesum = 0.0;
        for (_, q) in m.iter() {
            ratesum += q * avg_mbs * self.blockrate;
            y.push(ratesum);
        }
        CapRateFn::new(x, y)
    }

    fn block_rate(&self) -> f64 {
        self.blockrate
    }

    fn describe(&self) -> serde_json::Value {
        let mut min_fee_rates: Vec<f64> = self
            .min_fee_rates
            .iter()
            .map(|&f| if f == MAX_FEE_RATE { -1.0 } else { f as f64 })
            .collect();
        min_fee_rates.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap());
        let mut max_block_sizes = self.max_block_sizes.clone();
        max_block_sizes.sort_unstable();
        json!({
            "type": "IndBlockSource",
            "minfeerates": min_fee_rates,
            "maxblocksizes": max_block_sizes,
            "blockrate": self.blockrate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MonotonicFn;

    #[test]
    fn interarrival_mean_matches_block_rate() {
        let mut src = IndBlockSource::new(vec![5000], vec![1_000_000], 1.0 / 600.0, 31);
        let n = 50_000;
        let total: f64 = (0..n)
            .map(|_| src.next_block().0.as_secs_f64())
            .sum();
        let mean = total / n as f64;
        assert!((mean - 600.0).abs() / 600.0 < 0.02, "mean {mean}");
    }

    #[test]
    fn policy_drawn_from_samples() {
        let fees = vec![1000, 2000, 3000];
        let sizes = vec![500_000, 1_000_000];
        let mut src = IndBlockSource::new(fees.clone(), sizes.clone(), 1.0 / 600.0, 32);
        for _ in 0..200 {
            let (_, p) = src.next_block();
            assert!(fees.contains(&p.min_fee_rate));
            assert!(sizes.contains(&p.max_block_size));
        }
    }

    #[test]
    fn rate_fn_cumulative_capacity() {
        let src = IndBlockSource::new(
            vec![1000, 1000, 5000, MAX_FEE_RATE],
            vec![1_000_000],
            1.0 / 600.0,
            33,
        );
        let f = src.rate_fn();
        let per_block = 1_000_000.0 / 600.0;
        assert_eq!(f.eval(999.0), 0.0);
        assert!((f.eval(1000.0) - per_block * 0.5).abs() < 1e-9);
        // The never-mining stratum contributes nothing at the top.
        assert!((f.eval(f64::MAX) - per_block * 0.75).abs() < 1e-9);
    }

    #[test]
    #[should_panic(expected = "blockrate must be > 0")]
    fn zero_block_rate_panics() {
        IndBlockSource::new(vec![1000], vec![1_000_000], 0.0, 34);
    }

    #[test]
    #[should_panic(expected = "non-empty")]
    fn empty_samples_panic() {
        IndBlockSource::new(Vec::new(), vec![1_000_000], 1.0 / 600.0, 35);
    }
}
