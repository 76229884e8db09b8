//! Transient (finite-horizon) Monte-Carlo estimation over [`Sim`].
//!
//! Many independent trajectories are simulated in parallel; each yields the
//! descending staircase of stranding fee rates versus confirmation time.
//! Aggregating the staircases gives, for each fee-rate stratum, a histogram
//! of confirmation times, from which the fee-for-N-blocks vector at the
//! target success percentile is read off.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use crate::{FeeRate, Sim, MAX_FEE_RATE};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransientConfig {
    #[serde(rename = "maxblockconfirms")]
    pub max_block_confirms: usize,
    #[serde(rename = "minsuccesspct")]
    pub min_success_pct: f64, // in [0, 1)
    #[serde(rename = "numiters")]
    pub num_iters: usize,
    /// Worker thread count; 0 means all available cores.
    pub parallelism: usize,
    #[serde(skip)]
    pub lowest_fee_rate: FeeRate,
}

impl Default for TransientConfig {
    fn default() -> Self {
        TransientConfig {
            max_block_confirms: 12,
            min_success_pct: 0.9,
            num_iters: 10000,
            parallelism: 0,
            lowest_fee_rate: 0,
        }
    }
}

/// One trajectory's descending (fee rate, confirmation time) staircase.
struct TrajectoryVar {
    fee_rates: Vec<FeeRate>,
    conf_times: Vec<usize>,
}

/// A parallel Monte-Carlo run over cloned simulators. Dropping the handle
/// without calling [`TransientSim::stop`] leaves the workers to finish on
/// their own; a stopped run never delivers a result.
pub struct TransientSim {
    stop: Arc<AtomicBool>,
    coordinator: Mutex<Option<thread::JoinHandle<()>>>,
    lowest_fee: FeeRate,
}

impl TransientSim {
    /// Start the run. The receiver yields the result vector exactly once on
    /// completion; it is dropped (yielding `Err`) if the run is stopped.
    pub fn start(mut sim: Sim, cfg: TransientConfig) -> (TransientSim, oneshot::Receiver<Vec<FeeRate>>) {
        let lowest_fee = cfg.lowest_fee_rate.max(sim.stable_fee());
        let stop = Arc::new(AtomicBool::new(false));
        let (result_tx, result_rx) = oneshot::channel();

        let stop_run = Arc::clone(&stop);
        let coordinator = thread::spawn(move || {
            let workers = if cfg.parallelism > 0 {
                cfg.parallelism
            } else {
                thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
            };

            sim.reset();
            let mut sims = sim.copy(workers.saturating_sub(1));
            sims.push(sim);

            let (var_tx, var_rx) = mpsc::channel();
            let mut handles = Vec::with_capacity(workers);
            for (i, s) in sims.into_iter().enumerate() {
                let mut n = cfg.num_iters / workers;
                if i == 0 {
                    n += cfg.num_iters % workers;
                }
                let tx = var_tx.clone();
                let stop = Arc::clone(&stop_run);
                handles.push(thread::spawn(move || {
                    generate_trajectories(s, lowest_fee, cfg.max_block_confirms, n, &tx, &stop);
                }));
            }
            drop(var_tx);

            let mut vars = Vec::with_capacity(cfg.num_iters.min(1 << 16));
            while vars.len() < cfg.num_iters {
                match var_rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(v) => vars.push(v),
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if stop_run.load(Ordering::Relaxed) {
                            break;
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            for h in handles {
                let _ = h.join();
            }
            if vars.len() < cfg.num_iters {
                debug!("transient sim aborted after {} iterations", vars.len());
                return;
            }
            let result = aggregate(&vars, lowest_fee, cfg.max_block_confirms, cfg.min_success_pct);
            let _ = result_tx.send(result);
        });

        (
            TransientSim {
                stop,
                coordinator: Mutex::new(Some(coordinator)),
                lowest_fee,
            },
            result_rx,
        )
    }

    /// Abort the run and wait for all workers to terminate. Idempotent.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.coordinator.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn lowest_fee(&self) -> FeeRate {
        self.lowest_fee
    }
}

/// Run `n` trajectories on one simulator, emitting a staircase per
/// trajectory. Each staircase records, at each strictly lower SFR, the block
/// count by which that fee rate would have confirmed; it always terminates
/// with a `lowest` entry, at `max_blocks + 1` if `lowest` was never reached.
fn generate_trajectories(
    mut sim: Sim,
    lowest: FeeRate,
    max_blocks: usize,
    n: usize,
    out: &mpsc::Sender<TrajectoryVar>,
    stop: &AtomicBool,
) {
    for _ in 0..n {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let mut low = MAX_FEE_RATE;
        let mut v = TrajectoryVar {
            fee_rates: Vec::new(),
            conf_times: Vec::new(),
        };
        for j in 1..=max_blocks {
            let (mut sfr, _) = sim.next_block();
            if sfr < lowest {
                sfr = lowest;
            }
            if sfr < low {
                v.fee_rates.push(sfr);
                v.conf_times.push(j);
                low = sfr;
            }
            if sfr == lowest {
                break;
            }
        }
        if v.fee_rates.last() != Some(&lowest) {
            v.fee_rates.push(lowest);
            v.conf_times.push(max_blocks + 1);
        }
        if out.send(v).is_err() {
            return;
        }
        sim.reset();
    }
}

/// Collapse the staircases into the fee-for-N-blocks vector: `result[i]` is
/// the lowest fee-rate stratum whose `min_success_pct` percentile of
/// confirmation time is at most `i + 1` blocks, or -1 if no stratum
/// qualifies.
fn aggregate(
    vars: &[TrajectoryVar],
    lowest: FeeRate,
    max_blocks: usize,
    min_success_pct: f64,
) -> Vec<FeeRate> {
    let mut fee_strata: Vec<FeeRate> = vars
        .iter()
        .flat_map(|v| v.fee_rates.iter().copied())
        .collect();
    fee_strata.sort_unstable_by(|a, b| b.cmp(a));
    fee_strata.dedup();
    debug_assert_eq!(fee_strata.last(), Some(&lowest));

    // Confirmation-time histogram per stratum, over {1..max_blocks, M+1}.
    let mut hist = vec![vec![0usize; max_blocks + 1]; fee_strata.len()];
    for v in vars {
        let mut k = 0;
        for (j, &fee_rate) in v.fee_rates.iter().enumerate() {
            while k < fee_strata.len() && fee_strata[k] >= fee_rate {
                hist[k][v.conf_times[j] - 1] += 1;
                k += 1;
            }
        }
        assert_eq!(k, fee_strata.len(), "stratum skipped in aggregation");
    }

    let threshold = (min_success_pct * vars.len() as f64) as usize;
    let percentile: Vec<usize> = hist
        .iter()
        .map(|h| {
            let mut sum = 0;
            for (j, count) in h.iter().enumerate() {
                sum += count;
                if sum >= threshold {
                    return j + 1;
                }
            }
            max_blocks + 1
        })
        .collect();
    debug_assert!(percentile.windows(2).all(|w| w[0] <= w[1]));

    (0..max_blocks)
        .map(|i| {
            let idx = percentile.partition_point(|&p| p < i + 2);
            if idx > 0 {
                fee_strata[idx - 1]
            } else {
                -1
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IndBlockSource, MultiTxSource, Tx, UniTxSource};

    fn fixture_mempool() -> Vec<Tx> {
        // A deterministic backlog skewed toward low fee rates.
        (0..400)
            .map(|i| Tx {
                fee_rate: 5000 + 211 * (i % 97),
                size: 400 + 37 * (i % 29),
                parents: Vec::new(),
            })
            .collect()
    }

    fn fixture_sim(tx_seed: u64, blk_seed: u64) -> Sim {
        let txsource = Box::new(MultiTxSource::new(
            vec![20000, 12000, 9000, 6000],
            vec![250, 400, 600, 900],
            vec![3.0, 3.0, 2.0, 2.0],
            0.08,
            tx_seed,
        ));
        let blocksource = Box::new(IndBlockSource::new(
            vec![5000, 6000, 8000],
            vec![60_000, 80_000, 100_000],
            1.0 / 600.0,
            blk_seed,
        ));
        Sim::new(txsource, blocksource, fixture_mempool())
    }

    fn cfg() -> TransientConfig {
        TransientConfig {
            max_block_confirms: 18,
            min_success_pct: 0.9,
            num_iters: 400,
            parallelism: 4,
            lowest_fee_rate: 5000,
        }
    }

    #[test]
    fn deterministic_across_runs() {
        let (ts1, rx1) = TransientSim::start(fixture_sim(101, 202), cfg());
        let r1 = rx1.blocking_recv().unwrap();
        ts1.stop();

        let (ts2, rx2) = TransientSim::start(fixture_sim(101, 202), cfg());
        let r2 = rx2.blocking_recv().unwrap();
        ts2.stop();

        assert_eq!(r1, r2);
        assert_eq!(r1.len(), 18);
    }

    #[test]
    fn result_is_non_increasing() {
        let (ts, rx) = TransientSim::start(fixture_sim(7, 8), cfg());
        let r = rx.blocking_recv().unwrap();
        ts.stop();
        for w in r.windows(2) {
            if w[0] >= 0 && w[1] >= 0 {
                assert!(w[0] >= w[1], "{:?}", r);
            }
        }
        // The horizon is long enough for the floor stratum to confirm.
        assert_eq!(*r.last().unwrap(), ts.lowest_fee());
    }

    #[test]
    fn never_mining_strata_yield_sentinels() {
        // Half the blocks include nothing, so short confirmation targets are
        // unattainable at the 90th percentile.
        let txsource = Box::new(UniTxSource::new(vec![20000], vec![250], 0.02, 51));
        let blocksource = Box::new(IndBlockSource::new(
            vec![MAX_FEE_RATE, 1000],
            vec![1_000_000],
            1.0 / 600.0,
            52,
        ));
        let sim = Sim::new(txsource, blocksource, fixture_mempool());
        let mut c = cfg();
        c.lowest_fee_rate = 1000;
        let (ts, rx) = TransientSim::start(sim, c);
        let r = rx.blocking_recv().unwrap();
        ts.stop();
        assert_eq!(r[0], -1);
        assert!(r.iter().any(|&f| f > 0));
    }

    #[test]
    fn stop_yields_no_result() {
        let mut c = cfg();
        c.num_iters = 1_000_000;
        let (ts, mut rx) = TransientSim::start(fixture_sim(61, 62), c);
        std::thread::sleep(Duration::from_millis(50));
        ts.stop();
        assert!(rx.try_recv().is_err());
        // Stop is idempotent.
        ts.stop();
    }

    #[test]
    fn floor_clips_the_result() {
        let mut c = cfg();
        c.lowest_fee_rate = 9000;
        let (ts, rx) = TransientSim::start(fixture_sim(71, 72), c);
        let r = rx.blocking_recv().unwrap();
        ts.stop();
        for &f in &r {
            assert!(f == -1 || f >= 9000);
        }
    }
}
