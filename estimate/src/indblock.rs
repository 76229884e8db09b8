use serde::{Deserialize, Serialize};

use sim::{FeeRate, IndBlockSource, TxSize};

use crate::{BlockStat, BlockStatDb, EstimateError, DIFF_ADJ_INTERVAL};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct IndBlockSourceConfig {
    /// Estimation window in blocks.
    pub window: i64,
    /// Minimum fraction of the window that must have recorded stats.
    #[serde(rename = "mincov")]
    pub min_cov: f64,
    /// Minimum inter-block gap in seconds for a block pair to contribute
    /// samples; filters rapid hash races.
    #[serde(rename = "guardinterval")]
    pub guard_interval: i64,
    /// Fraction of the window used for extremal sampling of miner policy.
    #[serde(rename = "tailpct")]
    pub tail_pct: f64,
}

impl Default for IndBlockSourceConfig {
    fn default() -> Self {
        IndBlockSourceConfig {
            window: 2016,
            min_cov: 0.5,
            guard_interval: 300,
            tail_pct: 0.1,
        }
    }
}

/// Fit a block source from the stats of blocks in
/// `[height - window + 1, height]`.
///
/// Max block sizes are taken from the high tail of mempool inflow (blocks
/// whose backlog grew the most reveal miner size limits); min fee rates from
/// the low tail of pre-block mempool size (blocks mined off a near-empty
/// mempool reveal miner fee floors).
pub fn block_source(
    height: i64,
    cfg: &IndBlockSourceConfig,
    db: &dyn BlockStatDb,
    seed: u64,
) -> Result<IndBlockSource, EstimateError> {
    let stats = db.get(height - cfg.window + 1, height)?;
    let cov = stats.len() as f64 / cfg.window as f64;
    if cov < cfg.min_cov {
        return Err(EstimateError::BlockCoverage {
            cov,
            min_cov: cfg.min_cov,
            window: cfg.window,
        });
    }

    let mut total_hashes = 0.0;
    let mut prev: Option<&BlockStat> = None;
    let mut size_samples: Vec<(i64, i64)> = Vec::new(); // (mempool inflow, block size)
    let mut sfr_samples: Vec<(i64, FeeRate)> = Vec::new(); // (pre-block mempool size, sfr)
    for block in &stats {
        total_hashes += block.num_hashes;
        let Some(p) = prev else {
            prev = Some(block);
            continue;
        };
        if block.height == p.height + 1 {
            if block.time - p.time > cfg.guard_interval {
                size_samples.push((block.mempool_size - p.mempool_size_remain, block.size));
                sfr_samples.push((block.mempool_size, block.sfr_stat.sfr));
            }
        } else {
            // Fill in the hash counts of the missing blocks from whichever
            // neighbor shares their difficulty period. The window is assumed
            // to span at most one adjustment boundary.
            for missing in p.height + 1..block.height {
                if missing / DIFF_ADJ_INTERVAL == p.height / DIFF_ADJ_INTERVAL {
                    total_hashes += p.num_hashes;
                } else {
                    total_hashes += block.num_hashes;
                }
            }
        }
        prev = Some(block);
    }

    if sfr_samples.is_empty() {
        return Err(EstimateError::InsufficientBlocks);
    }
    size_samples.sort_unstable();
    sfr_samples.sort_unstable();
    let tail = (cfg.tail_pct * sfr_samples.len() as f64) as usize + 1;
    let max_block_sizes: Vec<TxSize> = size_samples[size_samples.len() - tail..]
        .iter()
        .map(|&(_, size)| size)
        .collect();
    let min_fee_rates: Vec<FeeRate> = sfr_samples[..tail].iter().map(|&(_, sfr)| sfr).collect();

    let win_start = stats[0].time;
    let win_end = stats[stats.len() - 1].time;
    let hashrate = total_hashes / (win_end - win_start) as f64;
    let blockrate = hashrate / stats[stats.len() - 1].num_hashes;

    Ok(IndBlockSource::new(
        min_fee_rates,
        max_block_sizes,
        blockrate,
        seed,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SfrStat;
    use sim::{BlockSource, MonotonicFn};

    struct MemBlockStatDb {
        stats: Vec<BlockStat>,
    }

    impl BlockStatDb for MemBlockStatDb {
        fn get(&self, start: i64, end: i64) -> anyhow::Result<Vec<BlockStat>> {
            Ok(self
                .stats
                .iter()
                .filter(|b| b.height >= start && b.height <= end)
                .copied()
                .collect())
        }
    }

    fn stat(height: i64, time: i64, sfr: FeeRate, size: i64, inflow: i64) -> BlockStat {
        BlockStat {
            height,
            size,
            sfr_stat: SfrStat {
                sfr,
                ..Default::default()
            },
            // Encode the desired inflow as the gap between the previous
            // remain and this block's pre-mempool size.
            mempool_size: inflow,
            mempool_size_remain: 0,
            time,
            num_hashes: 1e20,
        }
    }

    fn window_db(n: i64) -> MemBlockStatDb {
        let stats = (0..n)
            .map(|i| {
                stat(
                    1000 + i,
                    600 * i,
                    10_000 + 100 * i,
                    900_000 + 1000 * i,
                    400_000 + 1000 * i,
                )
            })
            .collect();
        MemBlockStatDb { stats }
    }

    #[test]
    fn fits_tails_and_block_rate() {
        let db = window_db(100);
        let cfg = IndBlockSourceConfig {
            window: 100,
            min_cov: 0.5,
            guard_interval: 300,
            tail_pct: 0.1,
        };
        let src = block_source(1099, &cfg, &db, 41).unwrap();

        // 99 pairs, tail of 10: the ten highest-inflow pairs carry the ten
        // largest sizes, the ten smallest pre-block mempools the ten lowest
        // SFRs.
        let f = src.rate_fn();
        assert_eq!(f.inverse(1.0), 10_100.0);
        let d = src.describe();
        let sizes = d["maxblocksizes"].as_array().unwrap();
        assert_eq!(sizes.len(), 10);
        assert_eq!(sizes[0].as_i64().unwrap(), 990_000);
        assert_eq!(sizes[9].as_i64().unwrap(), 999_000);
        let fees = d["minfeerates"].as_array().unwrap();
        assert_eq!(fees[0].as_f64().unwrap(), 10_100.0);
        assert_eq!(fees[9].as_f64().unwrap(), 11_000.0);

        // 100 blocks' hashes over the 99 intervals spanned by the window.
        let want = 100.0 / (99.0 * 600.0);
        assert!((src.block_rate() - want).abs() / want < 1e-9);
    }

    #[test]
    fn poor_coverage_is_rejected() {
        let db = window_db(100);
        let cfg = IndBlockSourceConfig {
            window: 2016,
            min_cov: 0.5,
            guard_interval: 300,
            tail_pct: 0.1,
        };
        match block_source(2000, &cfg, &db, 42) {
            Err(EstimateError::BlockCoverage { cov, min_cov, window }) => {
                assert!(cov < min_cov);
                assert_eq!(window, 2016);
            }
            other => panic!("expected BlockCoverage, got {other:?}"),
        }
    }

    #[test]
    fn guard_interval_filters_hash_races() {
        // All gaps are 60s, under the guard interval: no usable pairs.
        let stats = (0..50)
            .map(|i| stat(1000 + i, 60 * i, 10_000, 900_000, 400_000))
            .collect();
        let db = MemBlockStatDb { stats };
        let cfg = IndBlockSourceConfig {
            window: 50,
            min_cov: 0.5,
            guard_interval: 300,
            tail_pct: 0.1,
        };
        assert!(matches!(
            block_source(1049, &cfg, &db, 43),
            Err(EstimateError::InsufficientBlocks)
        ));
    }

    #[test]
    fn missing_blocks_fill_hash_counts() {
        // Heights 1000..1009 and 1015..1019, a 5-block gap. The fill keeps
        // the hash total consistent with a full window.
        let mut stats: Vec<BlockStat> = (0..10)
            .map(|i| stat(1000 + i, 600 * i, 10_000, 900_000, 400_000))
            .collect();
        stats.extend((15..20).map(|i| stat(1000 + i, 600 * i, 10_000, 900_000, 400_000)));
        let db = MemBlockStatDb { stats };
        let cfg = IndBlockSourceConfig {
            window: 20,
            min_cov: 0.5,
            guard_interval: 300,
            tail_pct: 0.1,
        };
        let src = block_source(1019, &cfg, &db, 44).unwrap();
        // 15 observed plus 5 filled blocks over 19 * 600 seconds.
        let want = 20.0 / (19.0 * 600.0);
        assert!((src.block_rate() - want).abs() / want < 1e-9);
    }
}
