use serde::{Deserialize, Serialize};

use sim::{FeeRate, MultiTxSource, TxSize};

use crate::{EstimateError, TxDb};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiTxSourceConfig {
    #[serde(rename = "minwindow")]
    pub min_window: i64,
    #[serde(rename = "maxwindow")]
    pub max_window: i64,
    /// Exponential-decay half-life in seconds.
    pub halflife: i64,
    /// Cap on the number of retained sample txs (the most recent are kept).
    #[serde(rename = "maxtxs")]
    pub max_txs: usize,
}

impl Default for MultiTxSourceConfig {
    fn default() -> Self {
        MultiTxSourceConfig {
            min_window: 600,
            max_window: 10800,
            halflife: 3600,
            max_txs: 10000,
        }
    }
}

/// Fit a weighted tx source over the observation window ending at `t`.
/// Unlike the reservoir estimator this is stateless: each observed tx is
/// weighted by its age-decayed contribution.
pub fn weighted_tx_source(
    t: i64,
    cfg: &MultiTxSourceConfig,
    db: &dyn TxDb,
    seed: u64,
) -> Result<MultiTxSource, EstimateError> {
    let txs = db.get(t - cfg.max_window, t)?;
    if txs.is_empty() {
        return Err(EstimateError::TxWindow {
            window: 0,
            min_window: cfg.min_window,
        });
    }

    let window = t - txs[0].time;
    if window < cfg.min_window {
        return Err(EstimateError::TxWindow {
            window,
            min_window: cfg.min_window,
        });
    }

    let a = 0.5f64.powf(1.0 / cfg.halflife as f64);
    let weights: Vec<f64> = txs.iter().map(|tx| a.powf((t - tx.time) as f64)).collect();
    let r: f64 = weights.iter().sum();
    let txrate = r * a.ln() / (a.powf(window as f64) - 1.0);

    let cutoff = txs.len().saturating_sub(cfg.max_txs);
    let fee_rates: Vec<FeeRate> = txs[cutoff..].iter().map(|tx| tx.fee_rate).collect();
    let sizes: Vec<TxSize> = txs[cutoff..].iter().map(|tx| tx.size).collect();
    let weights = weights[cutoff..].to_vec();

    Ok(MultiTxSource::new(fee_rates, sizes, weights, txrate, seed))
}
