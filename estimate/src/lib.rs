//! Estimation of the simulation source models ([`sim::TxSource`] /
//! [`sim::BlockSource`]) from observed mempool transactions and block
//! statistics.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use sim::{FeeRate, TxSize};

mod indblock;
mod multitx;
mod sfr;
mod unitx;

pub use indblock::{block_source, IndBlockSourceConfig};
pub use multitx::{weighted_tx_source, MultiTxSourceConfig};
pub use sfr::{stranding_fee_rate, SfrTx};
pub use unitx::{round_random, UniTxSourceConfig, UniTxSourceEstimator};

/// Difficulty adjustment interval in blocks.
pub const DIFF_ADJ_INTERVAL: i64 = 2016;

/// An observed mempool transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    #[serde(rename = "feerate")]
    pub fee_rate: FeeRate,
    pub size: TxSize,
    /// Unix time in seconds of first observation.
    pub time: i64,
    /// Reserved for arrival-model variants (e.g. replace-by-fee).
    #[serde(default)]
    pub kind: i64,
}

/// Stranding-fee-rate statistics for one block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SfrStat {
    pub sfr: FeeRate,
    /// In-block txs with fee rate at or above the SFR.
    pub ak: i64,
    /// All txs with fee rate at or above the SFR.
    pub an: i64,
    /// Out-of-block txs with fee rate below the SFR.
    pub bk: i64,
    /// All txs with fee rate below the SFR.
    pub bn: i64,
}

impl std::fmt::Display for SfrStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} SFR, {}/{} AKN, {}/{} BKN",
            self.sfr, self.ak, self.an, self.bk, self.bn
        )
    }
}

/// Per-block observation record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlockStat {
    pub height: i64,
    /// Virtual block size in bytes.
    pub size: i64,
    #[serde(rename = "sfrstat")]
    pub sfr_stat: SfrStat,
    /// Mempool size in bytes just prior to block discovery.
    #[serde(rename = "mempoolsize")]
    pub mempool_size: i64,
    /// Mempool size in bytes just after block discovery.
    #[serde(rename = "mempoolsizeremain")]
    pub mempool_size_remain: i64,
    /// Block time as measured locally (not the block timestamp), Unix
    /// seconds.
    pub time: i64,
    /// Expected number of hashes to solve this block (function of nBits).
    #[serde(rename = "numhashes")]
    pub num_hashes: f64,
}

/// Read access to the observed-transaction store. Successive estimator calls
/// use non-decreasing time ranges.
pub trait TxDb: Send + Sync {
    /// All transactions with entry time within `[start, end]`, sorted by
    /// increasing time.
    fn get(&self, start: i64, end: i64) -> anyhow::Result<Vec<Tx>>;
}

/// Read access to the block-stat store.
pub trait BlockStatDb: Send + Sync {
    /// All block stats with height within `[start, end]`, height-sorted.
    fn get(&self, start: i64, end: i64) -> anyhow::Result<Vec<BlockStat>>;
}

#[derive(Error, Debug)]
pub enum EstimateError {
    #[error("tx estimation window was {window}s, should be at least {min_window}s")]
    TxWindow { window: i64, min_window: i64 },

    #[error("block coverage was only {cov:.3}, should be at least {min_cov:.3} over {window} blocks")]
    BlockCoverage { cov: f64, min_cov: f64, window: i64 },

    #[error("too few blocks to estimate a block source")]
    InsufficientBlocks,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl EstimateError {
    /// Whether this is an expected data-sufficiency condition rather than a
    /// fault worth logging loudly.
    pub fn is_insufficient_data(&self) -> bool {
        matches!(
            self,
            EstimateError::TxWindow { .. }
                | EstimateError::BlockCoverage { .. }
                | EstimateError::InsufficientBlocks
        )
    }
}
