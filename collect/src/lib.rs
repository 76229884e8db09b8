//! Collection of mempool and block data from the Bitcoin network, feeding
//! the model estimators in the `estimate` crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod collector;
pub mod corerpc;
mod process_block;
mod state;

pub use collector::{Collector, CollectorChannels, CollectorConfig};
pub use process_block::process_blocks;
pub use state::{
    prune_low_fee, simify_mempool, MempoolEntry, MempoolState, MempoolStateDiff,
};

/// A block as observed from the node, reduced to the fields the pipeline
/// needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockInfo {
    pub height: i64,
    /// Virtual size in bytes.
    pub size: i64,
    pub txids: Vec<String>,
    /// Expected number of hashes to solve this block.
    pub num_hashes: f64,
    /// Coinbase scriptsig bytes, when the source provides them.
    #[serde(default)]
    pub tag: Vec<u8>,
}

/// Produces a snapshot of the node's mempool.
#[async_trait]
pub trait MempoolStateGetter: Send + Sync {
    async fn get_state(&self) -> anyhow::Result<MempoolState>;
}

/// Fetches a block by height.
#[async_trait]
pub trait BlockGetter: Send + Sync {
    async fn get_block(&self, height: i64) -> anyhow::Result<BlockInfo>;
}

/// Write access to the observed-transaction store.
pub trait TxSink: Send + Sync {
    fn put(&self, txs: &[estimate::Tx]) -> anyhow::Result<()>;
}

/// Write access to the block-stat store.
pub trait BlockStatSink: Send + Sync {
    fn put(&self, stats: &[estimate::BlockStat]) -> anyhow::Result<()>;
}
