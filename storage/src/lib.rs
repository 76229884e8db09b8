//! sled-backed persistence for observed transactions, block statistics, and
//! prediction records.
//!
//! One database, one named tree per concern. Range-scanned keys are
//! fixed-width 8-byte big-endian integers so lexicographic key order matches
//! numeric order.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

mod blockstat;
mod error;
mod predictdb;
mod tx;

pub use blockstat::BlockStatStore;
pub use error::StorageError;
pub use predictdb::PredictStore;
pub use tx::TxStore;

const TREE_TXS: &str = "txs";
const TREE_BLOCK_STATS: &str = "blockstats";
const TREE_PREDICT_TXS: &str = "predict_txs";
const TREE_PREDICT_SCORES: &str = "predict_scores";

/// The application database; hands out the per-concern store views.
pub struct Database {
    db: sled::Db,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Database> {
        info!("opening database at {}", path.as_ref().display());
        let db = sled::open(path).context("failed to open database")?;
        Ok(Database { db })
    }

    pub fn tx_store(&self) -> Result<TxStore> {
        Ok(TxStore::new(self.db.open_tree(TREE_TXS)?, &self.db))
    }

    pub fn block_stat_store(&self) -> Result<BlockStatStore> {
        Ok(BlockStatStore::new(self.db.open_tree(TREE_BLOCK_STATS)?))
    }

    pub fn predict_store(&self) -> Result<PredictStore> {
        Ok(PredictStore::new(
            self.db.open_tree(TREE_PREDICT_TXS)?,
            self.db.open_tree(TREE_PREDICT_SCORES)?,
        ))
    }

    /// Flush all trees to disk; called on shutdown.
    pub fn close(&self) -> Result<()> {
        self.db.flush().context("database flush")?;
        Ok(())
    }
}

/// 8-byte big-endian key encoding. Inputs must be non-negative.
pub(crate) fn itob(v: i64) -> [u8; 8] {
    (v as u64).to_be_bytes()
}
