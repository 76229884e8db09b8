use anyhow::Result;

use estimate::Tx;

use crate::{itob, StorageError};

/// Observed transactions keyed by `[time BE8 | seq BE8]`; the sequence
/// suffix keeps same-second txs distinct while preserving time order.
pub struct TxStore {
    tree: sled::Tree,
    db: sled::Db,
}

impl TxStore {
    pub(crate) fn new(tree: sled::Tree, db: &sled::Db) -> TxStore {
        TxStore {
            tree,
            db: db.clone(),
        }
    }

    pub fn put(&self, txs: &[Tx]) -> Result<(), StorageError> {
        let mut txs = txs.to_vec();
        txs.sort_unstable_by_key(|tx| (tx.time, tx.size, tx.fee_rate));
        for tx in &txs {
            let mut key = Vec::with_capacity(16);
            key.extend_from_slice(&itob(tx.time));
            key.extend_from_slice(&self.db.generate_id()?.to_be_bytes());
            self.tree.insert(key, bincode::serialize(tx)?)?;
        }
        Ok(())
    }

    /// All txs with time in `[start, end]`, time-sorted.
    pub fn get(&self, start: i64, end: i64) -> Result<Vec<Tx>, StorageError> {
        let lo = [itob(start.max(0)), [0u8; 8]].concat();
        let hi = [itob(end.max(0)), [u8::MAX; 8]].concat();
        let mut txs = Vec::new();
        for item in self.tree.range(lo..=hi) {
            let (_, value) = item?;
            txs.push(bincode::deserialize(&value)?);
        }
        Ok(txs)
    }

    /// Delete all txs with time in `[start, end]`.
    pub fn delete(&self, start: i64, end: i64) -> Result<(), StorageError> {
        let lo = [itob(start.max(0)), [0u8; 8]].concat();
        let hi = [itob(end.max(0)), [u8::MAX; 8]].concat();
        let keys: Vec<_> = self
            .tree
            .range(lo..=hi)
            .keys()
            .collect::<Result<_, _>>()?;
        for key in keys {
            self.tree.remove(key)?;
        }
        Ok(())
    }
}

impl estimate::TxDb for TxStore {
    fn get(&self, start: i64, end: i64) -> Result<Vec<Tx>> {
        Ok(TxStore::get(self, start, end)?)
    }
}

impl collect::TxSink for TxStore {
    fn put(&self, txs: &[Tx]) -> Result<()> {
        Ok(TxStore::put(self, txs)?)
    }
}
