use anyhow::Result;

use estimate::BlockStat;

use crate::{itob, StorageError};

/// Per-block statistics keyed by height.
pub struct BlockStatStore {
    tree: sled::Tree,
}

impl BlockStatStore {
    pub(crate) fn new(tree: sled::Tree) -> BlockStatStore {
        BlockStatStore { tree }
    }

    pub fn put(&self, stats: &[BlockStat]) -> Result<(), StorageError> {
        for stat in stats {
            self.tree.insert(itob(stat.height), bincode::serialize(stat)?)?;
        }
        Ok(())
    }

    /// All stats with height in `[start, end]`, height-sorted.
    pub fn get(&self, start: i64, end: i64) -> Result<Vec<BlockStat>, StorageError> {
        let mut stats = Vec::new();
        for item in self.tree.range(itob(start.max(0))..=itob(end.max(0))) {
            let (_, value) = item?;
            stats.push(bincode::deserialize(&value)?);
        }
        Ok(stats)
    }

    pub fn delete(&self, start: i64, end: i64) -> Result<(), StorageError> {
        let keys: Vec<_> = self
            .tree
            .range(itob(start.max(0))..=itob(end.max(0)))
            .keys()
            .collect::<Result<_, _>>()?;
        for key in keys {
            self.tree.remove(key)?;
        }
        Ok(())
    }
}

impl estimate::BlockStatDb for BlockStatStore {
    fn get(&self, start: i64, end: i64) -> Result<Vec<BlockStat>> {
        Ok(BlockStatStore::get(self, start, end)?)
    }
}

impl collect::BlockStatSink for BlockStatStore {
    fn put(&self, stats: &[BlockStat]) -> Result<()> {
        Ok(BlockStatStore::put(self, stats)?)
    }
}
