use std::collections::{HashMap, HashSet};

use anyhow::Result;

use predict::{PredictDb, TxPred};

use crate::StorageError;

const KEY_ATTAINED: &[u8] = b"attained";
const KEY_EXCEEDED: &[u8] = b"exceeded";

/// Prediction records keyed by txid, plus the two persisted score vectors
/// (length-prefixed doubles via bincode).
pub struct PredictStore {
    txs: sled::Tree,
    scores: sled::Tree,
}

impl PredictStore {
    pub(crate) fn new(txs: sled::Tree, scores: sled::Tree) -> PredictStore {
        PredictStore { txs, scores }
    }

    fn get_score(&self, key: &[u8]) -> Result<Vec<f64>, StorageError> {
        match self.scores.get(key)? {
            Some(value) => Ok(bincode::deserialize(&value)?),
            None => Ok(Vec::new()),
        }
    }
}

impl PredictDb for PredictStore {
    fn get_txs(&self, txids: &[String]) -> Result<HashMap<String, TxPred>> {
        let mut out = HashMap::new();
        for txid in txids {
            if let Some(value) = self.txs.get(txid.as_bytes()).map_err(StorageError::from)? {
                let pred = bincode::deserialize(&value).map_err(StorageError::from)?;
                out.insert(txid.clone(), pred);
            }
        }
        Ok(out)
    }

    fn put_txs(&self, txs: &HashMap<String, TxPred>) -> Result<()> {
        for (txid, pred) in txs {
            self.txs
                .insert(
                    txid.as_bytes(),
                    bincode::serialize(pred).map_err(StorageError::from)?,
                )
                .map_err(StorageError::from)?;
        }
        Ok(())
    }

    fn get_scores(&self) -> Result<(Vec<f64>, Vec<f64>)> {
        Ok((self.get_score(KEY_ATTAINED)?, self.get_score(KEY_EXCEEDED)?))
    }

    fn put_scores(&self, attained: &[f64], exceeded: &[f64]) -> Result<()> {
        self.scores
            .insert(KEY_ATTAINED, bincode::serialize(attained).map_err(StorageError::from)?)
            .map_err(StorageError::from)?;
        self.scores
            .insert(KEY_EXCEEDED, bincode::serialize(exceeded).map_err(StorageError::from)?)
            .map_err(StorageError::from)?;
        Ok(())
    }

    fn reconcile(&self, txids: &[String]) -> Result<()> {
        let keep: HashSet<&[u8]> = txids.iter().map(|t| t.as_bytes()).collect();
        let mut remove = Vec::new();
        for item in self.txs.iter() {
            let (key, _) = item.map_err(StorageError::from)?;
            if !keep.contains(key.as_ref()) {
                remove.push(key);
            }
        }
        for key in remove {
            self.txs.remove(key).map_err(StorageError::from)?;
        }
        Ok(())
    }
}
