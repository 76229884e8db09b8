use std::collections::HashMap;
use std::fmt;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use sim::{FeeRate, TxRateFn, TxSize};

/// An observed mempool transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolEntry {
    pub size: TxSize,
    /// Fee rate in satoshis per kB, precomputed at decode time.
    #[serde(rename = "feerate")]
    pub fee_rate: FeeRate,
    /// Unix time in seconds of first observation.
    pub time: i64,
    /// Txids of in-mempool parents.
    #[serde(default)]
    pub depends: Vec<String>,
    /// Legacy priority-inclusion flag; such txs are excluded from fee
    /// estimation.
    #[serde(default)]
    pub high_priority: bool,
}

/// A snapshot of the mempool at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MempoolState {
    pub height: i64,
    pub entries: HashMap<String, MempoolEntry>,
    /// Observation time, Unix seconds.
    pub time: i64,
    /// The node's minimum relay fee rate.
    #[serde(rename = "minfeerate")]
    pub min_fee_rate: FeeRate,
}

/// Entries present in one state but not another.
#[derive(Debug, Clone)]
pub struct MempoolStateDiff {
    pub height: i64,
    pub entries: HashMap<String, MempoolEntry>,
    pub time: i64,
}

impl MempoolState {
    /// The entries in `self` that are not in `other`.
    pub fn sub(&self, other: &MempoolState) -> MempoolStateDiff {
        let entries = self
            .entries
            .iter()
            .filter(|(txid, _)| !other.entries.contains_key(*txid))
            .map(|(txid, entry)| (txid.clone(), entry.clone()))
            .collect();
        MempoolStateDiff {
            height: self.height - other.height,
            entries,
            time: self.time - other.time,
        }
    }

    /// Cumulative mempool bytes with respect to fee rate.
    pub fn size_fn(&self) -> TxRateFn {
        let mut m: std::collections::BTreeMap<FeeRate, f64> = std::collections::BTreeMap::new();
        for entry in self.entries.values() {
            *m.entry(entry.fee_rate).or_default() += entry.size as f64;
        }
        let x: Vec<f64> = m.keys().map(|&k| k as f64).collect();
        let mut y = vec![0.0; x.len()];
        let mut sum = 0.0;
        for (i, (_, bytes)) in m.iter().enumerate().rev() {
            sum += bytes;
            y[i] = sum;
        }
        TxRateFn::new(x, y)
    }
}

impl fmt::Display for MempoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MempoolState{{height: {}, entries: {}, minfeerate: {}}}",
            self.height,
            self.entries.len(),
            self.min_fee_rate
        )
    }
}

/// Convert observed mempool entries into the flat, index-linked form the
/// simulator expects, checking that the mempool is closed (every listed
/// parent is itself present).
///
/// Entries are laid out in txid order so the result is canonical.
pub fn simify_mempool(entries: &HashMap<String, MempoolEntry>) -> Result<Vec<sim::Tx>> {
    let mut txids: Vec<&String> = entries.keys().collect();
    txids.sort_unstable();
    let index: HashMap<&str, usize> = txids
        .iter()
        .enumerate()
        .map(|(i, txid)| (txid.as_str(), i))
        .collect();

    let mut txs = Vec::with_capacity(txids.len());
    for txid in &txids {
        let entry = &entries[*txid];
        let mut parents = Vec::with_capacity(entry.depends.len());
        for parent in &entry.depends {
            match index.get(parent.as_str()) {
                Some(&p) => parents.push(p),
                None => bail!("mempool not closed"),
            }
        }
        txs.push(sim::Tx {
            fee_rate: entry.fee_rate,
            size: entry.size,
            parents,
        });
    }
    Ok(txs)
}

/// Remove entries with fee rate below `thresh`, along with all their
/// descendants.
pub fn prune_low_fee(entries: &mut HashMap<String, MempoolEntry>, thresh: FeeRate) {
    let mut child_map: HashMap<String, Vec<String>> = HashMap::new();
    for (txid, entry) in entries.iter() {
        for d in &entry.depends {
            child_map.entry(d.clone()).or_default().push(txid.clone());
        }
    }

    let roots: Vec<String> = entries
        .iter()
        .filter(|(_, e)| e.fee_rate < thresh)
        .map(|(txid, _)| txid.clone())
        .collect();
    let mut stack = roots;
    while let Some(txid) = stack.pop() {
        if let Some(children) = child_map.remove(&txid) {
            stack.extend(children);
        }
        entries.remove(&txid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim::MonotonicFn;

    fn entry(fee_rate: FeeRate, size: TxSize, time: i64) -> MempoolEntry {
        MempoolEntry {
            size,
            fee_rate,
            time,
            depends: Vec::new(),
            high_priority: false,
        }
    }

    fn entry_with_deps(
        fee_rate: FeeRate,
        size: TxSize,
        depends: &[&str],
    ) -> MempoolEntry {
        MempoolEntry {
            size,
            fee_rate,
            time: 0,
            depends: depends.iter().map(|s| s.to_string()).collect(),
            high_priority: false,
        }
    }

    fn state(height: i64, txids: &[&str]) -> MempoolState {
        MempoolState {
            height,
            entries: txids
                .iter()
                .map(|txid| (txid.to_string(), entry(10000, 500, 0)))
                .collect(),
            time: 100,
            min_fee_rate: 5000,
        }
    }

    #[test]
    fn sub_returns_new_entries() {
        let old = state(100, &["a", "b"]);
        let new = state(101, &["a", "b", "c", "d"]);
        let diff = new.sub(&old);
        assert_eq!(diff.height, 1);
        let mut txids: Vec<&String> = diff.entries.keys().collect();
        txids.sort();
        assert_eq!(txids, ["c", "d"]);
    }

    #[test]
    fn size_fn_accumulates_bytes() {
        let mut s = state(100, &[]);
        s.entries.insert("a".into(), entry(10000, 500, 0));
        s.entries.insert("b".into(), entry(10000, 700, 0));
        s.entries.insert("c".into(), entry(20000, 250, 0));
        let f = s.size_fn();
        assert_eq!(f.eval(10000.0), 1450.0);
        assert_eq!(f.eval(10001.0), 250.0);
        assert_eq!(f.eval(20001.0), 0.0);
    }

    #[test]
    fn simify_links_parents_by_index() {
        let mut entries = HashMap::new();
        entries.insert("p".to_string(), entry_with_deps(8000, 400, &[]));
        entries.insert("c1".to_string(), entry_with_deps(12000, 300, &["p"]));
        entries.insert("c2".to_string(), entry_with_deps(9000, 600, &["p", "c1"]));
        let txs = simify_mempool(&entries).unwrap();
        // Canonical order: c1, c2, p.
        assert_eq!(txs.len(), 3);
        assert_eq!(txs[0].fee_rate, 12000);
        assert_eq!(txs[0].parents, vec![2]);
        assert_eq!(txs[1].fee_rate, 9000);
        assert_eq!(txs[1].parents, vec![2, 0]);
        assert!(txs[2].parents.is_empty());
    }

    #[test]
    fn simify_rejects_open_mempool() {
        let mut entries = HashMap::new();
        entries.insert("c".to_string(), entry_with_deps(9000, 300, &["missing"]));
        assert!(simify_mempool(&entries).is_err());
    }

    #[test]
    fn state_serde_round_trip() {
        let mut s = state(333931, &["a", "b"]);
        s.entries.get_mut("a").unwrap().depends = vec!["b".to_string()];
        let json = serde_json::to_string(&s).unwrap();
        let back: MempoolState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.height, s.height);
        assert_eq!(back.time, s.time);
        assert_eq!(back.min_fee_rate, s.min_fee_rate);
        assert_eq!(back.entries, s.entries);
    }

    #[test]
    fn prune_cascades_to_descendants() {
        let mut entries = HashMap::new();
        entries.insert("low".to_string(), entry_with_deps(1000, 400, &[]));
        entries.insert("child".to_string(), entry_with_deps(50000, 300, &["low"]));
        entries.insert(
            "grandchild".to_string(),
            entry_with_deps(60000, 300, &["child"]),
        );
        entries.insert("ok".to_string(), entry_with_deps(9000, 500, &[]));
        prune_low_fee(&mut entries, 5000);
        let mut left: Vec<&String> = entries.keys().collect();
        left.sort();
        assert_eq!(left, ["ok"]);
    }
}
