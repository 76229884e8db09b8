use estimate::{stranding_fee_rate, BlockStat, SfrTx};
use tracing::info;

use crate::{BlockInfo, MempoolState};

/// Produce a [`BlockStat`] for each block between two mempool snapshots.
///
/// `blocks` must cover exactly the heights `prev.height + 1 ..= curr.height`
/// in order.
pub fn process_blocks(
    prev: &MempoolState,
    curr: &MempoolState,
    blocks: &[BlockInfo],
) -> Vec<BlockStat> {
    assert!(
        curr.height > prev.height,
        "process_blocks: height must have increased"
    );
    let mut prev = prev.clone();

    let mut stats = Vec::with_capacity(blocks.len());
    let mut shortlists = Vec::with_capacity(blocks.len());
    let mut min_lead_times = Vec::with_capacity(blocks.len());
    for block in blocks {
        let mut stat = BlockStat {
            height: block.height,
            size: block.size,
            sfr_stat: Default::default(),
            mempool_size: prev.entries.values().map(|e| e.size).sum(),
            mempool_size_remain: 0,
            time: prev.time,
            num_hashes: block.num_hashes,
        };

        let mut block_txids = block.txids.clone();
        block_txids.sort_unstable();

        // The cutoff approximates the latest time a tx could have entered a
        // miner's template: miners refresh their tx lists at set intervals
        // rather than continuously.
        let mut cutoff = 0i64;
        let mut in_block_size = 0i64;
        let mut shortlist: Vec<(String, SfrTx)> = Vec::new();
        let mut included: Vec<String> = Vec::new();
        for (txid, entry) in &prev.entries {
            let in_block = block_txids.binary_search(txid).is_ok();
            if in_block {
                if entry.time > cutoff {
                    cutoff = entry.time;
                }
                in_block_size += entry.size;
                included.push(txid.clone());
            }
            if !entry.depends.is_empty() || entry.high_priority {
                continue;
            }
            shortlist.push((
                txid.clone(),
                SfrTx {
                    fee_rate: entry.fee_rate,
                    in_block,
                },
            ));
        }
        for txid in included {
            prev.entries.remove(&txid);
        }
        stat.mempool_size_remain = stat.mempool_size - in_block_size;

        // Out-of-block txs observed after the cutoff were not necessarily
        // considered by the miner; drop them from the shortlist.
        shortlist.retain(|(txid, stx)| {
            stx.in_block || prev.entries.get(txid).map(|e| e.time <= cutoff).unwrap_or(true)
        });

        min_lead_times.push(prev.time - cutoff);
        stats.push(stat);
        shortlists.push(shortlist);
    }

    // Conflicts: txs that left the mempool without appearing in any block
    // (removed by a UTXO conflict). They don't belong in SFR calcs.
    let conflicts = prev.sub(curr).entries;
    if !conflicts.is_empty() {
        let conflict_size: i64 = conflicts.values().map(|e| e.size).sum();
        info!(
            "Block {}: {} conflicts ({} bytes) removed",
            prev.height + 1,
            conflicts.len(),
            conflict_size
        );
        for shortlist in &mut shortlists {
            shortlist.retain(|(txid, _)| !conflicts.contains_key(txid));
        }
    }

    for ((stat, shortlist), min_lead_time) in
        stats.iter_mut().zip(shortlists).zip(min_lead_times)
    {
        let mut txs: Vec<SfrTx> = shortlist.into_iter().map(|(_, stx)| stx).collect();
        stat.sfr_stat = stranding_fee_rate(&mut txs, prev.min_fee_rate);
        info!(
            "Block {}: {} S, {} RS, {} MSR, {} MLT, {}, {}",
            stat.height,
            stat.size,
            stat.mempool_size - stat.mempool_size_remain,
            stat.mempool_size_remain,
            min_lead_time,
            stat.sfr_stat,
            printable_tag(blocks.iter().find(|b| b.height == stat.height)),
        );
    }

    stats
}

fn printable_tag(block: Option<&BlockInfo>) -> String {
    let Some(block) = block else {
        return String::new();
    };
    String::from_utf8_lossy(&block.tag)
        .chars()
        .filter(|c| *c != char::REPLACEMENT_CHARACTER && !c.is_control())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MempoolEntry;
    use sim::MAX_FEE_RATE;
    use std::collections::HashMap;

    fn entry(fee_rate: i64, size: i64, time: i64) -> MempoolEntry {
        MempoolEntry {
            size,
            fee_rate,
            time,
            depends: Vec::new(),
            high_priority: false,
        }
    }

    fn make_state(height: i64, time: i64, entries: HashMap<String, MempoolEntry>) -> MempoolState {
        MempoolState {
            height,
            entries,
            time,
            min_fee_rate: 5000,
        }
    }

    fn block(height: i64, txids: &[&str]) -> BlockInfo {
        BlockInfo {
            height,
            size: 100_000,
            txids: txids.iter().map(|s| s.to_string()).collect(),
            num_hashes: 1e20,
            tag: b"/test-miner/".to_vec(),
        }
    }

    #[test]
    fn single_block_stats() {
        let mut entries = HashMap::new();
        // Included: the two highest fee rates.
        entries.insert("a".to_string(), entry(20000, 1000, 50));
        entries.insert("b".to_string(), entry(15000, 2000, 60));
        // Left behind, observed before the cutoff.
        entries.insert("c".to_string(), entry(9000, 3000, 40));
        // Observed after the cutoff; dropped from the shortlist.
        entries.insert("d".to_string(), entry(8000, 4000, 90));
        let prev = make_state(100, 200, entries);

        let mut curr_entries = HashMap::new();
        curr_entries.insert("c".to_string(), entry(9000, 3000, 40));
        curr_entries.insert("d".to_string(), entry(8000, 4000, 90));
        let curr = make_state(101, 260, curr_entries);

        let stats = process_blocks(&prev, &curr, &[block(101, &["a", "b", "coinbase"])]);
        assert_eq!(stats.len(), 1);
        let s = &stats[0];
        assert_eq!(s.height, 101);
        assert_eq!(s.mempool_size, 10_000);
        assert_eq!(s.mempool_size_remain, 7_000);
        assert_eq!(s.time, 200);
        // Shortlist: a(T), b(T), c(F); SFR strands at 15000.
        assert_eq!(s.sfr_stat.sfr, 15000);
        assert_eq!(s.sfr_stat.ak, 2);
        assert_eq!(s.sfr_stat.an, 2);
        assert_eq!(s.sfr_stat.bk, 1);
        assert_eq!(s.sfr_stat.bn, 1);
    }

    #[test]
    fn conflicts_are_stripped() {
        let mut entries = HashMap::new();
        entries.insert("a".to_string(), entry(20000, 1000, 50));
        entries.insert("gone".to_string(), entry(15000, 2000, 40));
        let prev = make_state(100, 200, entries);
        // "gone" vanished without being mined: a conflict.
        let curr = make_state(101, 260, HashMap::new());

        let stats = process_blocks(&prev, &curr, &[block(101, &["a"])]);
        // Only "a" remains in the shortlist: all in-block, SFR smooths to
        // the relay fee.
        assert_eq!(stats[0].sfr_stat.sfr, 5000);
        assert_eq!(stats[0].sfr_stat.an, 1);
        assert_eq!(stats[0].sfr_stat.ak, 1);
    }

    #[test]
    fn deps_and_priority_excluded_from_shortlist() {
        let mut entries = HashMap::new();
        entries.insert("a".to_string(), entry(20000, 1000, 50));
        let mut dep = entry(18000, 500, 50);
        dep.depends = vec!["a".to_string()];
        entries.insert("dep".to_string(), dep);
        let mut hp = entry(17000, 500, 50);
        hp.high_priority = true;
        entries.insert("hp".to_string(), hp);
        let prev = make_state(100, 200, entries.clone());
        entries.remove("a");
        let curr = make_state(101, 260, entries);

        let stats = process_blocks(&prev, &curr, &[block(101, &["a"])]);
        assert_eq!(stats[0].sfr_stat.an + stats[0].sfr_stat.bn, 1);
    }

    #[test]
    fn empty_shortlist_yields_max_sfr() {
        let prev = make_state(100, 200, HashMap::new());
        let curr = make_state(101, 260, HashMap::new());
        let stats = process_blocks(&prev, &curr, &[block(101, &[])]);
        assert_eq!(stats[0].sfr_stat.sfr, MAX_FEE_RATE);
        assert_eq!(stats[0].mempool_size, 0);
    }

    #[test]
    fn multiple_blocks_in_one_poll() {
        let mut entries = HashMap::new();
        entries.insert("a".to_string(), entry(20000, 1000, 50));
        entries.insert("b".to_string(), entry(15000, 2000, 50));
        let prev = make_state(100, 200, entries);
        let curr = make_state(102, 260, HashMap::new());

        let stats = process_blocks(
            &prev,
            &curr,
            &[block(101, &["a"]), block(102, &["b"])],
        );
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].mempool_size, 3000);
        assert_eq!(stats[0].mempool_size_remain, 2000);
        assert_eq!(stats[1].mempool_size, 2000);
        assert_eq!(stats[1].mempool_size_remain, 0);
    }

    #[test]
    #[should_panic(expected = "height must have increased")]
    fn same_height_panics() {
        let prev = make_state(100, 200, HashMap::new());
        let curr = make_state(100, 260, HashMap::new());
        process_blocks(&prev, &curr, &[]);
    }
}
