//! Stranding fee rate calculations.

use sim::{FeeRate, MAX_FEE_RATE};

use crate::SfrStat;

/// A mempool transaction labeled with its block-inclusion outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SfrTx {
    pub fee_rate: FeeRate,
    pub in_block: bool,
}

/// Compute the stranding fee rate of a block from the in-block/out-of-block
/// mix of eligible mempool transactions.
///
/// Every input must have fee rate at least `min_relay_fee`; callers
/// pre-filter, and a violation is a programming error. Empty input yields
/// `MAX_FEE_RATE` with zeroed counters.
pub fn stranding_fee_rate(txs: &mut [SfrTx], min_relay_fee: FeeRate) -> SfrStat {
    if txs.is_empty() {
        return SfrStat {
            sfr: MAX_FEE_RATE,
            ..SfrStat::default()
        };
    }

    txs.sort_unstable_by(|a, b| b.fee_rate.cmp(&a.fee_rate));
    assert!(
        txs[txs.len() - 1].fee_rate >= min_relay_fee,
        "stranding fee rate input below min relay fee"
    );

    let mut k: i64 = 0;
    let mut max_k: i64 = 0;
    let mut sfr = MAX_FEE_RATE;
    for (i, tx) in txs.iter().enumerate() {
        if tx.in_block {
            k += 1;
        } else {
            k -= 1;
        }

        // Only consider a candidate after the last tx of a fee-rate
        // equivalence class.
        if i < txs.len() - 1 && txs[i + 1].fee_rate == tx.fee_rate {
            continue;
        }

        if k > max_k {
            max_k = k;
            sfr = tx.fee_rate;
        }
    }

    if sfr == txs[txs.len() - 1].fee_rate {
        // The SFR landed on the lowest observed fee rate; pin it to the
        // relay floor for a smoother series.
        sfr = min_relay_fee;
    }

    let (ak, an, bk, bn) = abkn(txs, sfr);
    SfrStat { sfr, ak, an, bk, bn }
}

/// The above/below K/N counters at a given stranding fee rate.
fn abkn(txs: &[SfrTx], sfr: FeeRate) -> (i64, i64, i64, i64) {
    let (mut ak, mut an, mut bk, mut bn) = (0, 0, 0, 0);
    for tx in txs {
        if tx.fee_rate >= sfr {
            an += 1;
            if tx.in_block {
                ak += 1;
            }
        } else {
            bn += 1;
            if !tx.in_block {
                bk += 1;
            }
        }
    }
    (ak, an, bk, bn)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(fee_rate: FeeRate, in_block: bool) -> SfrTx {
        SfrTx { fee_rate, in_block }
    }

    #[test]
    fn empty_input_yields_max() {
        let stat = stranding_fee_rate(&mut [], 5000);
        assert_eq!(stat.sfr, MAX_FEE_RATE);
        assert_eq!((stat.ak, stat.an, stat.bk, stat.bn), (0, 0, 0, 0));
    }

    #[test]
    fn replicated_mixed_strata() {
        let mut txs = Vec::new();
        for _ in 0..10 {
            txs.push(tx(11000, true));
            txs.push(tx(10000, true));
            txs.push(tx(10000, false));
            txs.push(tx(9999, false));
            txs.push(tx(9999, false));
        }
        let stat = stranding_fee_rate(&mut txs, 5000);
        assert_eq!(stat.sfr, 11000);
        assert_eq!(stat.ak, 10);
        assert_eq!(stat.an, 10);
        assert_eq!(stat.bk, 30);
        assert_eq!(stat.bn, 40);
    }

    #[test]
    fn clean_strand_boundary() {
        let mut txs = vec![
            tx(20000, true),
            tx(15000, true),
            tx(10000, false),
            tx(8000, false),
        ];
        let stat = stranding_fee_rate(&mut txs, 5000);
        assert_eq!(stat.sfr, 15000);
        assert_eq!((stat.ak, stat.an, stat.bk, stat.bn), (2, 2, 2, 2));
    }

    #[test]
    fn lowest_rate_smooths_to_relay_fee() {
        let mut txs = vec![tx(9000, true), tx(9000, true)];
        let stat = stranding_fee_rate(&mut txs, 5000);
        assert_eq!(stat.sfr, 5000);
        assert_eq!((stat.ak, stat.an, stat.bk, stat.bn), (2, 2, 0, 0));
    }

    #[test]
    fn counter_sum_covers_all_inputs() {
        let mut txs: Vec<SfrTx> = (0..200)
            .map(|i| tx(5000 + (i * 37) % 9000, i % 3 != 0))
            .collect();
        let n = txs.len() as i64;
        let stat = stranding_fee_rate(&mut txs, 5000);
        assert_eq!(stat.an + stat.bn, n);
        assert!(stat.ak <= stat.an && stat.bk <= stat.bn);
    }

    #[test]
    #[should_panic(expected = "below min relay fee")]
    fn input_below_relay_fee_panics() {
        let mut txs = vec![tx(4000, true)];
        stranding_fee_rate(&mut txs, 5000);
    }
}
