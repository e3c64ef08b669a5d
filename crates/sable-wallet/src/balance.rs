//! Balance view: read-only aggregation over the ledger index.
//!
//! No state of its own — every query recomputes from the ledger under the
//! engine's lock, with per-record amount legs served from the ledger's
//! version-keyed caches.

use std::collections::HashSet;

use sable_core::constants::{COINBASE_MATURITY, LOCKTIME_THRESHOLD, SEQUENCE_FINAL};
use sable_core::traits::ChainOracle;
use sable_core::types::{Hash256, OutPoint, Transaction};

use crate::ledger::{LedgerIndex, Ownership, TxRecord};

/// Aggregated wallet balance in motes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Balance {
    /// Spendable credit from trusted records.
    pub trusted: u64,
    /// Credit sitting in unconfirmed, not-yet-trusted mempool transactions.
    pub untrusted_pending: u64,
    /// Coinbase credit still short of the maturity depth.
    pub immature: u64,
}

/// Whether the transaction could be mined now.
pub fn is_final(tx: &Transaction, tip_height: u64, now: u64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let cutoff = if tx.lock_time < LOCKTIME_THRESHOLD {
        tip_height + 1
    } else {
        now
    };
    if tx.lock_time < cutoff {
        return true;
    }
    tx.inputs.iter().all(|i| i.sequence == SEQUENCE_FINAL)
}

/// The trust predicate: may this record's outputs back new spends?
///
/// A record is trusted if it is final and confirmed at depth ≥ 1, or if it
/// is an unconfirmed mempool transaction whose inputs all come from this
/// wallet's spendable outputs, with every ancestor recursively passing the
/// same test.
pub fn is_trusted(
    ledger: &LedgerIndex,
    record: &TxRecord,
    chain: &dyn ChainOracle,
    now: u64,
) -> bool {
    let mut trusted_parents = HashSet::new();
    is_trusted_inner(ledger, record, chain, now, &mut trusted_parents)
}

fn is_trusted_inner(
    ledger: &LedgerIndex,
    record: &TxRecord,
    chain: &dyn ChainOracle,
    now: u64,
    trusted_parents: &mut HashSet<Hash256>,
) -> bool {
    if !is_final(&record.tx, chain.tip().height, now) {
        return false;
    }
    let depth = ledger.depth_of(record, chain);
    if depth >= 1 {
        return true;
    }
    if record.is_conflicted() || record.abandoned {
        return false;
    }
    if !record.from_me || !record.in_mempool {
        return false;
    }
    for input in &record.tx.inputs {
        let Some(parent) = ledger.get(&input.previous_output.txid) else {
            return false;
        };
        let Some(prev_out) = parent
            .tx
            .outputs
            .get(input.previous_output.index as usize)
        else {
            return false;
        };
        if ledger.ownership_of(&prev_out.destination) != Some(Ownership::Spendable) {
            return false;
        }
        if trusted_parents.contains(&parent.txid) {
            continue;
        }
        if !is_trusted_inner(ledger, parent, chain, now, trusted_parents) {
            return false;
        }
        trusted_parents.insert(parent.txid);
    }
    true
}

/// Compute the wallet balance for outputs held with `filter` ownership.
pub fn balance(
    ledger: &LedgerIndex,
    chain: &dyn ChainOracle,
    now: u64,
    filter: Ownership,
) -> Balance {
    let mut result = Balance::default();
    for record in ledger.ordered_history() {
        if record.is_conflicted() || record.abandoned {
            continue;
        }
        let depth = ledger.depth_of(record, chain);
        if record.tx.is_coinbase() {
            if depth == 0 {
                continue;
            }
            if depth < COINBASE_MATURITY {
                result.immature = result
                    .immature
                    .saturating_add(available_credit(ledger, record, chain, filter));
                continue;
            }
        }
        let credit = available_credit(ledger, record, chain, filter);
        if is_trusted(ledger, record, chain, now) {
            result.trusted = result.trusted.saturating_add(credit);
        } else if depth == 0 && record.in_mempool {
            result.untrusted_pending = result.untrusted_pending.saturating_add(credit);
        }
    }
    result
}

/// Credit of `record` from outputs that are owned under `filter` and not
/// spent by any live spender.
fn available_credit(
    ledger: &LedgerIndex,
    record: &TxRecord,
    chain: &dyn ChainOracle,
    filter: Ownership,
) -> u64 {
    let mut total = 0u64;
    for (index, output) in record.tx.outputs.iter().enumerate() {
        if ledger.ownership_of(&output.destination) != Some(filter) {
            continue;
        }
        let outpoint = OutPoint {
            txid: record.txid,
            index: index as u64,
        };
        if !ledger.is_spent(&outpoint, chain) {
            total = total.saturating_add(output.value);
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use sable_core::constants::COIN;

    fn setup() -> (LedgerIndex, MockChain) {
        let mut ledger = LedgerIndex::new();
        ledger.register_destination(dest(1), Ownership::Spendable);
        (ledger, MockChain::new())
    }

    #[test]
    fn confirmed_credit_is_trusted() {
        let (mut ledger, chain) = setup();
        let tx = spend_tx(vec![fake_outpoint(9, 0)], vec![(5 * COIN, dest(1))]);
        let block = chain.add_block(1_000);
        ledger
            .sync_from_chain(tx, Some((block, 0)), &chain, 1_000)
            .unwrap();

        let b = balance(&ledger, &chain, 2_000, Ownership::Spendable);
        assert_eq!(b.trusted, 5 * COIN);
        assert_eq!(b.untrusted_pending, 0);
        assert_eq!(b.immature, 0);
    }

    #[test]
    fn foreign_unconfirmed_is_pending_not_trusted() {
        let (mut ledger, chain) = setup();
        let tx = spend_tx(vec![fake_outpoint(9, 0)], vec![(5 * COIN, dest(1))]);
        let txid = tx.txid().unwrap();
        ledger.sync_from_chain(tx, None, &chain, 1_000).unwrap();
        ledger.set_mempool(&txid, true);

        let b = balance(&ledger, &chain, 2_000, Ownership::Spendable);
        assert_eq!(b.trusted, 0);
        assert_eq!(b.untrusted_pending, 5 * COIN);
    }

    #[test]
    fn self_originated_unconfirmed_chain_is_trusted() {
        let (mut ledger, chain) = setup();
        // Confirmed funding owned by the wallet.
        let funding = spend_tx(vec![fake_outpoint(9, 0)], vec![(5 * COIN, dest(1))]);
        let funding_id = funding.txid().unwrap();
        let block = chain.add_block(1_000);
        ledger
            .sync_from_chain(funding, Some((block, 0)), &chain, 1_000)
            .unwrap();

        // Unconfirmed self-spend back to ourselves, in the mempool.
        let respend = spend_tx(
            vec![OutPoint { txid: funding_id, index: 0 }],
            vec![(5 * COIN - 1_000, dest(1))],
        );
        let respend_id = respend.txid().unwrap();
        ledger.sync_from_chain(respend, None, &chain, 1_100).unwrap();
        ledger.set_mempool(&respend_id, true);

        let rec = ledger.get(&respend_id).unwrap();
        assert!(is_trusted(&ledger, rec, &chain, 2_000));

        let b = balance(&ledger, &chain, 2_000, Ownership::Spendable);
        // Funding output is spent; only the respend output counts.
        assert_eq!(b.trusted, 5 * COIN - 1_000);
        assert_eq!(b.untrusted_pending, 0);
    }

    #[test]
    fn self_spend_not_in_mempool_is_untrusted() {
        let (mut ledger, chain) = setup();
        let funding = spend_tx(vec![fake_outpoint(9, 0)], vec![(5 * COIN, dest(1))]);
        let funding_id = funding.txid().unwrap();
        let block = chain.add_block(1_000);
        ledger
            .sync_from_chain(funding, Some((block, 0)), &chain, 1_000)
            .unwrap();

        let respend = spend_tx(
            vec![OutPoint { txid: funding_id, index: 0 }],
            vec![(5 * COIN - 1_000, dest(1))],
        );
        let respend_id = respend.txid().unwrap();
        ledger.sync_from_chain(respend, None, &chain, 1_100).unwrap();

        let rec = ledger.get(&respend_id).unwrap();
        assert!(!is_trusted(&ledger, rec, &chain, 2_000));
        // Not in the mempool either, so it is not even pending.
        let b = balance(&ledger, &chain, 2_000, Ownership::Spendable);
        assert_eq!(b.trusted, 0);
        assert_eq!(b.untrusted_pending, 0);
    }

    #[test]
    fn immature_coinbase_reported_separately() {
        let (mut ledger, chain) = setup();
        let cb = coinbase_tx(50 * COIN, dest(1), 1);
        let block = chain.add_block(1_000);
        ledger
            .sync_from_chain(cb, Some((block, 0)), &chain, 1_000)
            .unwrap();

        let b = balance(&ledger, &chain, 2_000, Ownership::Spendable);
        assert_eq!(b.trusted, 0);
        assert_eq!(b.immature, 50 * COIN);

        // Matures after enough blocks.
        chain.mine(COINBASE_MATURITY, 1_001);
        let b = balance(&ledger, &chain, 2_000, Ownership::Spendable);
        assert_eq!(b.trusted, 50 * COIN);
        assert_eq!(b.immature, 0);
    }

    #[test]
    fn conflicted_and_abandoned_excluded() {
        let (mut ledger, chain) = setup();
        let tx = spend_tx(vec![fake_outpoint(9, 0)], vec![(5 * COIN, dest(1))]);
        let txid = tx.txid().unwrap();
        ledger.sync_from_chain(tx, None, &chain, 1_000).unwrap();

        ledger.abandon(&txid, &chain).unwrap();
        let b = balance(&ledger, &chain, 2_000, Ownership::Spendable);
        assert_eq!(b.trusted + b.untrusted_pending + b.immature, 0);
    }

    #[test]
    fn watch_only_filter_separates_totals() {
        let (mut ledger, chain) = setup();
        ledger.register_destination(dest(7), Ownership::WatchOnly);

        let tx = spend_tx(
            vec![fake_outpoint(9, 0)],
            vec![(3 * COIN, dest(1)), (2 * COIN, dest(7))],
        );
        let block = chain.add_block(1_000);
        ledger
            .sync_from_chain(tx, Some((block, 0)), &chain, 1_000)
            .unwrap();

        let spendable = balance(&ledger, &chain, 2_000, Ownership::Spendable);
        let watch = balance(&ledger, &chain, 2_000, Ownership::WatchOnly);
        assert_eq!(spendable.trusted, 3 * COIN);
        assert_eq!(watch.trusted, 2 * COIN);
    }

    #[test]
    fn finality_rules() {
        let tx = spend_tx(vec![fake_outpoint(1, 0)], vec![(COIN, dest(1))]);
        assert!(is_final(&tx, 100, 1_000));

        let mut locked = tx.clone();
        locked.lock_time = 102; // beyond next height
        assert!(!is_final(&locked, 100, 1_000));
        locked.lock_time = 101; // mineable at next height
        assert!(is_final(&locked, 100, 1_000));

        let mut time_locked = tx.clone();
        time_locked.lock_time = LOCKTIME_THRESHOLD + 500;
        assert!(!is_final(&time_locked, 100, LOCKTIME_THRESHOLD + 100));
        assert!(is_final(&time_locked, 100, LOCKTIME_THRESHOLD + 501));

        // Final sequences disable the lock.
        let mut final_seq = tx;
        final_seq.lock_time = 9_999;
        for input in &mut final_seq.inputs {
            input.sequence = SEQUENCE_FINAL;
        }
        assert!(is_final(&final_seq, 100, 1_000));
    }
}
