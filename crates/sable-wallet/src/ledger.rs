//! The ledger index: authoritative record of every transaction relevant to
//! the wallet's owned outputs.
//!
//! Provides:
//! - O(1) record lookup by txid with insertion-ordered replay
//! - spend-index multimap from outpoint to spending txids (≥2 entries on
//!   the same outpoint signal a conflict)
//! - conflict and abandon propagation over the spend graph
//! - skew-tolerant timestamps for stable history ordering
//! - the candidate scan feeding coin selection
//!
//! Not thread-safe on its own — the engine wraps a [`LedgerIndex`] in a
//! single `Mutex` and holds it for entire operations.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use tracing::{debug, info};

use sable_core::constants::{COINBASE_MATURITY, TIMESTAMP_SKEW_SECS};
use sable_core::traits::{ChainOracle, MempoolOracle};
use sable_core::types::{BlockRef, Destination, Hash256, OutPoint, Transaction};

use crate::balance;
use crate::coin_selection::UtxoCandidate;
use crate::error::WalletError;
use crate::store::StoredRecord;

/// How a record relates to the best chain.
#[derive(
    serde::Serialize, serde::Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum Confirmation {
    /// Not yet in a block; possibly in the mempool.
    Unconfirmed,
    /// Included in `block` at the given position.
    Confirmed {
        /// The containing block.
        block: BlockRef,
        /// Index of the transaction within the block.
        position: u32,
    },
    /// A block on the best chain spends one of this record's inputs.
    Conflicted {
        /// The block whose contents conflict with this record.
        against: BlockRef,
    },
}

/// How the wallet relates to a destination it tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// The wallet holds the key and can spend.
    Spendable,
    /// Tracked for balance reporting only.
    WatchOnly,
}

/// Outcome of an [`upsert`](LedgerIndex::upsert) call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new record was created.
    Inserted,
    /// An existing record absorbed new observable state.
    Updated,
    /// Nothing changed.
    Unchanged,
}

/// Credit/debit legs of a record, valid for one ledger version.
#[derive(Clone, Copy, Debug)]
struct CachedAmounts {
    version: u64,
    credit_spendable: u64,
    credit_watch: u64,
    debit: u64,
}

/// A tracked wallet transaction.
///
/// Owned exclusively by the [`LedgerIndex`]; other components only ever see
/// borrows taken while the engine's lock is held.
#[derive(Debug)]
pub struct TxRecord {
    /// The transaction body.
    pub tx: Transaction,
    /// Precomputed transaction ID.
    pub txid: Hash256,
    /// Chain state of the record.
    pub confirmation: Confirmation,
    /// Insertion order: strictly increasing, assigned once, never reused.
    pub sequence: u64,
    /// Unix time the wallet first observed the transaction.
    pub time_first_seen: u64,
    /// Skew-tolerant history timestamp (see [`LedgerIndex::upsert`]).
    pub smart_time: u64,
    /// Whether the node's mempool currently holds the transaction.
    pub in_mempool: bool,
    /// Explicitly marked as no longer expected to confirm.
    pub abandoned: bool,
    /// Whether any input spends an output owned by this wallet.
    pub from_me: bool,
    /// Free-form cross references, e.g. "replaced-by".
    pub metadata: BTreeMap<String, String>,
    /// Amount legs, recomputed when the ledger version moves.
    cache: Cell<Option<CachedAmounts>>,
}

impl TxRecord {
    /// True if a best-chain block conflicts with this record.
    pub fn is_conflicted(&self) -> bool {
        matches!(self.confirmation, Confirmation::Conflicted { .. })
    }

    /// The containing block, if confirmed.
    pub fn block(&self) -> Option<BlockRef> {
        match self.confirmation {
            Confirmation::Confirmed { block, .. } => Some(block),
            _ => None,
        }
    }
}

/// Metadata key recording the txid of a fee-bumped replacement.
pub const META_REPLACED_BY: &str = "replaced-by";

/// The wallet's transaction index and spend graph.
pub struct LedgerIndex {
    /// Primary storage: txid → record.
    records: HashMap<Hash256, TxRecord>,
    /// Txids in insertion order, for history replay and timestamp scans.
    order: Vec<Hash256>,
    /// Outpoint → txids of every tracked transaction spending it.
    spends: BTreeMap<OutPoint, BTreeSet<Hash256>>,
    /// Destinations the wallet claims, and how.
    owned: HashMap<Destination, Ownership>,
    /// Bumped on every mutation; stale amount caches recompute against it.
    version: u64,
    /// Next insertion sequence to assign.
    next_sequence: u64,
}

impl LedgerIndex {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            order: Vec::new(),
            spends: BTreeMap::new(),
            owned: HashMap::new(),
            version: 0,
            next_sequence: 0,
        }
    }

    /// Claim a destination for this wallet.
    pub fn register_destination(&mut self, destination: Destination, ownership: Ownership) {
        self.owned.insert(destination, ownership);
        self.version += 1;
    }

    /// How the wallet relates to `destination`, if at all.
    pub fn ownership_of(&self, destination: &Destination) -> Option<Ownership> {
        self.owned.get(destination).copied()
    }

    /// Look up a record by txid.
    pub fn get(&self, txid: &Hash256) -> Option<&TxRecord> {
        self.records.get(txid)
    }

    /// Number of tracked records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if no records are tracked.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Current mutation counter.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Records in insertion order.
    pub fn ordered_history(&self) -> impl Iterator<Item = &TxRecord> {
        self.order.iter().map(|id| {
            self.records
                .get(id)
                .expect("ledger order references unknown transaction")
        })
    }

    /// Confirmation depth of a record: blocks from its containing block to
    /// the tip, inclusive. Zero for unconfirmed, conflicted, or records
    /// whose block fell off the best chain.
    pub fn depth_of(&self, record: &TxRecord, chain: &dyn ChainOracle) -> u64 {
        match record.confirmation {
            Confirmation::Confirmed { block, .. } if chain.is_on_best_chain(&block) => {
                chain.tip().height.saturating_sub(block.height) + 1
            }
            _ => 0,
        }
    }

    /// Insert a new record or merge observable fields into an existing one.
    ///
    /// On insert: assigns the insertion sequence, stamps `now` as first-seen,
    /// computes the skew-tolerant history timestamp, and indexes every input
    /// as a spend of its outpoint. On update (`allow_update`): adopts a
    /// changed confirmation state, a newly detected from-me flag, and a
    /// signature-bearing body replacing a stripped one. User metadata is
    /// never overwritten.
    pub fn upsert(
        &mut self,
        tx: Transaction,
        confirmation: Confirmation,
        allow_update: bool,
        chain: &dyn ChainOracle,
        now: u64,
    ) -> Result<UpsertOutcome, WalletError> {
        let txid = tx.txid()?;

        if self.records.contains_key(&txid) {
            if !allow_update {
                return Ok(UpsertOutcome::Unchanged);
            }
            let from_me = self.debits_from_me(&tx);
            let rec = self.records.get_mut(&txid).expect("checked above");
            let mut changed = false;

            // A plain re-observation never demotes a record whose block (or
            // conflicting block) is still on the best chain; only a
            // disconnect does.
            let adopt = match (&rec.confirmation, &confirmation) {
                (current, new) if current == new => false,
                (Confirmation::Confirmed { block, .. }, Confirmation::Unconfirmed) => {
                    !chain.is_on_best_chain(block)
                }
                (Confirmation::Conflicted { against }, Confirmation::Unconfirmed) => {
                    !chain.is_on_best_chain(against)
                }
                _ => true,
            };
            if adopt {
                rec.confirmation = confirmation;
                if let Confirmation::Confirmed { .. } = confirmation {
                    rec.abandoned = false;
                    rec.in_mempool = false;
                }
                changed = true;
            }
            if from_me && !rec.from_me {
                rec.from_me = true;
                changed = true;
            }
            if !rec.tx.has_witnesses() && tx.has_witnesses() {
                rec.tx = tx;
                changed = true;
            }

            if changed {
                self.version += 1;
                debug!(%txid, "updated ledger record");
                return Ok(UpsertOutcome::Updated);
            }
            return Ok(UpsertOutcome::Unchanged);
        }

        let from_me = self.debits_from_me(&tx);
        let smart_time = self.compute_smart_time(&confirmation, now, chain);
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        for input in &tx.inputs {
            if !input.previous_output.is_null() {
                self.spends
                    .entry(input.previous_output)
                    .or_default()
                    .insert(txid);
            }
        }

        self.records.insert(
            txid,
            TxRecord {
                tx,
                txid,
                confirmation,
                sequence,
                time_first_seen: now,
                smart_time,
                in_mempool: false,
                abandoned: false,
                from_me,
                metadata: BTreeMap::new(),
                cache: Cell::new(None),
            },
        );
        self.order.push(txid);
        self.version += 1;
        debug!(%txid, sequence, "inserted ledger record");
        Ok(UpsertOutcome::Inserted)
    }

    /// Entry point for block/mempool notifications.
    ///
    /// Upserts the observation, then — once the new spends are indexed —
    /// marks every other known spender of the same inputs conflicted against
    /// the containing block. Returns the upsert outcome and the records the
    /// conflict sweep touched.
    pub fn sync_from_chain(
        &mut self,
        tx: Transaction,
        block: Option<(BlockRef, u32)>,
        chain: &dyn ChainOracle,
        now: u64,
    ) -> Result<(UpsertOutcome, Vec<Hash256>), WalletError> {
        let txid = tx.txid()?;
        let confirmation = match block {
            Some((block, position)) => Confirmation::Confirmed { block, position },
            None => Confirmation::Unconfirmed,
        };
        let outcome = self.upsert(tx, confirmation, true, chain, now)?;

        let mut touched = Vec::new();
        if let Some((block, _)) = block {
            for other in self.conflicts(&txid) {
                touched.extend(self.mark_conflicted(block, other, chain));
            }
        }
        Ok((outcome, touched))
    }

    /// Whether any live spender of `outpoint` exists: one that is not
    /// conflicted, and is either confirmed or unconfirmed-but-not-abandoned.
    pub fn is_spent(&self, outpoint: &OutPoint, chain: &dyn ChainOracle) -> bool {
        let Some(spenders) = self.spends.get(outpoint) else {
            return false;
        };
        spenders.iter().any(|id| {
            let rec = self
                .records
                .get(id)
                .expect("spend index references unknown transaction");
            if rec.is_conflicted() {
                return false;
            }
            self.depth_of(rec, chain) > 0 || !rec.abandoned
        })
    }

    /// Every other tracked transaction spending any input of `txid`.
    pub fn conflicts(&self, txid: &Hash256) -> BTreeSet<Hash256> {
        let mut result = BTreeSet::new();
        let Some(rec) = self.records.get(txid) else {
            return result;
        };
        for input in &rec.tx.inputs {
            if let Some(spenders) = self.spends.get(&input.previous_output) {
                result.extend(spenders.iter().filter(|id| *id != txid).copied());
            }
        }
        result
    }

    /// Mark `txid` (and, transitively, everything spending its outputs)
    /// conflicted against `against`.
    ///
    /// No-op when the conflicting block is off the best chain or buried no
    /// deeper than the record's own confirmation. Breadth-first with a
    /// visited set, so shared descendants are handled once and the walk
    /// terminates regardless of graph shape. Returns the txids it marked.
    ///
    /// Panics if `txid` is unknown: callers verify existence first, and the
    /// spend index only ever references tracked records.
    pub fn mark_conflicted(
        &mut self,
        against: BlockRef,
        txid: Hash256,
        chain: &dyn ChainOracle,
    ) -> Vec<Hash256> {
        if !chain.is_on_best_chain(&against) {
            return Vec::new();
        }
        let conflict_depth = chain.tip().height.saturating_sub(against.height) + 1;

        assert!(
            self.records.contains_key(&txid),
            "mark_conflicted target {txid} not in ledger"
        );

        let mut marked = Vec::new();
        let mut queue = VecDeque::from([txid]);
        let mut visited = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let rec = self
                .records
                .get(&id)
                .expect("spend index references unknown transaction");
            if conflict_depth <= self.depth_of(rec, chain) {
                continue;
            }
            let children = self.spenders_of_outputs(&id, rec.tx.outputs.len());

            let rec = self.records.get_mut(&id).expect("present above");
            rec.confirmation = Confirmation::Conflicted { against };
            self.version += 1;
            marked.push(id);
            queue.extend(children);
        }
        if !marked.is_empty() {
            info!(%txid, against = %against, count = marked.len(), "marked conflicted");
        }
        marked
    }

    /// Mark an unconfirmed, non-mempool transaction as abandoned, along with
    /// everything unconfirmed that spends its outputs.
    ///
    /// Returns the txids it flagged. Fails without mutating anything if the
    /// transaction is unknown, confirmed, conflicted, or in the mempool.
    pub fn abandon(
        &mut self,
        txid: &Hash256,
        chain: &dyn ChainOracle,
    ) -> Result<Vec<Hash256>, WalletError> {
        let rec = self
            .records
            .get(txid)
            .ok_or(WalletError::TxnNotFound(*txid))?;
        if self.depth_of(rec, chain) > 0 {
            return Err(WalletError::InvalidState(
                "cannot abandon a confirmed transaction".into(),
            ));
        }
        if rec.is_conflicted() {
            return Err(WalletError::InvalidState(
                "cannot abandon a conflicted transaction".into(),
            ));
        }
        if rec.in_mempool {
            return Err(WalletError::InvalidState(
                "cannot abandon a transaction in the mempool".into(),
            ));
        }

        let mut flagged = Vec::new();
        let mut queue = VecDeque::from([*txid]);
        let mut visited = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let rec = self
                .records
                .get(&id)
                .expect("spend index references unknown transaction");
            if rec.abandoned || rec.is_conflicted() || self.depth_of(rec, chain) > 0 {
                continue;
            }
            let children = self.spenders_of_outputs(&id, rec.tx.outputs.len());

            let rec = self.records.get_mut(&id).expect("present above");
            rec.abandoned = true;
            rec.confirmation = Confirmation::Unconfirmed;
            self.version += 1;
            flagged.push(id);
            queue.extend(children);
        }
        info!(%txid, count = flagged.len(), "abandoned transaction tree");
        Ok(flagged)
    }

    /// Update the mempool-membership flag. Returns false if the transaction
    /// is not tracked.
    pub fn set_mempool(&mut self, txid: &Hash256, in_pool: bool) -> bool {
        match self.records.get_mut(txid) {
            Some(rec) => {
                if rec.in_mempool != in_pool {
                    rec.in_mempool = in_pool;
                    self.version += 1;
                }
                true
            }
            None => false,
        }
    }

    /// Record that `old` has been superseded by the fee-bumped `new`.
    ///
    /// Pure bookkeeping: stores a `replaced-by` cross reference. Fails for
    /// unknown or confirmed records.
    pub fn mark_replaced(
        &mut self,
        old: &Hash256,
        new: &Hash256,
        chain: &dyn ChainOracle,
    ) -> Result<(), WalletError> {
        let rec = self.records.get(old).ok_or(WalletError::TxnNotFound(*old))?;
        if self.depth_of(rec, chain) > 0 {
            return Err(WalletError::InvalidState(
                "cannot replace a confirmed transaction".into(),
            ));
        }
        let rec = self.records.get_mut(old).expect("present above");
        rec.metadata
            .insert(META_REPLACED_BY.to_string(), new.to_string());
        self.version += 1;
        debug!(%old, %new, "recorded replacement");
        Ok(())
    }

    /// Credit of `record` toward outputs owned with the given ownership.
    pub fn credit(&self, record: &TxRecord, filter: Ownership) -> u64 {
        let amounts = self.amounts(record);
        match filter {
            Ownership::Spendable => amounts.credit_spendable,
            Ownership::WatchOnly => amounts.credit_watch,
        }
    }

    /// Total value this record drains from outputs the wallet owns.
    pub fn debit(&self, record: &TxRecord) -> u64 {
        self.amounts(record).debit
    }

    /// Scan for unspent owned outputs usable as transaction inputs.
    ///
    /// Skips conflicted, abandoned, immature-coinbase, non-final, and
    /// already-spent outputs. `filter` is an optional extra predicate over
    /// the produced candidates, letting callers narrow the set without
    /// teaching the scan their policy.
    pub fn spendable_candidates(
        &self,
        chain: &dyn ChainOracle,
        mempool: &dyn MempoolOracle,
        now: u64,
        filter: Option<&(dyn Fn(&UtxoCandidate) -> bool + '_)>,
    ) -> Vec<UtxoCandidate> {
        let tip = chain.tip();
        let mut result = Vec::new();
        for rec in self.ordered_history() {
            if rec.is_conflicted() || rec.abandoned {
                continue;
            }
            let depth = self.depth_of(rec, chain);
            if depth == 0 && !rec.in_mempool {
                continue;
            }
            if rec.tx.is_coinbase() && depth < COINBASE_MATURITY {
                continue;
            }
            if !balance::is_final(&rec.tx, tip.height, now) {
                continue;
            }
            let safe = balance::is_trusted(self, rec, chain, now);
            let ancestors = if depth == 0 {
                mempool.ancestor_count(&rec.txid)
            } else {
                0
            };
            for (index, output) in rec.tx.outputs.iter().enumerate() {
                let Some(ownership) = self.owned.get(&output.destination) else {
                    continue;
                };
                let outpoint = OutPoint {
                    txid: rec.txid,
                    index: index as u64,
                };
                if self.is_spent(&outpoint, chain) {
                    continue;
                }
                let spendable = matches!(ownership, Ownership::Spendable);
                let candidate = UtxoCandidate {
                    outpoint,
                    value: output.value,
                    destination: output.destination,
                    depth,
                    ancestors,
                    from_me: rec.from_me,
                    spendable,
                    solvable: spendable,
                    safe,
                };
                if filter.is_none_or(|f| f(&candidate)) {
                    result.push(candidate);
                }
            }
        }
        result
    }

    /// Re-insert a persisted record, preserving its sequence and times.
    ///
    /// Used for startup replay; records must arrive in sequence order.
    pub fn restore(&mut self, stored: StoredRecord) -> Result<(), WalletError> {
        if self.records.contains_key(&stored.txid) {
            return Err(WalletError::InvalidState(format!(
                "record {} already present",
                stored.txid
            )));
        }
        for input in &stored.tx.inputs {
            if !input.previous_output.is_null() {
                self.spends
                    .entry(input.previous_output)
                    .or_default()
                    .insert(stored.txid);
            }
        }
        self.next_sequence = self.next_sequence.max(stored.sequence + 1);
        self.order.push(stored.txid);
        self.records.insert(
            stored.txid,
            TxRecord {
                tx: stored.tx,
                txid: stored.txid,
                confirmation: stored.confirmation,
                sequence: stored.sequence,
                time_first_seen: stored.time_first_seen,
                smart_time: stored.smart_time,
                in_mempool: false,
                abandoned: stored.abandoned,
                from_me: stored.from_me,
                metadata: stored.metadata,
                cache: Cell::new(None),
            },
        );
        self.version += 1;
        Ok(())
    }

    /// Whether any input of `tx` spends an output this wallet owns.
    fn debits_from_me(&self, tx: &Transaction) -> bool {
        tx.inputs.iter().any(|input| {
            self.records
                .get(&input.previous_output.txid)
                .and_then(|prev| prev.tx.outputs.get(input.previous_output.index as usize))
                .is_some_and(|out| self.owned.contains_key(&out.destination))
        })
    }

    /// History timestamp for a newly observed transaction.
    ///
    /// Unconfirmed observations keep their arrival time. Confirmed ones are
    /// clamped so history stays monotonically consistent with what the
    /// wallet has already recorded, tolerating up to
    /// [`TIMESTAMP_SKEW_SECS`] of clock skew: the result is at least the
    /// newest already-recorded timestamp within tolerance, and otherwise the
    /// earlier of block time and arrival time.
    fn compute_smart_time(
        &self,
        confirmation: &Confirmation,
        first_seen: u64,
        chain: &dyn ChainOracle,
    ) -> u64 {
        let Confirmation::Confirmed { block, .. } = confirmation else {
            return first_seen;
        };
        let block_time = chain.block_time(&block.hash).unwrap_or(first_seen);
        let tolerated = first_seen.saturating_add(TIMESTAMP_SKEW_SECS);
        let mut latest_entry = 0u64;
        for id in self.order.iter().rev() {
            let rec = &self.records[id];
            if rec.smart_time <= tolerated {
                latest_entry = rec.smart_time;
                break;
            }
        }
        latest_entry.max(block_time.min(first_seen))
    }

    /// All tracked spenders of any output of `txid`.
    fn spenders_of_outputs(&self, txid: &Hash256, n_outputs: usize) -> Vec<Hash256> {
        let mut children = Vec::new();
        for index in 0..n_outputs {
            let outpoint = OutPoint {
                txid: *txid,
                index: index as u64,
            };
            if let Some(spenders) = self.spends.get(&outpoint) {
                children.extend(spenders.iter().copied());
            }
        }
        children
    }

    fn amounts(&self, record: &TxRecord) -> CachedAmounts {
        if let Some(cached) = record.cache.get() {
            if cached.version == self.version {
                return cached;
            }
        }
        let mut credit_spendable = 0u64;
        let mut credit_watch = 0u64;
        for output in &record.tx.outputs {
            match self.owned.get(&output.destination) {
                Some(Ownership::Spendable) => {
                    credit_spendable = credit_spendable.saturating_add(output.value);
                }
                Some(Ownership::WatchOnly) => {
                    credit_watch = credit_watch.saturating_add(output.value);
                }
                None => {}
            }
        }
        let mut debit = 0u64;
        for input in &record.tx.inputs {
            if let Some(out) = self
                .records
                .get(&input.previous_output.txid)
                .and_then(|prev| prev.tx.outputs.get(input.previous_output.index as usize))
            {
                if self.owned.contains_key(&out.destination) {
                    debit = debit.saturating_add(out.value);
                }
            }
        }
        let computed = CachedAmounts {
            version: self.version,
            credit_spendable,
            credit_watch,
            debit,
        };
        record.cache.set(Some(computed));
        computed
    }
}

impl Default for LedgerIndex {
    fn default() -> Self {
        Self::new()
    }
}
