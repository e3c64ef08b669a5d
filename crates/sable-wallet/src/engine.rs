//! Engine composition: collaborators, the ledger lock, and the public
//! operation surface.
//!
//! A [`WalletEngine`] owns the ledger behind a single `Mutex` and holds
//! that lock for the entirety of each operation — a balance query, a
//! candidate scan plus build, a conflict sweep. There is no per-record
//! locking. Collaborators with their own locks must be acquired *before*
//! the engine is entered when a caller holds both (chain state first,
//! wallet second); the engine itself never calls back out while unlocked.
//!
//! Every mutation is written through to the [`TxStore`] so a restart can
//! replay the ledger with [`load_records`](WalletEngine::load_records).

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tracing::info;

use sable_core::traits::{ChainOracle, FeeEstimator, KeyProvider, MempoolOracle, Signer};
use sable_core::types::{BlockRef, Destination, Hash256, OutPoint};

use crate::balance::{self, Balance};
use crate::builder::{self, BuiltTransaction, CoinControl, Recipient};
use crate::error::WalletError;
use crate::ledger::{Confirmation, LedgerIndex, Ownership, UpsertOutcome};
use crate::store::{StoredRecord, TxStore};

/// One row of the wallet's transaction history.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Transaction ID.
    pub txid: Hash256,
    /// Insertion order.
    pub sequence: u64,
    /// History timestamp.
    pub smart_time: u64,
    /// Chain state of the record.
    pub confirmation: Confirmation,
    /// Whether the record was abandoned.
    pub abandoned: bool,
    /// Net effect on spendable balance: credit minus debit.
    pub net: i128,
}

/// The wallet transaction engine.
pub struct WalletEngine {
    chain: Arc<dyn ChainOracle>,
    mempool: Arc<dyn MempoolOracle>,
    fees: Arc<dyn FeeEstimator>,
    signer: Arc<dyn Signer>,
    keys: Arc<dyn KeyProvider>,
    store: Arc<dyn TxStore>,
    ledger: Mutex<LedgerIndex>,
}

impl WalletEngine {
    /// Assemble an engine from its collaborators.
    pub fn new(
        chain: Arc<dyn ChainOracle>,
        mempool: Arc<dyn MempoolOracle>,
        fees: Arc<dyn FeeEstimator>,
        signer: Arc<dyn Signer>,
        keys: Arc<dyn KeyProvider>,
        store: Arc<dyn TxStore>,
    ) -> Self {
        Self {
            chain,
            mempool,
            fees,
            signer,
            keys,
            store,
            ledger: Mutex::new(LedgerIndex::new()),
        }
    }

    /// Replay persisted records into the ledger. Call once at startup,
    /// before any notifications arrive.
    pub fn load_records(&self) -> Result<usize, WalletError> {
        let mut records = self.store.load_all()?;
        records.sort_by_key(|r| r.sequence);
        let count = records.len();
        let mut ledger = self.ledger.lock();
        for record in records {
            ledger.restore(record)?;
        }
        info!(count, "loaded wallet records");
        Ok(count)
    }

    /// Claim a destination for this wallet.
    pub fn register_destination(&self, destination: Destination, ownership: Ownership) {
        self.ledger.lock().register_destination(destination, ownership);
    }

    /// Feed a block or mempool observation into the ledger.
    pub fn sync_from_chain(
        &self,
        tx: sable_core::types::Transaction,
        block: Option<(BlockRef, u32)>,
        now: u64,
    ) -> Result<UpsertOutcome, WalletError> {
        let txid = tx.txid()?;
        let mut ledger = self.ledger.lock();
        let (outcome, touched) = ledger.sync_from_chain(tx, block, &*self.chain, now)?;
        if outcome != UpsertOutcome::Unchanged {
            self.persist(&ledger, &txid)?;
        }
        for id in touched {
            self.persist(&ledger, &id)?;
        }
        Ok(outcome)
    }

    /// Update mempool membership for a tracked transaction.
    pub fn set_mempool(&self, txid: &Hash256, in_pool: bool) -> bool {
        self.ledger.lock().set_mempool(txid, in_pool)
    }

    /// Whether a live spender of `outpoint` is tracked.
    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.ledger.lock().is_spent(outpoint, &*self.chain)
    }

    /// Other tracked spenders of the given transaction's inputs.
    pub fn conflicts(&self, txid: &Hash256) -> BTreeSet<Hash256> {
        self.ledger.lock().conflicts(txid)
    }

    /// Mark a transaction conflicted against a best-chain block,
    /// propagating through its descendants.
    pub fn mark_conflicted(&self, against: BlockRef, txid: Hash256) -> Result<(), WalletError> {
        let mut ledger = self.ledger.lock();
        let touched = ledger.mark_conflicted(against, txid, &*self.chain);
        for id in touched {
            self.persist(&ledger, &id)?;
        }
        Ok(())
    }

    /// Abandon an unconfirmed transaction and its descendants.
    pub fn abandon(&self, txid: &Hash256) -> Result<(), WalletError> {
        let mut ledger = self.ledger.lock();
        let flagged = ledger.abandon(txid, &*self.chain)?;
        for id in flagged {
            self.persist(&ledger, &id)?;
        }
        Ok(())
    }

    /// Record a replaced-by cross reference for a fee-bumped transaction.
    pub fn mark_replaced(&self, old: &Hash256, new: &Hash256) -> Result<(), WalletError> {
        let mut ledger = self.ledger.lock();
        ledger.mark_replaced(old, new, &*self.chain)?;
        self.persist(&ledger, old)
    }

    /// Current balance for outputs held with `filter` ownership.
    pub fn balance(&self, filter: Ownership, now: u64) -> Balance {
        let ledger = self.ledger.lock();
        balance::balance(&ledger, &*self.chain, now, filter)
    }

    /// Build a signed transaction paying `recipients`. No ledger state
    /// changes until [`commit`](Self::commit).
    pub fn build<R: Rng>(
        &self,
        recipients: &[Recipient],
        control: &CoinControl,
        rng: &mut R,
        now: u64,
    ) -> Result<BuiltTransaction, WalletError> {
        let ledger = self.ledger.lock();
        builder::build(
            &ledger,
            &*self.chain,
            &*self.mempool,
            &*self.fees,
            &*self.signer,
            &*self.keys,
            recipients,
            control,
            rng,
            now,
        )
    }

    /// Adopt a built transaction into the ledger and consume its change
    /// key reservation. Relay to the network is the caller's next step.
    pub fn commit(&self, built: BuiltTransaction, now: u64) -> Result<Hash256, WalletError> {
        let txid = built.tx.txid()?;
        {
            let mut ledger = self.ledger.lock();
            ledger.sync_from_chain(built.tx, None, &*self.chain, now)?;
            self.persist(&ledger, &txid)?;
        }
        if let Some(id) = built.reserved_key {
            self.keys.keep(id);
        }
        info!(%txid, fee = built.fee, "committed transaction");
        Ok(txid)
    }

    /// Transaction history in insertion order.
    pub fn history(&self) -> Vec<HistoryEntry> {
        let ledger = self.ledger.lock();
        ledger
            .ordered_history()
            .map(|rec| HistoryEntry {
                txid: rec.txid,
                sequence: rec.sequence,
                smart_time: rec.smart_time,
                confirmation: rec.confirmation,
                abandoned: rec.abandoned,
                net: ledger.credit(rec, Ownership::Spendable) as i128
                    - ledger.debit(rec) as i128,
            })
            .collect()
    }

    fn persist(&self, ledger: &LedgerIndex, txid: &Hash256) -> Result<(), WalletError> {
        let record = ledger
            .get(txid)
            .expect("persisting a transaction the ledger does not hold");
        self.store.put(&StoredRecord::from(record))?;
        Ok(())
    }
}
