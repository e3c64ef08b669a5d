//! Record persistence contract and an in-memory implementation.
//!
//! The engine writes a [`StoredRecord`] snapshot after every ledger
//! mutation and replays all of them at startup. Records carry durable
//! state only — mempool membership is transient and re-learned from the
//! node after a restart.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use sable_core::error::StoreError;
use sable_core::types::{Hash256, Transaction};

use crate::ledger::{Confirmation, TxRecord};

/// Durable snapshot of a [`TxRecord`].
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct StoredRecord {
    /// Precomputed transaction ID.
    pub txid: Hash256,
    /// The transaction body.
    pub tx: Transaction,
    /// Chain state at the time of the snapshot.
    pub confirmation: Confirmation,
    /// Insertion order within the ledger.
    pub sequence: u64,
    /// Unix time the wallet first observed the transaction.
    pub time_first_seen: u64,
    /// Skew-tolerant history timestamp.
    pub smart_time: u64,
    /// Whether the record was abandoned.
    pub abandoned: bool,
    /// Whether any input spends an owned output.
    pub from_me: bool,
    /// Free-form cross references.
    pub metadata: BTreeMap<String, String>,
}

impl From<&TxRecord> for StoredRecord {
    fn from(rec: &TxRecord) -> Self {
        Self {
            txid: rec.txid,
            tx: rec.tx.clone(),
            confirmation: rec.confirmation,
            sequence: rec.sequence,
            time_first_seen: rec.time_first_seen,
            smart_time: rec.smart_time,
            abandoned: rec.abandoned,
            from_me: rec.from_me,
            metadata: rec.metadata.clone(),
        }
    }
}

/// Append/overwrite persistence for wallet records.
pub trait TxStore: Send + Sync {
    /// Write or overwrite the record keyed by its txid.
    fn put(&self, record: &StoredRecord) -> Result<(), StoreError>;

    /// Read every stored record. Order is unspecified; callers sort by
    /// sequence before replay.
    fn load_all(&self) -> Result<Vec<StoredRecord>, StoreError>;
}

/// In-memory [`TxStore`] holding canonically encoded records.
///
/// Suitable for tests and ephemeral wallets; a durable implementation
/// would put the same bytes in a database.
pub struct MemStore {
    records: Mutex<BTreeMap<Hash256, Vec<u8>>>,
}

impl MemStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self { records: Mutex::new(BTreeMap::new()) }
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TxStore for MemStore {
    fn put(&self, record: &StoredRecord) -> Result<(), StoreError> {
        let encoded = bincode::encode_to_vec(record, bincode::config::standard())
            .map_err(|e| StoreError::Corrupted(e.to_string()))?;
        self.records.lock().insert(record.txid, encoded);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<StoredRecord>, StoreError> {
        self.records
            .lock()
            .values()
            .map(|bytes| {
                bincode::decode_from_slice(bytes, bincode::config::standard())
                    .map(|(record, _)| record)
                    .map_err(|e| StoreError::Corrupted(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use sable_core::constants::COIN;

    fn sample_record(marker: u8) -> StoredRecord {
        let tx = spend_tx(vec![fake_outpoint(marker, 0)], vec![(COIN, dest(1))]);
        StoredRecord {
            txid: tx.txid().unwrap(),
            tx,
            confirmation: Confirmation::Unconfirmed,
            sequence: marker as u64,
            time_first_seen: 1_000,
            smart_time: 1_000,
            abandoned: false,
            from_me: false,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn put_and_load_round_trip() {
        let store = MemStore::new();
        let a = sample_record(1);
        let b = sample_record(2);
        store.put(&a).unwrap();
        store.put(&b).unwrap();

        let mut loaded = store.load_all().unwrap();
        loaded.sort_by_key(|r| r.sequence);
        assert_eq!(loaded, vec![a, b]);
    }

    #[test]
    fn put_overwrites_same_txid() {
        let store = MemStore::new();
        let mut rec = sample_record(1);
        store.put(&rec).unwrap();

        rec.abandoned = true;
        store.put(&rec).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].abandoned);
    }

    #[test]
    fn empty_store_loads_nothing() {
        let store = MemStore::new();
        assert!(store.is_empty());
        assert!(store.load_all().unwrap().is_empty());
    }
}
