//! Mock collaborators and factories shared by the integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use sable_core::constants::SEQUENCE_NO_RBF;
use sable_core::error::{KeyError, SignerError};
use sable_core::fee::FeeRate;
use sable_core::traits::{ChainOracle, FeeEstimator, KeyProvider, MempoolOracle, Signer};
use sable_core::types::{
    BlockRef, Destination, Hash256, OutPoint, Transaction, TxInput, TxOutput,
};
use sable_wallet::ledger::Ownership;
use sable_wallet::store::MemStore;
use sable_wallet::WalletEngine;

/// Destination derived from a seed byte.
pub fn dest(seed: u8) -> Destination {
    Destination::PubkeyHash(Hash256([seed; 32]))
}

/// An outpoint that does not reference any tracked transaction.
pub fn fake_outpoint(a: u8, index: u64) -> OutPoint {
    let mut bytes = [0xF0u8; 32];
    bytes[0] = a;
    OutPoint { txid: Hash256(bytes), index }
}

/// An unsigned spending transaction.
pub fn spend_tx(inputs: Vec<OutPoint>, outputs: Vec<(u64, Destination)>) -> Transaction {
    Transaction {
        version: 1,
        inputs: inputs
            .into_iter()
            .map(|previous_output| TxInput {
                previous_output,
                witness: vec![],
                sequence: SEQUENCE_NO_RBF,
            })
            .collect(),
        outputs: outputs
            .into_iter()
            .map(|(value, destination)| TxOutput { value, destination })
            .collect(),
        lock_time: 0,
    }
}

/// In-memory best chain that tests extend block by block.
pub struct MockChain {
    tip: Mutex<BlockRef>,
    by_height: Mutex<HashMap<u64, Hash256>>,
    times: Mutex<HashMap<Hash256, u64>>,
}

impl MockChain {
    pub fn new() -> Self {
        let genesis = Hash256([0x01; 32]);
        Self {
            tip: Mutex::new(BlockRef { hash: genesis, height: 0 }),
            by_height: Mutex::new(HashMap::from([(0, genesis)])),
            times: Mutex::new(HashMap::new()),
        }
    }

    /// Append a block with the given timestamp and return its reference.
    pub fn add_block(&self, time: u64) -> BlockRef {
        let mut tip = self.tip.lock();
        let height = tip.height + 1;
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&height.to_le_bytes());
        bytes[8] = 0xB1;
        let hash = Hash256(bytes);
        self.by_height.lock().insert(height, hash);
        self.times.lock().insert(hash, time);
        *tip = BlockRef { hash, height };
        *tip
    }

    /// Append `n` blocks at the same timestamp.
    pub fn mine(&self, n: u64, time: u64) {
        for _ in 0..n {
            self.add_block(time);
        }
    }

    /// Rewind the best chain to `height`, dropping every block above it.
    pub fn reorg_to(&self, height: u64) {
        let mut tip = self.tip.lock();
        let mut by_height = self.by_height.lock();
        by_height.retain(|h, _| *h <= height);
        let hash = by_height[&height];
        *tip = BlockRef { hash, height };
    }
}

impl ChainOracle for MockChain {
    fn tip(&self) -> BlockRef {
        *self.tip.lock()
    }

    fn block_hash_at(&self, height: u64) -> Option<Hash256> {
        self.by_height.lock().get(&height).copied()
    }

    fn block_time(&self, hash: &Hash256) -> Option<u64> {
        self.times.lock().get(hash).copied()
    }
}

/// Mempool stub with explicit membership and tunable limits.
pub struct MockMempool {
    pool: Mutex<HashSet<Hash256>>,
    ancestors: Mutex<HashMap<Hash256, usize>>,
    chain_limits_ok: Mutex<bool>,
}

impl MockMempool {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(HashSet::new()),
            ancestors: Mutex::new(HashMap::new()),
            chain_limits_ok: Mutex::new(true),
        }
    }

    pub fn insert(&self, txid: Hash256) {
        self.pool.lock().insert(txid);
    }

    pub fn remove(&self, txid: &Hash256) {
        self.pool.lock().remove(txid);
    }

    pub fn set_ancestors(&self, txid: Hash256, count: usize) {
        self.ancestors.lock().insert(txid, count);
    }

    pub fn set_chain_limits_ok(&self, ok: bool) {
        *self.chain_limits_ok.lock() = ok;
    }
}

impl MempoolOracle for MockMempool {
    fn contains(&self, txid: &Hash256) -> bool {
        self.pool.lock().contains(txid)
    }

    fn ancestor_count(&self, txid: &Hash256) -> usize {
        self.ancestors.lock().get(txid).copied().unwrap_or(0)
    }

    fn within_chain_limits(&self, _tx: &Transaction) -> bool {
        *self.chain_limits_ok.lock()
    }
}

/// Fixed-rate fee oracle.
pub struct MockFees {
    pub rate: FeeRate,
    pub min_relay: FeeRate,
    pub discard: FeeRate,
}

impl MockFees {
    pub fn new() -> Self {
        Self {
            rate: FeeRate::per_kb(2_000),
            min_relay: FeeRate::per_kb(1_000),
            discard: FeeRate::per_kb(3_000),
        }
    }
}

impl FeeEstimator for MockFees {
    fn estimate(&self, _target: u32) -> FeeRate {
        self.rate
    }

    fn min_relay_rate(&self) -> FeeRate {
        self.min_relay
    }

    fn discard_rate(&self) -> FeeRate {
        self.discard
    }
}

/// Signer producing fixed-size witnesses.
pub struct MockSigner;

impl Signer for MockSigner {
    fn sign_input(
        &self,
        tx: &Transaction,
        index: usize,
        _prev_out: &TxOutput,
    ) -> Result<Vec<u8>, SignerError> {
        if index >= tx.inputs.len() {
            return Err(SignerError::InputIndexOutOfBounds { index, len: tx.inputs.len() });
        }
        Ok(vec![0xAB; 96])
    }
}

/// Key provider handing out sequential destinations.
pub struct MockKeys {
    next: Mutex<u64>,
    pub kept: Mutex<Vec<u64>>,
    pub released: Mutex<Vec<u64>>,
}

impl MockKeys {
    pub fn new() -> Self {
        Self {
            next: Mutex::new(0),
            kept: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
        }
    }

    /// Destination the reservation with `id` handed out.
    pub fn destination_for(id: u64) -> Destination {
        let mut bytes = [0xC0u8; 32];
        bytes[..8].copy_from_slice(&id.to_le_bytes());
        Destination::PubkeyHash(Hash256(bytes))
    }
}

impl KeyProvider for MockKeys {
    fn reserve_destination(&self) -> Result<(u64, Destination), KeyError> {
        let mut next = self.next.lock();
        let id = *next;
        *next += 1;
        Ok((id, Self::destination_for(id)))
    }

    fn keep(&self, id: u64) {
        self.kept.lock().push(id);
    }

    fn release(&self, id: u64) {
        self.released.lock().push(id);
    }
}

/// All collaborator handles behind an engine under test.
pub struct Harness {
    pub engine: WalletEngine,
    pub chain: Arc<MockChain>,
    pub mempool: Arc<MockMempool>,
    pub keys: Arc<MockKeys>,
    pub store: Arc<MemStore>,
}

/// Engine wired to fresh mocks with `dest(1)` registered as spendable.
pub fn harness() -> Harness {
    let chain = Arc::new(MockChain::new());
    let mempool = Arc::new(MockMempool::new());
    let keys = Arc::new(MockKeys::new());
    let store = Arc::new(MemStore::new());
    let engine = WalletEngine::new(
        chain.clone(),
        mempool.clone(),
        Arc::new(MockFees::new()),
        Arc::new(MockSigner),
        keys.clone(),
        store.clone(),
    );
    engine.register_destination(dest(1), Ownership::Spendable);
    Harness { engine, chain, mempool, keys, store }
}

/// Fund the wallet with confirmed foreign payments, six blocks deep.
pub fn fund(h: &Harness, amounts: &[u64]) -> Vec<OutPoint> {
    let mut coins = Vec::new();
    for (k, &value) in amounts.iter().enumerate() {
        let tx = spend_tx(vec![fake_outpoint(k as u8, k as u64)], vec![(value, dest(1))]);
        let txid = tx.txid().unwrap();
        let block = h.chain.add_block(1_000);
        h.engine.sync_from_chain(tx, Some((block, 0)), 1_000).unwrap();
        coins.push(OutPoint { txid, index: 0 });
    }
    h.chain.mine(6, 1_500);
    coins
}
