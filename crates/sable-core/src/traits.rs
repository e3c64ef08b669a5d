//! Collaborator contracts for the wallet engine.
//!
//! The engine never performs I/O or cryptography itself; everything it
//! needs from the outside world comes through these traits:
//! - [`ChainOracle`] — best-chain view (node implements)
//! - [`MempoolOracle`] — unconfirmed-pool membership and chain limits
//! - [`FeeEstimator`] — fee rates for a confirmation target
//! - [`Signer`] — witness production for owned inputs
//! - [`KeyProvider`] — fresh change destinations with reserve/keep/release
//!
//! Lock ordering: implementations that guard their state with a lock must
//! tolerate being called while the wallet's ledger lock is held. A caller
//! that holds a chain-state lock and also drives the wallet must acquire
//! the chain lock *before* entering the wallet, never the reverse.

use crate::error::{KeyError, SignerError};
use crate::fee::FeeRate;
use crate::types::{BlockRef, Destination, Hash256, Transaction, TxOutput};

/// Read-only view of the current best chain.
pub trait ChainOracle: Send + Sync {
    /// Current tip of the best chain.
    fn tip(&self) -> BlockRef;

    /// Hash of the best-chain block at `height`, if within the chain.
    fn block_hash_at(&self, height: u64) -> Option<Hash256>;

    /// Whether the referenced block is part of the current best chain.
    ///
    /// Default implementation compares against [`block_hash_at`](Self::block_hash_at).
    fn is_on_best_chain(&self, block: &BlockRef) -> bool {
        self.block_hash_at(block.height) == Some(block.hash)
    }

    /// Timestamp of the given block, if known.
    fn block_time(&self, hash: &Hash256) -> Option<u64>;
}

/// Membership and policy view of the node's unconfirmed transaction pool.
pub trait MempoolOracle: Send + Sync {
    /// Whether the pool currently contains the transaction.
    fn contains(&self, txid: &Hash256) -> bool;

    /// Number of in-pool ancestors of the given pool transaction.
    /// Zero for transactions not in the pool.
    fn ancestor_count(&self, txid: &Hash256) -> usize;

    /// Whether the prospective transaction would stay within the pool's
    /// ancestor/descendant chain limits.
    fn within_chain_limits(&self, tx: &Transaction) -> bool;
}

/// Fee-rate oracle.
pub trait FeeEstimator: Send + Sync {
    /// Estimated rate to confirm within `target` blocks.
    fn estimate(&self, target: u32) -> FeeRate;

    /// Floor rate below which the network will not relay.
    fn min_relay_rate(&self) -> FeeRate;

    /// Rate at which uneconomic change is discarded to fee.
    fn discard_rate(&self) -> FeeRate;
}

/// Produces witnesses for inputs spending owned outputs.
pub trait Signer: Send + Sync {
    /// Sign input `index` of `tx`, which spends `prev_out`.
    ///
    /// Returns the witness bytes to install on that input.
    fn sign_input(
        &self,
        tx: &Transaction,
        index: usize,
        prev_out: &TxOutput,
    ) -> Result<Vec<u8>, SignerError>;
}

/// Hands out fresh change destinations.
///
/// A reservation stays held until the caller either keeps it (the
/// destination was used in a committed transaction) or releases it back to
/// the pool. Two concurrent reservations never return the same destination.
pub trait KeyProvider: Send + Sync {
    /// Reserve a fresh destination. The returned id tracks the reservation.
    fn reserve_destination(&self) -> Result<(u64, Destination), KeyError>;

    /// Mark the reservation as permanently consumed.
    fn keep(&self, id: u64);

    /// Return the reservation to the pool for reuse.
    fn release(&self, id: u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutPoint, TxInput};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MockChain {
        heights: HashMap<u64, Hash256>,
        times: HashMap<Hash256, u64>,
        tip: BlockRef,
    }

    impl ChainOracle for MockChain {
        fn tip(&self) -> BlockRef {
            self.tip
        }
        fn block_hash_at(&self, height: u64) -> Option<Hash256> {
            self.heights.get(&height).copied()
        }
        fn block_time(&self, hash: &Hash256) -> Option<u64> {
            self.times.get(hash).copied()
        }
    }

    struct MockKeys {
        next: Mutex<u64>,
    }

    impl KeyProvider for MockKeys {
        fn reserve_destination(&self) -> Result<(u64, Destination), KeyError> {
            let mut next = self.next.lock().unwrap();
            let id = *next;
            *next += 1;
            Ok((id, Destination::PubkeyHash(Hash256([id as u8; 32]))))
        }
        fn keep(&self, _id: u64) {}
        fn release(&self, _id: u64) {}
    }

    struct RefusingSigner;

    impl Signer for RefusingSigner {
        fn sign_input(
            &self,
            tx: &Transaction,
            index: usize,
            _prev_out: &TxOutput,
        ) -> Result<Vec<u8>, SignerError> {
            if index >= tx.inputs.len() {
                return Err(SignerError::InputIndexOutOfBounds {
                    index,
                    len: tx.inputs.len(),
                });
            }
            Err(SignerError::Rejected("locked".into()))
        }
    }

    fn chain_with_tip(height: u64) -> MockChain {
        let hash = Hash256([height as u8; 32]);
        let mut heights = HashMap::new();
        heights.insert(height, hash);
        MockChain {
            heights,
            times: HashMap::new(),
            tip: BlockRef { hash, height },
        }
    }

    #[test]
    fn best_chain_membership_default_impl() {
        let chain = chain_with_tip(10);
        assert!(chain.is_on_best_chain(&chain.tip()));

        let stale = BlockRef { hash: Hash256([0xEE; 32]), height: 10 };
        assert!(!chain.is_on_best_chain(&stale));

        let unknown_height = BlockRef { hash: Hash256([1; 32]), height: 99 };
        assert!(!chain.is_on_best_chain(&unknown_height));
    }

    #[test]
    fn key_reservations_are_distinct() {
        let keys = MockKeys { next: Mutex::new(0) };
        let (a, da) = keys.reserve_destination().unwrap();
        let (b, db) = keys.reserve_destination().unwrap();
        assert_ne!(a, b);
        assert_ne!(da, db);
    }

    #[test]
    fn signer_bounds_check() {
        let tx = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                witness: vec![],
                sequence: 0,
            }],
            outputs: vec![],
            lock_time: 0,
        };
        let out = TxOutput {
            value: 1,
            destination: Destination::PubkeyHash(Hash256::ZERO),
        };
        let err = RefusingSigner.sign_input(&tx, 5, &out).unwrap_err();
        assert!(matches!(err, SignerError::InputIndexOutOfBounds { index: 5, len: 1 }));
    }

    // Object safety: each contract must be usable behind a dyn reference.

    fn _chain_object_safe(c: &dyn ChainOracle) {
        let _ = c.tip();
    }

    fn _mempool_object_safe(m: &dyn MempoolOracle) {
        let _ = m.contains(&Hash256::ZERO);
    }

    fn _fees_object_safe(f: &dyn FeeEstimator) {
        let _ = f.min_relay_rate();
    }

    fn _signer_object_safe(s: &dyn Signer) {
        let _ = s as *const dyn Signer;
    }

    fn _keys_object_safe(k: &dyn KeyProvider) {
        let _ = k as *const dyn KeyProvider;
    }
}
