//! Wallet error types.

use sable_core::error::{KeyError, SignerError, StoreError, TxError};
use sable_core::types::Hash256;
use thiserror::Error;

/// Errors that can occur in wallet operations.
///
/// Every externally triggerable failure is one of these variants; internal
/// structural-invariant violations (a spend-index entry whose record is
/// missing, for example) panic instead of being reported here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// Amount is zero, above the money ceiling, or a sum overflowed.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// No coin selection satisfies the target under any policy tier.
    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds {
        /// Total value of coins that were eligible for selection.
        have: u64,
        /// Value the selection needed to reach.
        need: u64,
    },

    /// A recipient or change output fell below the spendability threshold.
    #[error("output of {value} is below the dust threshold {threshold}")]
    DustOutput {
        /// Offending output value in motes.
        value: u64,
        /// Dust threshold in motes it fell below.
        threshold: u64,
    },

    /// Caller-specified change insertion position is invalid.
    #[error("change position {index} out of range (0..={len})")]
    ChangeIndexOutOfRange {
        /// Requested insertion index.
        index: usize,
        /// Number of recipient outputs.
        len: usize,
    },

    /// Serialized size exceeds the standardness ceiling.
    #[error("transaction too large: {size} > {max} bytes")]
    TransactionTooLarge {
        /// Serialized size in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// The transaction would exceed mempool ancestor/descendant limits.
    #[error("transaction would exceed mempool chain limits")]
    MempoolChainTooLong,

    /// The signer collaborator refused to produce a witness.
    #[error("signing failed: {0}")]
    SigningFailed(#[from] SignerError),

    /// The referenced transaction is not tracked by the ledger.
    #[error("transaction not found: {0}")]
    TxnNotFound(Hash256),

    /// The operation is invalid for the record's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Key reservation failure.
    #[error("key reservation: {0}")]
    KeyReservation(#[from] KeyError),

    /// Persistence failure.
    #[error("store: {0}")]
    Store(#[from] StoreError),

    /// Transaction encoding failure.
    #[error(transparent)]
    Tx(#[from] TxError),
}
