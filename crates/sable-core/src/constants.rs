//! Protocol and policy constants. All monetary values in motes (1 SBL = 10^8 motes).

pub const COIN: u64 = 100_000_000;

/// Upper bound on any single amount or amount sum handled by the engine.
pub const MAX_MONEY: u64 = 21_000_000 * COIN;

/// Confirmations a coinbase output needs before its credit is spendable.
pub const COINBASE_MATURITY: u64 = 100;

/// Standardness ceiling on a transaction's serialized size in bytes.
pub const MAX_TX_SIZE: usize = 100_000;

/// Change below this value is considered not worth creating; the selector
/// targets `target + MIN_CHANGE` when it cannot hit the target exactly.
pub const MIN_CHANGE: u64 = COIN / 100;

/// A change output may shrink to absorb fee, but never below this floor.
pub const MIN_FINAL_CHANGE: u64 = MIN_CHANGE / 2;

/// Iteration budget for the randomized subset-sum search.
pub const KNAPSACK_ITERATIONS: u32 = 1_000;

/// Serialized bytes to create a typical output and later spend it.
/// Basis for the dust threshold.
pub const DUST_SPEND_SIZE: usize = 182;

/// Witness bytes assumed per input when measuring an unsigned transaction
/// (64-byte signature plus 32-byte public key).
pub const PLACEHOLDER_WITNESS_LEN: usize = 96;

/// Default cap on unconfirmed ancestor chains accepted by relay policy.
pub const DEFAULT_MAX_ANCESTORS: usize = 25;

/// Tolerated clock skew, in seconds, when assigning a confirmed
/// transaction's place in wallet history.
pub const TIMESTAMP_SKEW_SECS: u64 = 300;

/// Lock times below this are block heights; at or above, Unix timestamps.
pub const LOCKTIME_THRESHOLD: u64 = 500_000_000;

/// Input sequence signaling opt-in replaceability.
pub const SEQUENCE_RBF: u32 = 0xFFFF_FFFD;

/// Input sequence that leaves lock time enforceable without signaling
/// replaceability.
pub const SEQUENCE_NO_RBF: u32 = 0xFFFF_FFFE;

/// Final sequence: lock time is disabled for the transaction.
pub const SEQUENCE_FINAL: u32 = 0xFFFF_FFFF;
