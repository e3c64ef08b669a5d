//! Core wallet types: transactions, outpoints, destinations, block references.
//!
//! All monetary values are in motes (1 SBL = 10^8 motes).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TxError;

/// A 32-byte hash value.
///
/// Used for transaction IDs (BLAKE3 over the canonical encoding) and block
/// hashes supplied by the chain oracle.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes).
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Hash256 {
    type Err = TxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| TxError::InvalidHash(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TxError::InvalidHash("expected 32 bytes".into()))?;
        Ok(Self(arr))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within the transaction.
    pub index: u64,
}

impl OutPoint {
    /// The null outpoint, used for coinbase transaction inputs.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: u64::MAX,
        }
    }

    /// Check if this is the null outpoint (coinbase marker).
    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u64::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A payment destination.
///
/// Closed set of script kinds the engine understands; anything else never
/// reaches the wallet because the ownership registry cannot claim it.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub enum Destination {
    /// Pay to the BLAKE3 hash of a public key.
    PubkeyHash(Hash256),
    /// Pay to the BLAKE3 hash of a script.
    ScriptHash(Hash256),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PubkeyHash(h) => write!(f, "pkh:{h}"),
            Self::ScriptHash(h) => write!(f, "sh:{h}"),
        }
    }
}

/// A transaction input, spending a previous output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    /// The outpoint being spent. Null outpoint for coinbase.
    pub previous_output: OutPoint,
    /// Opaque witness bytes produced by the signer. Empty until signed.
    pub witness: Vec<u8>,
    /// Sequence number; carries replaceability signaling and gates lock time.
    pub sequence: u32,
}

/// A transaction output, creating a new spendable coin.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    /// Value in motes.
    pub value: u64,
    /// Destination the value is locked to.
    pub destination: Destination,
}

/// A transaction transferring value between destinations.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    /// Protocol version.
    pub version: u64,
    /// Inputs consuming previous outputs.
    pub inputs: Vec<TxInput>,
    /// New outputs created by this transaction.
    pub outputs: Vec<TxOutput>,
    /// Block height or timestamp before which this tx is invalid.
    pub lock_time: u64,
}

impl Transaction {
    /// Compute the transaction ID.
    ///
    /// BLAKE3 over the canonical bincode encoding with witnesses cleared,
    /// so the id is stable across signing and a stripped relay copy matches
    /// the signature-bearing original.
    pub fn txid(&self) -> Result<Hash256, TxError> {
        let mut stripped = self.clone();
        for input in &mut stripped.inputs {
            input.witness.clear();
        }
        let encoded = bincode::encode_to_vec(&stripped, bincode::config::standard())
            .map_err(|e| TxError::Serialization(e.to_string()))?;
        Ok(Hash256(blake3::hash(&encoded).into()))
    }

    /// Check if this is a coinbase transaction (single input with null outpoint).
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    /// Sum of all output values. Returns None on overflow.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value))
    }

    /// Serialized size in bytes of the transaction as it stands,
    /// witnesses included.
    pub fn serialized_size(&self) -> Result<usize, TxError> {
        let encoded = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TxError::Serialization(e.to_string()))?;
        Ok(encoded.len())
    }

    /// True if any input carries witness bytes.
    pub fn has_witnesses(&self) -> bool {
        self.inputs.iter().any(|i| !i.witness.is_empty())
    }
}

/// Reference to a block by hash and height.
///
/// Stored on wallet records either as the containing block (confirmed) or
/// the block whose contents conflict with the record.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockRef {
    /// Block header hash.
    pub hash: Hash256,
    /// Height of the block on its chain.
    pub height: u64,
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.hash, self.height)
    }
}
