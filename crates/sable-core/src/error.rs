//! Error types shared across the Sable engine and its collaborators.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("serialization: {0}")] Serialization(String),
    #[error("invalid hash: {0}")] InvalidHash(String),
    #[error("value overflow")] ValueOverflow,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("no key for destination {0}")] MissingKey(String),
    #[error("input index out of bounds: {index} >= {len}")] InputIndexOutOfBounds { index: usize, len: usize },
    #[error("signer refused: {0}")] Rejected(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("key pool exhausted")] Exhausted,
    #[error("key provider unavailable: {0}")] Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("I/O: {0}")] Io(String),
    #[error("corrupted record: {0}")] Corrupted(String),
}
