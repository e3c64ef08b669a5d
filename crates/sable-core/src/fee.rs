//! Fee rates and dust thresholds.
//!
//! A [`FeeRate`] is expressed in motes per 1000 serialized bytes. Fees are
//! computed with a u128 intermediate and rounded up, so a nonzero rate never
//! charges zero for a nonzero size.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::DUST_SPEND_SIZE;

/// Fee rate in motes per 1000 serialized bytes.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct FeeRate(u64);

impl FeeRate {
    /// Zero rate.
    pub const ZERO: Self = Self(0);

    /// Construct from motes per 1000 bytes.
    pub fn per_kb(motes: u64) -> Self {
        Self(motes)
    }

    /// The underlying motes-per-1000-bytes value.
    pub fn motes_per_kb(&self) -> u64 {
        self.0
    }

    /// Fee owed for a transaction of `size` serialized bytes, rounded up.
    pub fn fee_for(&self, size: usize) -> u64 {
        if self.0 == 0 || size == 0 {
            return 0;
        }
        let fee = (self.0 as u128 * size as u128).div_ceil(1000);
        fee.min(u64::MAX as u128) as u64
    }

    /// True if this rate charges nothing.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} motes/kB", self.0)
    }
}

/// Smallest output value worth creating at the given rate: the fee to
/// create the output and later spend it. Anything below is dust.
pub fn dust_threshold(rate: FeeRate) -> u64 {
    rate.fee_for(DUST_SPEND_SIZE)
}
