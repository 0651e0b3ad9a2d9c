//! Mint/melt authorities as a fixed-width signed trit vector.
//!
//! Position `L-1` (the least significant) is mint, `L-2` is melt. A trit
//! is `+1` when the capability is held, `-1` when a delta consumes it and
//! `0` otherwise. Absolute, persisted authorities never contain `-1`.

use serde::{Deserialize, Serialize};

use crate::config::AUTHORITIES_LEN;
use crate::error::{EngineError, EngineResult};

/// Signed authority vector of width [`AUTHORITIES_LEN`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Authorities {
    array: [i8; AUTHORITIES_LEN],
}

/// JSON view of the assigned authority bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityFlags {
    pub mint: bool,
    pub melt: bool,
}

impl Authorities {
    /// The empty vector.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Builds a vector from the bits of `value`, most significant first.
    pub fn from_bits(value: u8) -> Self {
        let mut array = [0i8; AUTHORITIES_LEN];
        for (i, slot) in array.iter_mut().enumerate() {
            let shift = AUTHORITIES_LEN - 1 - i;
            *slot = ((value >> shift) & 1) as i8;
        }
        Self { array }
    }

    /// Builds a vector from explicit trits, left-padding short input with
    /// zeros. Each element is clamped to its sign.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidAuthorities`] if more than [`AUTHORITIES_LEN`]
    /// trits are given.
    pub fn from_trits(trits: &[i8]) -> EngineResult<Self> {
        if trits.len() > AUTHORITIES_LEN {
            return Err(EngineError::InvalidAuthorities(trits.len()));
        }
        let mut array = [0i8; AUTHORITIES_LEN];
        let offset = AUTHORITIES_LEN - trits.len();
        for (slot, trit) in array[offset..].iter_mut().zip(trits) {
            *slot = trit.signum();
        }
        Ok(Self { array })
    }

    /// The raw trits.
    pub fn trits(&self) -> &[i8; AUTHORITIES_LEN] {
        &self.array
    }

    /// Reads the vector as a signed binary number: `Σ trit[i]·2^(L-1-i)`.
    pub fn to_integer(&self) -> i32 {
        self.array
            .iter()
            .enumerate()
            .map(|(i, &trit)| i32::from(trit) << (AUTHORITIES_LEN - 1 - i))
            .sum()
    }

    /// Bitmask of the positive trits. Used when persisting absolute values.
    pub fn to_bits(&self) -> u8 {
        self.array
            .iter()
            .enumerate()
            .filter(|(_, trit)| **trit > 0)
            .fold(0u8, |acc, (i, _)| acc | (1 << (AUTHORITIES_LEN - 1 - i)))
    }

    /// Elementwise `sign(a[i] + b[i])`. Two grants stay one grant; a grant
    /// and a consumption cancel out.
    pub fn merge(&self, other: &Authorities) -> Authorities {
        let mut array = [0i8; AUTHORITIES_LEN];
        for (i, slot) in array.iter_mut().enumerate() {
            *slot = (self.array[i] + other.array[i]).signum();
        }
        Authorities { array }
    }

    /// Flips the sign of every non-zero trit.
    pub fn to_negative(&self) -> Authorities {
        let mut array = self.array;
        for trit in array.iter_mut() {
            *trit = -*trit;
        }
        Authorities { array }
    }

    /// Returns `true` if any trit is `-1`.
    pub fn has_negative_value(&self) -> bool {
        self.array.iter().any(|&trit| trit < 0)
    }

    /// Returns `true` if no trit is set.
    pub fn is_zero(&self) -> bool {
        self.array.iter().all(|&trit| trit == 0)
    }

    /// Mint/melt view of the vector.
    pub fn to_json(&self) -> AuthorityFlags {
        AuthorityFlags {
            mint: self.array[AUTHORITIES_LEN - 1] > 0,
            melt: self.array[AUTHORITIES_LEN - 2] > 0,
        }
    }
}

impl From<u8> for Authorities {
    fn from(value: u8) -> Self {
        Self::from_bits(value)
    }
}
