// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    fmt,
    fmt::{Display, Formatter},
    ops::BitXor,
    str::FromStr,
};

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A 256-bit opaque identifier. Stored and transmitted little-endian; ordering and equality are
/// lexicographic over the byte representation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Hash([u8; Hash::SIZE]);

#[derive(Debug, Error)]
#[error("Invalid size: expected {expected} bytes, got {actual}")]
pub struct HashSizeError {
    expected: usize,
    actual: usize,
}

impl Hash {
    pub const SIZE: usize = 32;

    pub const fn zero() -> Self {
        Self([0u8; Self::SIZE])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub const fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self(bytes)
    }

    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, HashSizeError> {
        if bytes.len() != Self::SIZE {
            return Err(HashSizeError {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        let mut buf = [0u8; Self::SIZE];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.0
    }

    /// Single SHA-256 over `data`.
    pub fn sha256(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        Self::try_from_slice(&digest).expect("SHA-256 output is 32 bytes")
    }

    /// The first 8 bytes interpreted little-endian. Used to seed cheap hashers; not
    /// collision-resistant on its own.
    pub fn cheap_hash(&self) -> u64 {
        u64::from_le_bytes(self.0[..8].try_into().expect("8 bytes"))
    }

    /// Interpret the bytes as a little-endian 256-bit integer.
    pub fn to_u256(&self) -> U256 {
        U256::from_little_endian(&self.0)
    }

    pub fn from_u256(value: U256) -> Self {
        let mut buf = [0u8; Self::SIZE];
        value.to_little_endian(&mut buf);
        Self(buf)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// A short prefix of the hex form, for log lines.
    pub fn to_substr(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl BitXor for Hash {
    type Output = Hash;

    fn bitxor(self, rhs: Self) -> Self::Output {
        let mut out = [0u8; Self::SIZE];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.0[i] ^ rhs.0[i];
        }
        Hash(out)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; Hash::SIZE]> for Hash {
    fn from(bytes: [u8; Hash::SIZE]) -> Self {
        Self(bytes)
    }
}

impl FromStr for Hash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::try_from_slice(&bytes).map_err(|_| hex::FromHexError::InvalidStringLength)
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_substr())
    }
}
