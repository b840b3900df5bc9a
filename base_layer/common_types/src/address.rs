// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    fmt,
    fmt::{Display, Formatter},
};

use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of the hash160 payload carried by an address.
pub const ADDRESS_PAYLOAD_SIZE: usize = 20;
const CHECKSUM_SIZE: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Base58 decoding failed: {0}")]
    DecodeError(String),
    #[error("Invalid checksum")]
    InvalidChecksum,
    #[error("Invalid payload length {0}")]
    InvalidLength(usize),
    #[error("Wrong network version byte {0}")]
    WrongVersion(u8),
}

/// A pay-to-key-hash address: hash160 of a compressed public key, rendered as Base58Check with a
/// single network version byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    payload: [u8; ADDRESS_PAYLOAD_SIZE],
}

impl Address {
    pub fn from_payload(payload: [u8; ADDRESS_PAYLOAD_SIZE]) -> Self {
        Self { payload }
    }

    /// hash160 = RIPEMD160(SHA256(pubkey bytes)).
    pub fn from_public_key_bytes(pubkey: &[u8]) -> Self {
        let sha = Sha256::digest(pubkey);
        let ripe = Ripemd160::digest(&sha);
        let mut payload = [0u8; ADDRESS_PAYLOAD_SIZE];
        payload.copy_from_slice(&ripe);
        Self { payload }
    }

    pub fn payload(&self) -> &[u8; ADDRESS_PAYLOAD_SIZE] {
        &self.payload
    }

    /// Encode as Base58Check under the given network version byte.
    pub fn encode(&self, version: u8) -> String {
        let mut raw = Vec::with_capacity(1 + ADDRESS_PAYLOAD_SIZE + CHECKSUM_SIZE);
        raw.push(version);
        raw.extend_from_slice(&self.payload);
        let checksum = Sha256::digest(Sha256::digest(&raw));
        raw.extend_from_slice(&checksum[..CHECKSUM_SIZE]);
        bs58::encode(raw).into_string()
    }

    /// Decode a Base58Check string, verifying the checksum and the network version byte.
    pub fn decode(encoded: &str, version: u8) -> Result<Self, AddressError> {
        let raw = bs58::decode(encoded)
            .into_vec()
            .map_err(|e| AddressError::DecodeError(e.to_string()))?;
        if raw.len() != 1 + ADDRESS_PAYLOAD_SIZE + CHECKSUM_SIZE {
            return Err(AddressError::InvalidLength(raw.len()));
        }
        let (body, checksum) = raw.split_at(raw.len() - CHECKSUM_SIZE);
        let expected = Sha256::digest(Sha256::digest(body));
        if checksum != &expected[..CHECKSUM_SIZE] {
            return Err(AddressError::InvalidChecksum);
        }
        if body[0] != version {
            return Err(AddressError::WrongVersion(body[0]));
        }
        let mut payload = [0u8; ADDRESS_PAYLOAD_SIZE];
        payload.copy_from_slice(&body[1..]);
        Ok(Self { payload })
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.payload))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", hex::encode(self.payload))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const VERSION: u8 = 0x21;

    #[test]
    fn encode_decode_round_trip() {
        let addr = Address::from_public_key_bytes(&[2u8; 33]);
        let encoded = addr.encode(VERSION);
        let decoded = Address::decode(&encoded, VERSION).unwrap();
        assert_eq!(addr, decoded);
    }

    #[test]
    fn rejects_wrong_version() {
        let addr = Address::from_payload([7u8; ADDRESS_PAYLOAD_SIZE]);
        let encoded = addr.encode(VERSION);
        assert_eq!(
            Address::decode(&encoded, VERSION + 1),
            Err(AddressError::WrongVersion(VERSION))
        );
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let addr = Address::from_payload([7u8; ADDRESS_PAYLOAD_SIZE]);
        let mut encoded = addr.encode(VERSION);
        // flip the final character to another base58 digit
        let last = encoded.pop().unwrap();
        encoded.push(if last == '1' { '2' } else { '1' });
        assert!(Address::decode(&encoded, VERSION).is_err());
    }
}
