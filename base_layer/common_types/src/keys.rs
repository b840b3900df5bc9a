// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use rand::rngs::OsRng;
use secp256k1::{ecdsa::Signature, Message, Secp256k1, SecretKey};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::{Address, Hash};

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Malformed public key: {0}")]
    InvalidPublicKey(#[from] secp256k1::Error),
    #[error("Malformed signature")]
    InvalidSignature,
}

/// A compressed secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PublicKey(secp256k1::PublicKey);

impl PublicKey {
    pub const COMPRESSED_SIZE: usize = 33;

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        Ok(Self(secp256k1::PublicKey::from_slice(bytes)?))
    }

    pub fn serialize(&self) -> [u8; Self::COMPRESSED_SIZE] {
        self.0.serialize()
    }

    pub fn to_address(&self) -> Address {
        Address::from_public_key_bytes(&self.serialize())
    }

    /// Verify a DER-encoded ECDSA signature over `msg_hash` under this key.
    pub fn verify(&self, msg_hash: &Hash, sig_der: &[u8]) -> bool {
        let secp = Secp256k1::verification_only();
        let msg = match Message::from_slice(msg_hash.as_bytes()) {
            Ok(m) => m,
            Err(_) => return false,
        };
        let sig = match Signature::from_der(sig_der) {
            Ok(s) => s,
            Err(_) => return false,
        };
        secp.verify_ecdsa(&msg, &sig, &self.0).is_ok()
    }
}

/// A secp256k1 secret key. The raw scalar is held in a zeroizing buffer and is cleared when the
/// key is dropped; it is never printed by Debug/Display.
pub struct PrivateKey {
    secret: Zeroizing<[u8; 32]>,
}

impl PrivateKey {
    pub fn random() -> Self {
        let (secret, _) = Secp256k1::new().generate_keypair(&mut OsRng);
        Self {
            secret: Zeroizing::new(secret.secret_bytes()),
        }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, KeyError> {
        SecretKey::from_slice(&bytes)?;
        Ok(Self {
            secret: Zeroizing::new(bytes),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&*self.secret).expect("validated on construction");
        PublicKey(secp256k1::PublicKey::from_secret_key(&secp, &sk))
    }

    /// Produce a DER-encoded ECDSA signature over `msg_hash`.
    pub fn sign(&self, msg_hash: &Hash) -> Result<Vec<u8>, KeyError> {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&*self.secret).expect("validated on construction");
        let msg = Message::from_slice(msg_hash.as_bytes()).map_err(|_| KeyError::InvalidSignature)?;
        let sig = secp.sign_ecdsa(&msg, &sk);
        Ok(sig.serialize_der().to_vec())
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey(..)")
    }
}
