// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! Common types shared across the Epic base layer: the 256-bit block/transaction hash,
//! Base58Check addresses and secp256k1 key wrappers.

pub mod address;
pub mod hash;
pub mod keys;

pub use address::{Address, AddressError};
pub use hash::Hash;
pub use keys::{KeyError, PrivateKey, PublicKey};

/// Alias kept for readability at call sites that deal specifically with block identifiers.
pub type BlockHash = Hash;
