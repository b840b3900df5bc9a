// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! Cuckaroo cycle proof of work: scalar SipHash edge generation, the independent proof verifier,
//! the bucket-sorting mean solver with its abortable barrier, and difficulty targeting.

mod barrier;
mod cuckaroo;
mod difficulty;
mod mean;
mod siphash;

pub use barrier::TrimBarrier;
pub use cuckaroo::{verify_proof, PowError};
pub use difficulty::{block_target_for, compact_to_target, next_targets, target_to_compact, Retarget};
pub use mean::{SolverCtx, SolverResult};
pub use siphash::{sip_block, siphash_keys_from_header, SipHashKeys, EDGE_BLOCK_MASK, EDGE_BLOCK_SIZE};

use blake2::{digest::consts::U32, Blake2b, Digest};
use epic_common_types::Hash;

/// BLAKE2b-256 convenience used for proof hashes and siphash key derivation.
pub fn blake2b_256(data: &[u8]) -> Hash {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(data);
    Hash::try_from_slice(&hasher.finalize()).expect("32 bytes")
}
