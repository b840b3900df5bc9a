// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use thiserror::Error;

use super::siphash::{sip_block, SipHashKeys, EDGE_BLOCK_SIZE};

/// Verification failures for a candidate proof cycle.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    #[error("edge too big")]
    TooBig,
    #[error("edges not ascending")]
    TooSmall,
    #[error("endpoints don't match up")]
    NonMatching,
    #[error("branch in cycle")]
    Branch,
    #[error("cycle dead ends")]
    DeadEnd,
    #[error("cycle too short")]
    ShortCycle,
}

/// Verify that `proof` is a strictly ascending list of edge indices forming a single cycle of
/// exactly `proof.len()` edges in the graph generated by `keys`. Independent of the solver.
pub fn verify_proof(proof: &[u32], keys: &SipHashKeys, edge_bits: u8) -> Result<(), PowError> {
    let cycle_len = proof.len();
    let edge_mask: u64 = (1u64 << edge_bits) - 1;

    let mut uvs = vec![0u64; 2 * cycle_len];
    let mut xor0: u64 = 0;
    let mut xor1: u64 = 0;
    let mut buf = [0u64; EDGE_BLOCK_SIZE as usize];

    for (n, &edge_index) in proof.iter().enumerate() {
        if u64::from(edge_index) > edge_mask {
            return Err(PowError::TooBig);
        }
        if n > 0 && edge_index <= proof[n - 1] {
            return Err(PowError::TooSmall);
        }
        let edge = sip_block(keys, u64::from(edge_index), &mut buf);
        uvs[2 * n] = edge & edge_mask;
        uvs[2 * n + 1] = (edge >> 32) & edge_mask;
        xor0 ^= uvs[2 * n];
        xor1 ^= uvs[2 * n + 1];
    }

    if xor0 | xor1 != 0 {
        return Err(PowError::NonMatching);
    }

    // Follow the cycle: from each endpoint find the unique other position with the same node in
    // the same partition. Positions 2n are U endpoints, 2n+1 are V endpoints; stepping i ^ 1
    // crosses to the edge's other side.
    let mut n = 0;
    let mut i = 0;
    loop {
        let mut j = i;
        let mut k = i;
        loop {
            k = (k + 2) % (2 * cycle_len);
            if k == i {
                break;
            }
            if uvs[k] == uvs[i] {
                if j != i {
                    return Err(PowError::Branch);
                }
                j = k;
            }
        }
        if j == i {
            return Err(PowError::DeadEnd);
        }
        i = j ^ 1;
        n += 1;
        if i == 0 {
            break;
        }
    }

    if n == cycle_len {
        Ok(())
    } else {
        Err(PowError::ShortCycle)
    }
}
