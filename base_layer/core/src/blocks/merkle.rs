// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use epic_common_types::Hash;
use sha2::{Digest, Sha256};

/// Bitcoin-style merkle fold: pair-wise double SHA-256, duplicating the last element of an odd
/// row. Returns the root and whether a mutation pattern (two identical consecutive leaves pairing
/// with each other) was seen; such trees admit distinct transaction lists with the same root.
pub fn compute_merkle_root(leaves: &[Hash]) -> (Hash, bool) {
    if leaves.is_empty() {
        return (Hash::zero(), false);
    }
    let mut mutated = false;
    let mut row: Vec<Hash> = leaves.to_vec();
    while row.len() > 1 {
        if row.len() % 2 == 1 {
            row.push(*row.last().expect("non-empty"));
        }
        let mut next = Vec::with_capacity(row.len() / 2);
        for pair in row.chunks(2) {
            if pair[0] == pair[1] {
                mutated = true;
            }
            let mut hasher = Sha256::new();
            hasher.update(pair[0].as_bytes());
            hasher.update(pair[1].as_bytes());
            let first = hasher.finalize();
            let second = Sha256::digest(first);
            next.push(Hash::try_from_slice(&second).expect("32 bytes"));
        }
        row = next;
    }
    (row[0], mutated)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_is_zero() {
        assert_eq!(compute_merkle_root(&[]), (Hash::zero(), false));
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let leaf = Hash::sha256(b"only");
        assert_eq!(compute_merkle_root(&[leaf]), (leaf, false));
    }

    #[test]
    fn odd_row_duplicates_last() {
        let leaves = [Hash::sha256(b"a"), Hash::sha256(b"b"), Hash::sha256(b"c")];
        let (root, mutated) = compute_merkle_root(&leaves);
        // duplicating c by hand must give the same root
        let padded = [leaves[0], leaves[1], leaves[2], leaves[2]];
        assert_eq!(compute_merkle_root(&padded).0, root);
        assert!(!mutated);
    }

    #[test]
    fn duplicate_pair_flags_mutation() {
        let a = Hash::sha256(b"a");
        let (_, mutated) = compute_merkle_root(&[a, a]);
        assert!(mutated);
    }

    #[test]
    fn order_matters() {
        let a = Hash::sha256(b"a");
        let b = Hash::sha256(b"b");
        assert_ne!(compute_merkle_root(&[a, b]).0, compute_merkle_root(&[b, a]).0);
    }
}
