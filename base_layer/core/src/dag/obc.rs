// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use bitflags::bitflags;
use epic_common_types::Hash;
use log::*;

use crate::blocks::Block;

const LOG_TARGET: &str = "c::dag::obc";

bitflags! {
    /// Which of the three parent links of an orphan are missing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MissingMask: u8 {
        const MILESTONE = 0b001;
        const PREV = 0b010;
        const TIP = 0b100;
    }
}

struct OrphanEntry {
    block: Arc<Block>,
    mask: MissingMask,
    /// Arrival order, for deterministic release batches.
    seq: u64,
}

/// The orphan blocks container: blocks whose parents have not arrived, indexed both by their own
/// hash and by every hash they are waiting for. A block is released once its missing mask clears.
#[derive(Default)]
pub struct OrphanBlocksContainer {
    entries: HashMap<Hash, OrphanEntry>,
    /// missing parent hash -> orphans waiting on it
    waiting_on: HashMap<Hash, HashSet<Hash>>,
    next_seq: u64,
}

impl OrphanBlocksContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of orphans currently buffered.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Number of distinct missing dependencies.
    pub fn dependency_size(&self) -> usize {
        self.waiting_on.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    /// Buffer `block` with the given missing mask. Inserting with an empty mask is a caller
    /// error: the block is not an orphan and must be re-submitted to the DAG instead.
    pub fn add_block(&mut self, block: Arc<Block>, mask: MissingMask) {
        if mask.is_empty() {
            warn!(
                target: LOG_TARGET,
                "Block {} submitted to OBC with no missing dependencies",
                block.hash().to_substr()
            );
            return;
        }
        let hash = *block.hash();
        if self.entries.contains_key(&hash) {
            return;
        }
        trace!(target: LOG_TARGET, "AddBlockToOBC {} mask {:?}", hash.to_substr(), mask);

        if mask.contains(MissingMask::MILESTONE) {
            self.waiting_on.entry(block.milestone_hash()).or_default().insert(hash);
        }
        if mask.contains(MissingMask::PREV) {
            self.waiting_on.entry(block.prev_hash()).or_default().insert(hash);
        }
        if mask.contains(MissingMask::TIP) {
            self.waiting_on.entry(block.tip_hash()).or_default().insert(hash);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(hash, OrphanEntry { block, mask, seq });
    }

    /// Notify the container that `hash` is now available. Returns the blocks whose last missing
    /// dependency this was, in their arrival order; the released blocks themselves are also
    /// submitted recursively since an orphan may have been waiting on another orphan.
    pub fn submit_hash(&mut self, hash: &Hash) -> Option<Vec<Arc<Block>>> {
        let mut released = Vec::new();
        let mut queue = vec![*hash];
        while let Some(arrived) = queue.pop() {
            let waiters = match self.waiting_on.remove(&arrived) {
                Some(w) => w,
                None => continue,
            };
            let mut freed: Vec<(u64, Arc<Block>)> = Vec::new();
            for waiter in waiters {
                let entry = match self.entries.get_mut(&waiter) {
                    Some(e) => e,
                    None => continue,
                };
                let mut cleared = MissingMask::empty();
                if entry.block.milestone_hash() == arrived {
                    cleared |= MissingMask::MILESTONE;
                }
                if entry.block.prev_hash() == arrived {
                    cleared |= MissingMask::PREV;
                }
                if entry.block.tip_hash() == arrived {
                    cleared |= MissingMask::TIP;
                }
                entry.mask -= cleared;
                if entry.mask.is_empty() {
                    let entry = self.entries.remove(&waiter).expect("present");
                    freed.push((entry.seq, entry.block));
                }
            }
            freed.sort_by_key(|(seq, _)| *seq);
            for (_, block) in freed {
                queue.push(*block.hash());
                released.push(block);
            }
        }
        // release order: dependency waves in cascade order, arrival order within each wave
        if released.is_empty() {
            None
        } else {
            Some(released)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_helpers::build_block;

    fn hashes(n: u8) -> Vec<Hash> {
        (0..n).map(|i| Hash::sha256(&[i])).collect()
    }

    #[test]
    fn non_orphan_is_rejected() {
        let mut obc = OrphanBlocksContainer::new();
        let parents = hashes(3);
        let block = build_block(parents[0], parents[1], parents[2], vec![]);
        obc.add_block(block, MissingMask::empty());
        assert_eq!(obc.size(), 0);
    }

    #[test]
    fn single_dependency_release() {
        let mut obc = OrphanBlocksContainer::new();
        let parents = hashes(3);
        let block = build_block(parents[0], parents[1], parents[2], vec![]);
        let hash = *block.hash();
        obc.add_block(block, MissingMask::MILESTONE);
        assert_eq!(obc.size(), 1);

        let released = obc.submit_hash(&parents[0]).unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(*released[0].hash(), hash);
        assert!(obc.is_empty());
    }

    #[test]
    fn partial_mask_keeps_block_buffered() {
        let mut obc = OrphanBlocksContainer::new();
        let parents = hashes(3);
        let block = build_block(parents[0], parents[1], parents[2], vec![]);
        obc.add_block(block, MissingMask::PREV | MissingMask::TIP);

        assert!(obc.submit_hash(&parents[1]).is_none());
        assert_eq!(obc.size(), 1);
        let released = obc.submit_hash(&parents[2]).unwrap();
        assert_eq!(released.len(), 1);
        assert!(obc.is_empty());
    }

    #[test]
    fn orphan_waiting_on_orphan_cascades() {
        let mut obc = OrphanBlocksContainer::new();
        let parents = hashes(3);
        let parent_block = build_block(parents[0], parents[1], parents[2], vec![]);
        let parent_hash = *parent_block.hash();
        let child = build_block(parents[0], parent_hash, parents[2], vec![]);

        obc.add_block(parent_block, MissingMask::MILESTONE);
        obc.add_block(child, MissingMask::PREV);
        assert_eq!(obc.size(), 2);

        // releasing the grandparent releases the parent, which releases the child
        let released = obc.submit_hash(&parents[0]).unwrap();
        assert_eq!(released.len(), 2);
        assert!(obc.is_empty());
        assert_eq!(obc.dependency_size(), 0);
    }

    #[test]
    fn same_parent_in_two_slots_clears_both() {
        let mut obc = OrphanBlocksContainer::new();
        let parents = hashes(2);
        // prev and tip are the same missing hash
        let block = build_block(parents[0], parents[1], parents[1], vec![]);
        obc.add_block(block, MissingMask::PREV | MissingMask::TIP);
        let released = obc.submit_hash(&parents[1]).unwrap();
        assert_eq!(released.len(), 1);
    }
}
