// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use log::*;

use crate::dag::{chain::Chain, error::DagError};

const LOG_TARGET: &str = "c::dag::chains";

/// The fork container: candidate chains with a tracked best. The best chain carries
/// `is_main = true`; it can only be replaced by a new best taking over, never erased.
/// Ties on chainwork break toward the smaller head hash for cross-node determinism.
pub struct Chains {
    chains: Vec<Chain>,
    best: usize,
}

impl Chains {
    pub fn new(initial: Chain) -> Self {
        let mut chains = Chains {
            chains: vec![initial],
            best: 0,
        };
        chains.chains[0].is_main = true;
        chains
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn best_index(&self) -> usize {
        self.best
    }

    pub fn best(&self) -> &Chain {
        &self.chains[self.best]
    }

    pub fn get(&self, index: usize) -> Option<&Chain> {
        self.chains.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Chain> {
        self.chains.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chain> {
        self.chains.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Chain> {
        self.chains.iter_mut()
    }

    /// Add a fork candidate. Returns its index; the best pointer moves if it takes over.
    pub fn push(&mut self, chain: Chain) -> usize {
        self.chains.push(chain);
        let index = self.chains.len() - 1;
        self.update_best(index);
        index
    }

    fn beats(challenger: &Chain, incumbent: &Chain) -> bool {
        let by_work = challenger.chainwork().cmp(&incumbent.chainwork());
        by_work == std::cmp::Ordering::Greater ||
            (by_work == std::cmp::Ordering::Equal && challenger.head().hash() < incumbent.head().hash())
    }

    /// Re-evaluate the best pointer after chain `index` advanced. Returns true when the main
    /// chain switched.
    pub fn update_best(&mut self, index: usize) -> bool {
        if index == self.best || index >= self.chains.len() {
            return false;
        }
        if Self::beats(&self.chains[index], &self.chains[self.best]) {
            info!(
                target: LOG_TARGET,
                "Main chain switches: {} (height {}) takes over from {} (height {})",
                self.chains[index].head().hash().to_substr(),
                self.chains[index].height(),
                self.chains[self.best].head().hash().to_substr(),
                self.chains[self.best].height(),
            );
            self.chains[self.best].is_main = false;
            self.best = index;
            self.chains[self.best].is_main = true;
            return true;
        }
        false
    }

    /// Remove a losing fork. Erasing the best is rejected.
    pub fn erase(&mut self, index: usize) -> Result<(), DagError> {
        if index == self.best {
            return Err(DagError::CannotEraseBest);
        }
        if index >= self.chains.len() {
            return Err(DagError::UnknownChain(index));
        }
        self.chains.swap_remove(index);
        if self.best == self.chains.len() {
            // the former last element moved into the erased slot
            self.best = index;
        }
        Ok(())
    }

    /// Drop forks that fell more than `margin` milestones behind the best.
    pub fn prune(&mut self, margin: u64) {
        let best_height = self.best().height();
        let best_hash = self.best().head().hash();
        self.chains.retain(|chain| {
            chain.head().hash() == best_hash || chain.height() + margin >= best_height
        });
        self.best = self
            .chains
            .iter()
            .position(|c| c.head().hash() == best_hash)
            .expect("best is never pruned");
    }
}
