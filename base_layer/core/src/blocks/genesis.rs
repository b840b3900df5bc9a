// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use epic_common::get_params;
use once_cell::sync::OnceCell;

use crate::{blocks::block::Block, proof_of_work::target_to_compact};

/// Fixed genesis timestamp (2019-06-06 21:30:00 UTC).
const GENESIS_TIME: u32 = 1_559_859_000;

static GENESIS: OnceCell<Block> = OnceCell::new();

/// The genesis block of the installed network. All three parent hashes are zero; it carries no
/// transactions and is exempt from proof-of-work verification.
pub fn genesis_block() -> &'static Block {
    GENESIS.get_or_init(|| {
        let params = get_params();
        let mut block = Block::new(params.version);
        block.set_timestamp(GENESIS_TIME);
        block.set_diff_target(target_to_compact(params.initial_ms_target));
        block.finalize_hash();
        block
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn genesis_is_stable_and_parentless() {
        let genesis = genesis_block();
        assert_eq!(genesis.hash(), genesis_block().hash());
        assert!(!genesis.hash().is_zero());
        assert!(genesis.milestone_hash().is_zero());
        assert!(genesis.prev_hash().is_zero());
        assert!(genesis.tip_hash().is_zero());
        assert!(!genesis.has_transactions());
    }
}
