// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! Builders shared by the unit and integration test suites. Everything here assumes the
//! localnet parameters (no cycle PoW, permissive targets).

use std::sync::Arc;

use epic_common::get_params;
use epic_common_types::{Address, Hash, PrivateKey};

use crate::{
    blocks::{genesis_block, Block},
    proof_of_work::target_to_compact,
    transactions::{Coin, Listing, Transaction, TxInput, TxOutPoint, TxOutput},
};

/// A block of the current version with zeroed parents, a current timestamp and the maximum
/// target. Not yet solved or finalized.
pub fn zero_block() -> Block {
    let params = get_params();
    let mut block = Block::new(params.version);
    block.set_timestamp(crate::blocks::unix_time() as u32);
    block.set_diff_target(target_to_compact(params.max_target));
    block
}

/// Solve a localnet block by nonce search against its own target and finalize its hash.
pub fn solve_block(block: &mut Block) {
    let target = block.target().expect("valid compact target");
    solve_until(block, |pow| pow <= target);
}

/// Solve so the block also meets the milestone target (with ample margin below it).
pub fn solve_block_milestone(block: &mut Block) {
    let ms_target = get_params().initial_ms_target >> 5;
    solve_until(block, |pow| pow <= ms_target);
}

/// Solve so the block meets its own target but misses the milestone target.
pub fn solve_block_ordinary(block: &mut Block) {
    let params = get_params();
    let target = block.target().expect("valid compact target");
    let ms_target = params.initial_ms_target;
    solve_until(block, |pow| pow <= target && pow > ms_target);
}

fn solve_until(block: &mut Block, accept: impl Fn(primitive_types::U256) -> bool) {
    assert_eq!(get_params().cycle_len, 0, "nonce solving only works without cycle PoW");
    for nonce in 0..u32::MAX {
        block.set_nonce(nonce);
        if accept(block.pow_hash().to_u256()) {
            break;
        }
    }
    block.finalize_hash();
}

fn linked_block(ms: Hash, prev: Hash, tip: Hash, txns: Vec<Arc<Transaction>>) -> Block {
    let mut block = zero_block();
    block.set_milestone_hash(ms);
    block.set_prev_hash(prev);
    block.set_tip_hash(tip);
    block.add_transactions(txns);
    block
}

/// A solved non-milestone block with the given parent links and transactions.
pub fn build_block(ms: Hash, prev: Hash, tip: Hash, txns: Vec<Arc<Transaction>>) -> Arc<Block> {
    let mut block = linked_block(ms, prev, tip, txns);
    solve_block_ordinary(&mut block);
    Arc::new(block)
}

/// A solved milestone-grade block with the given parent links and transactions.
pub fn build_ms_block(ms: Hash, prev: Hash, tip: Hash, txns: Vec<Arc<Transaction>>) -> Arc<Block> {
    let mut block = linked_block(ms, prev, tip, txns);
    solve_block_milestone(&mut block);
    Arc::new(block)
}

/// A milestone-grade first-registration block for a fresh key, anchored at genesis.
pub fn first_registration_block(addr: &Address) -> Arc<Block> {
    let genesis = *genesis_block().hash();
    build_ms_block(
        genesis,
        genesis,
        genesis,
        vec![Arc::new(Transaction::first_registration(addr))],
    )
}

/// A fresh key/address pair.
pub fn new_address() -> (PrivateKey, Address) {
    let key = PrivateKey::random();
    let addr = key.public_key().to_address();
    (key, addr)
}

/// An ordinary transaction spending `outpoint` (owned by `key`) into a new output for `to`.
pub fn spend_tx(key: &PrivateKey, outpoint: TxOutPoint, value: Coin, to: &Address) -> Arc<Transaction> {
    // the witness signs the outpoint's UTXO key, binding the signature to the spent output
    let msg = outpoint.utxo_key();
    let sig = key.sign(&msg).expect("signable");
    let witness = Listing::witness(&key.public_key(), &sig, &msg);
    Arc::new(Transaction::new(
        vec![TxInput::new(outpoint, witness)],
        vec![TxOutput::to_address(value, to)],
    ))
}
