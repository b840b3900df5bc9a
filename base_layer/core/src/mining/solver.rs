// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use epic_common::get_params;
use log::*;

use crate::{
    blocks::Block,
    codec::Encodable,
    proof_of_work::{blake2b_256, siphash_keys_from_header, SolverCtx, SolverResult},
};

const LOG_TARGET: &str = "c::mining::solver";

/// How often the hash-only search polls the abort flag.
const ABORT_POLL_INTERVAL: u32 = 1 << 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveOutcome {
    Solved,
    Aborted,
}

/// Nonce-driving CPU solver. For cycle networks every nonce spawns a trimming run over the
/// header-derived graph; without cycles the proof degenerates to a hash-below-target search.
pub struct CpuSolver {
    n_threads: usize,
    n_trims: usize,
    abort: Arc<AtomicBool>,
}

impl CpuSolver {
    pub fn new(n_threads: usize, n_trims: usize) -> Self {
        let n_threads = if n_threads == 0 { num_cpus::get() } else { n_threads };
        Self {
            n_threads,
            n_trims,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.abort.store(false, Ordering::SeqCst);
    }

    /// Search nonces until the block satisfies its own target, mutating `block` in place. The
    /// block comes back finalized on success.
    pub fn solve(&self, block: &mut Block) -> SolveOutcome {
        let params = get_params();
        let target = match block.target() {
            Some(t) if !t.is_zero() => t,
            _ => {
                warn!(target: LOG_TARGET, "Refusing to solve a block with an invalid target");
                return SolveOutcome::Aborted;
            },
        };

        if params.cycle_len == 0 {
            for nonce in 0..u32::MAX {
                if nonce % ABORT_POLL_INTERVAL == 0 && self.abort.load(Ordering::SeqCst) {
                    return SolveOutcome::Aborted;
                }
                block.set_nonce(nonce);
                if blake2b_256(&block.header().encode()).to_u256() <= target {
                    block.finalize_hash();
                    return SolveOutcome::Solved;
                }
            }
            return SolveOutcome::Aborted;
        }

        for nonce in 0..u32::MAX {
            if self.abort.load(Ordering::SeqCst) {
                return SolveOutcome::Aborted;
            }
            block.set_nonce(nonce);
            let keys = siphash_keys_from_header(&block.header().encode());
            let mut ctx = SolverCtx::new(
                params.edge_bits,
                params.cycle_len,
                self.n_threads,
                self.n_trims,
                Some(self.abort.clone()),
            );
            match ctx.run(&keys) {
                SolverResult::Found(proof) => {
                    block.set_proof(proof);
                    block.finalize_hash();
                    if block.proof_hash().to_u256() <= target {
                        return SolveOutcome::Solved;
                    }
                    // a valid cycle that misses the target; keep searching
                    block.set_proof(Vec::new());
                },
                SolverResult::Aborted => return SolveOutcome::Aborted,
                SolverResult::NoSolution => {},
            }
        }
        SolveOutcome::Aborted
    }
}
