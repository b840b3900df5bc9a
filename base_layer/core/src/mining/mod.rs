// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! Block production: the CPU solver driver and the miner thread that assembles candidates from
//! the mempool and redemption queue, solves them and feeds them back into the DAG.

mod miner;
mod solver;

pub use miner::Miner;
pub use solver::{CpuSolver, SolveOutcome};
