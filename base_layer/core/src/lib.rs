// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! Core Epic protocol components: consensus codec, block and transaction models, the Cuckaroo
//! proof of work, the milestone-anchored DAG with its UTXO and registration ledger, persistent
//! storage, the mempool and the miner.

pub mod blocks;
pub mod chain_storage;
pub mod codec;
pub mod dag;
pub mod mempool;
pub mod messages;
pub mod mining;
pub mod proof_of_work;
pub mod transactions;

// Builders shared by the unit and integration test suites.
pub mod test_helpers;
