// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! Miner-driven end-to-end flow on localnet parameters.

use std::{sync::Arc, thread, time::Duration};

use epic_common::{MinerConfig, StorageConfig};
use epic_core::{
    chain_storage::BlockStore,
    dag::DagManager,
    mempool::Mempool,
    mining::Miner,
    test_helpers::new_address,
    transactions::Transaction,
};

fn wait_for(what: &str, predicate: impl Fn() -> bool) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {}", what);
}

#[test]
fn miner_builds_a_chain_from_a_first_registration() {
    let tmp = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        data_dir: tmp.path().to_path_buf(),
        ..Default::default()
    };
    let store = Arc::new(BlockStore::open(&config).unwrap());
    let dag = Arc::new(DagManager::start(store.clone()).unwrap());
    let mempool = Arc::new(Mempool::new(1024));

    let mut miner = Miner::new(
        dag.clone(),
        mempool.clone(),
        MinerConfig {
            solver_threads: 1,
            trim_rounds: 8,
        },
    );
    miner.start();
    assert!(miner.is_running());

    // nothing can be mined before a registration exists
    thread::sleep(Duration::from_millis(50));
    assert_eq!(dag.best_height(), 0);

    let (_key, addr) = new_address();
    mempool.push_redemption(Arc::new(Transaction::first_registration(&addr)));

    // the miner picks it up, solves and the DAG confirms milestones from it
    wait_for("first milestone", || dag.best_height() >= 1);
    miner.stop();
    dag.wait_idle();

    assert!(dag.best_height() >= 1);
    // the miner's own chain head was persisted for restart
    assert!(!store.miner_chain_head().is_zero());

    // the registration landed on some peer chain in the best view
    let chains = dag.chains().read();
    let best = chains.best();
    let mut found = false;
    for ms in best.cached_milestones() {
        for vertex in ms.vertices.values() {
            if vertex.read().block.is_registration() {
                found = true;
            }
        }
    }
    assert!(found, "no registration block was confirmed");
}
