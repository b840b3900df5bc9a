// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! End-to-end confirmation scenarios driven through the DAG manager.

use std::sync::Arc;

use epic_common::{get_params, StorageConfig};
use epic_common_types::Hash;
use epic_core::{
    blocks::{genesis_block, BlockSource},
    chain_storage::BlockStore,
    dag::{DagManager, RedemptionStatus, TxValidity},
    test_helpers::{build_block, build_ms_block, first_registration_block, new_address, spend_tx},
    transactions::{compute_utxo_key, Coin, Transaction, TxOutPoint},
};

fn start_dag() -> (tempfile::TempDir, Arc<DagManager>) {
    let tmp = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        data_dir: tmp.path().to_path_buf(),
        ..Default::default()
    };
    let store = Arc::new(BlockStore::open(&config).unwrap());
    let dag = Arc::new(DagManager::start(store).unwrap());
    (tmp, dag)
}

fn submit(dag: &DagManager, block: &Arc<epic_core::blocks::Block>) {
    dag.add_new_block(block.clone(), BlockSource::Network);
    dag.wait_idle();
}

#[test]
fn genesis_single_first_registration() {
    let (_tmp, dag) = start_dag();
    let (_key, addr) = new_address();
    let b1 = first_registration_block(&addr);
    submit(&dag, &b1);

    assert_eq!(dag.best_height(), 1);
    assert_eq!(dag.best_milestone_hash(), *b1.hash());

    let chains = dag.chains().read();
    let head = chains.best().head();
    let vertex = head.vertices.get(b1.hash()).expect("confirmed").read();
    assert!(vertex.is_milestone);
    assert_eq!(vertex.redemption_status, RedemptionStatus::NotYet);
    assert_eq!(vertex.validity, vec![TxValidity::Valid]);

    // the peer chain index records the first registration as its own last registration
    assert_eq!(chains.best().get_last_reg(b1.hash()), Some(*b1.hash()));
}

#[test]
fn redemption_realizes_reward_and_advances_chain() {
    let (_tmp, dag) = start_dag();
    let params = get_params();
    let (_key, addr) = new_address();
    let (_key2, addr2) = new_address();

    let b1 = first_registration_block(&addr);
    submit(&dag, &b1);

    let redemption = Arc::new(Transaction::redemption(*b1.hash(), Coin(params.reward), &addr2));
    let b2 = build_ms_block(*b1.hash(), *b1.hash(), *genesis_block().hash(), vec![redemption]);
    submit(&dag, &b2);

    assert_eq!(dag.best_height(), 2);

    let chains = dag.chains().read();
    let best = chains.best();

    // the redeemed registration flips, the new block becomes the chain's registration
    let ms1 = best.find_cached_milestone(b1.hash()).expect("cached");
    assert_eq!(
        ms1.vertices.get(b1.hash()).unwrap().read().redemption_status,
        RedemptionStatus::IsRedeemed
    );
    let head = best.head();
    assert_eq!(
        head.vertices.get(b2.hash()).unwrap().read().redemption_status,
        RedemptionStatus::NotYet
    );
    assert_eq!(best.get_last_reg(b1.hash()), Some(*b2.hash()));

    // the realized reward is exactly one spendable UTXO
    let utxo = best.get_utxo(&compute_utxo_key(b2.hash(), 0, 0)).expect("redeemed utxo");
    assert_eq!(utxo.output.value, Coin(params.reward));
}

#[test]
fn double_spend_in_same_level_set_resolves_by_hash_order() {
    let (_tmp, dag) = start_dag();
    let params = get_params();
    let (key, addr) = new_address();
    let (_key2, addr2) = new_address();

    // one registered chain and one redeemed UTXO to fight over
    let b1 = first_registration_block(&addr);
    submit(&dag, &b1);
    let redemption = Arc::new(Transaction::redemption(*b1.hash(), Coin(params.reward), &addr));
    let b2 = build_ms_block(*b1.hash(), *b1.hash(), *genesis_block().hash(), vec![redemption]);
    submit(&dag, &b2);

    let outpoint = TxOutPoint::new(*b2.hash(), 0, 0);
    let spend_value = Coin(params.reward - params.min_fee);
    let genesis = *genesis_block().hash();

    // two competing spenders of the same outpoint in one level set
    let c1 = build_block(
        *b2.hash(),
        *b2.hash(),
        genesis,
        vec![spend_tx(&key, outpoint, spend_value, &addr2)],
    );
    let c2 = build_block(
        *b2.hash(),
        *b2.hash(),
        *b2.hash(),
        vec![spend_tx(&key, outpoint, Coin(spend_value.value() - 1), &addr2)],
    );
    submit(&dag, &c1);
    submit(&dag, &c2);

    let m3 = build_ms_block(*b2.hash(), *c1.hash(), *c2.hash(), vec![]);
    submit(&dag, &m3);
    assert_eq!(dag.best_height(), 3);

    let chains = dag.chains().read();
    let head = chains.best().head();
    let v1 = head.vertices.get(c1.hash()).unwrap().read().validity.clone();
    let v2 = head.vertices.get(c2.hash()).unwrap().read().validity.clone();

    let (winner, loser) = if c1.hash() < c2.hash() { (v1, v2) } else { (v2, v1) };
    assert_eq!(winner, vec![TxValidity::Valid]);
    assert_eq!(loser, vec![TxValidity::Invalid]);

    // the contested UTXO was spent exactly once
    assert!(chains.best().get_utxo(&outpoint.utxo_key()).is_none());
}

#[test]
fn longer_fork_takes_over_and_reverts_registrations() {
    let (_tmp, dag) = start_dag();
    let params = get_params();
    let (_key, addr) = new_address();
    let genesis = *genesis_block().hash();

    let b1 = first_registration_block(&addr);
    submit(&dag, &b1);

    // fork A: redeems the registration, reaches height 4
    let (_k2, addr2) = new_address();
    let redemption = Arc::new(Transaction::redemption(*b1.hash(), Coin(params.reward), &addr2));
    let a2 = build_ms_block(*b1.hash(), *b1.hash(), genesis, vec![redemption]);
    submit(&dag, &a2);
    let a3 = build_ms_block(*a2.hash(), *a2.hash(), genesis, vec![]);
    submit(&dag, &a3);
    let a4 = build_ms_block(*a3.hash(), *a3.hash(), genesis, vec![]);
    submit(&dag, &a4);
    assert_eq!(dag.best_height(), 4);
    assert_eq!(dag.chains().read().best().get_last_reg(b1.hash()), Some(*a2.hash()));

    // fork B: diverges after b1, never redeems, reaches height 5
    let mut parent = *b1.hash();
    let mut b_head = parent;
    for _ in 0..4 {
        let block = build_ms_block(parent, parent, genesis, vec![]);
        submit(&dag, &block);
        parent = *block.hash();
        b_head = parent;
    }

    assert_eq!(dag.best_height(), 5);
    assert_eq!(dag.best_milestone_hash(), b_head);

    let chains = dag.chains().read();
    let best = chains.best();
    assert!(best.is_main);
    // fork B's view of the registration index never saw the redemption
    assert_eq!(best.get_last_reg(b1.hash()), Some(*b1.hash()));
    // and the redeemed UTXO from fork A does not exist on B
    assert!(best.get_utxo(&compute_utxo_key(a2.hash(), 0, 0)).is_none());
}

#[test]
fn orphan_is_released_when_parent_arrives() {
    let (_tmp, dag) = start_dag();
    let (_key, addr) = new_address();

    let b1 = first_registration_block(&addr);
    let b2 = build_ms_block(*b1.hash(), *b1.hash(), *genesis_block().hash(), vec![]);

    // child first: it must buffer, not confirm
    submit(&dag, &b2);
    assert_eq!(dag.best_height(), 0);
    assert_eq!(dag.orphan_count(), 1);
    assert!(dag.exists(b2.hash()));

    // parent releases the child within one ingestion cycle
    submit(&dag, &b1);
    assert_eq!(dag.orphan_count(), 0);
    assert_eq!(dag.best_height(), 2);
    assert_eq!(dag.best_milestone_hash(), *b2.hash());
}

#[test]
fn final_chain_is_independent_of_delivery_order() {
    let (_key, addr) = new_address();
    let b1 = first_registration_block(&addr);
    let genesis = *genesis_block().hash();
    let b2 = build_ms_block(*b1.hash(), *b1.hash(), genesis, vec![]);
    let b3 = build_ms_block(*b2.hash(), *b2.hash(), genesis, vec![]);

    let orders: [[&Arc<epic_core::blocks::Block>; 3]; 3] =
        [[&b1, &b2, &b3], [&b3, &b2, &b1], [&b2, &b3, &b1]];
    let mut heads: Vec<Hash> = Vec::new();
    for order in orders {
        let (_tmp, dag) = start_dag();
        for block in order {
            dag.add_new_block((*block).clone(), BlockSource::Network);
        }
        dag.wait_idle();
        assert_eq!(dag.orphan_count(), 0);
        heads.push(dag.best_milestone_hash());
    }
    assert!(heads.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(heads[0], *b3.hash());
}
