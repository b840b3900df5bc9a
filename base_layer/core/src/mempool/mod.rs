// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! The pending transaction pool: a deduplicated set keyed by transaction hash, with
//! sortition-distance extraction for the miner and a FIFO queue for locally produced
//! registrations.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use epic_common_types::Hash;
use log::*;
use parking_lot::RwLock;
use primitive_types::U256;

use crate::transactions::Transaction;

const LOG_TARGET: &str = "c::mempool";

/// Sortition distance between a transaction and the miner's previous block hash.
pub fn sortition_distance(tx_hash: &Hash, prev_hash: &Hash) -> U256 {
    (*tx_hash ^ *prev_hash).to_u256()
}

pub struct Mempool {
    pool: RwLock<HashSet<Arc<Transaction>>>,
    /// Locally produced registrations, consumed strictly first-in-first-out so concurrent
    /// redemptions of one peer chain resolve deterministically.
    redemptions: RwLock<VecDeque<Arc<Transaction>>>,
    capacity: usize,
}

impl Mempool {
    pub fn new(capacity: usize) -> Self {
        Self {
            pool: RwLock::new(HashSet::new()),
            redemptions: RwLock::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn size(&self) -> usize {
        self.pool.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.read().is_empty()
    }

    pub fn contains(&self, tx: &Arc<Transaction>) -> bool {
        self.pool.read().contains(tx)
    }

    /// Insert without any ledger check. Returns false for duplicates or when full.
    pub fn insert(&self, tx: Arc<Transaction>) -> bool {
        let mut pool = self.pool.write();
        if pool.len() >= self.capacity {
            debug!(target: LOG_TARGET, "Mempool full; dropping {}", tx.hash().to_substr());
            return false;
        }
        pool.insert(tx)
    }

    /// Admission path for transactions arriving from peers: registrations never enter the open
    /// pool, and inputs must refer to unspent outputs. The fit check is supplied by the caller
    /// so the pool itself stays ledger-agnostic.
    pub fn receive_tx(&self, tx: Arc<Transaction>, fits_ledger: impl FnOnce(&Transaction) -> bool) -> bool {
        if tx.is_registration() {
            return false;
        }
        if !fits_ledger(&tx) {
            return false;
        }
        self.insert(tx)
    }

    pub fn erase(&self, tx: &Arc<Transaction>) -> bool {
        self.pool.write().remove(tx)
    }

    /// A confirmed transaction leaves the pool; if it was valid, every conflicting entry
    /// (spending one of the same outpoints) is evicted too.
    pub fn release_tx_from_confirmed(&self, tx: &Transaction, valid: bool) {
        let mut pool = self.pool.write();
        pool.retain(|candidate| candidate.hash() != tx.hash());
        if !valid {
            return;
        }
        let spent: HashSet<Hash> = tx.inputs().iter().map(|i| i.outpoint.utxo_key()).collect();
        pool.retain(|candidate| {
            !candidate
                .inputs()
                .iter()
                .any(|input| spent.contains(&input.outpoint.utxo_key()))
        });
    }

    /// Drain up to `limit` transactions whose sortition distance from `prev_hash` is below
    /// `threshold`.
    pub fn extract_transactions(&self, prev_hash: &Hash, threshold: U256, limit: usize) -> Vec<Arc<Transaction>> {
        let mut pool = self.pool.write();
        let picked: Vec<Arc<Transaction>> = pool
            .iter()
            .filter(|tx| sortition_distance(tx.hash(), prev_hash) < threshold)
            .take(limit)
            .cloned()
            .collect();
        for tx in &picked {
            pool.remove(tx);
        }
        if !picked.is_empty() {
            debug!(target: LOG_TARGET, "{} transactions extracted for packing", picked.len());
        }
        picked
    }

    // --- redemption queue ---

    pub fn push_redemption(&self, tx: Arc<Transaction>) {
        self.redemptions.write().push_back(tx);
    }

    /// Pop the oldest queued registration. With `first_reg_only`, a non-first-registration at
    /// the queue head is left in place.
    pub fn get_redemption(&self, first_reg_only: bool) -> Option<Arc<Transaction>> {
        let mut queue = self.redemptions.write();
        if first_reg_only && !queue.front()?.is_first_registration() {
            return None;
        }
        queue.pop_front()
    }

    pub fn has_redemption(&self) -> bool {
        !self.redemptions.read().is_empty()
    }

    pub fn clear_redemptions(&self) {
        self.redemptions.write().clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        test_helpers::{new_address, spend_tx},
        transactions::{Coin, TxOutPoint},
    };

    fn ordinary_tx(seed: u8) -> Arc<Transaction> {
        let (key, addr) = new_address();
        spend_tx(&key, TxOutPoint::new(Hash::sha256(&[seed]), 0, 0), Coin(5), &addr)
    }

    #[test]
    fn deduplicates_on_hash() {
        let pool = Mempool::new(16);
        let tx = ordinary_tx(1);
        assert!(pool.insert(tx.clone()));
        assert!(!pool.insert(tx));
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn receive_rejects_registrations_and_misfits() {
        let (_, addr) = new_address();
        let pool = Mempool::new(16);
        let reg = Arc::new(Transaction::first_registration(&addr));
        assert!(!pool.receive_tx(reg, |_| true));

        let tx = ordinary_tx(2);
        assert!(!pool.receive_tx(tx.clone(), |_| false));
        assert!(pool.receive_tx(tx, |_| true));
    }

    #[test]
    fn confirmed_valid_tx_evicts_conflicts() {
        let pool = Mempool::new(16);
        let (key, addr) = new_address();
        let outpoint = TxOutPoint::new(Hash::sha256(b"producer"), 0, 0);
        let a = spend_tx(&key, outpoint, Coin(5), &addr);
        let b = spend_tx(&key, outpoint, Coin(6), &addr);
        pool.insert(a.clone());
        pool.insert(b.clone());

        pool.release_tx_from_confirmed(&a, true);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn confirmed_invalid_tx_leaves_conflicts() {
        let pool = Mempool::new(16);
        let (key, addr) = new_address();
        let outpoint = TxOutPoint::new(Hash::sha256(b"producer"), 0, 0);
        let a = spend_tx(&key, outpoint, Coin(5), &addr);
        let b = spend_tx(&key, outpoint, Coin(6), &addr);
        pool.insert(a.clone());
        pool.insert(b.clone());

        pool.release_tx_from_confirmed(&a, false);
        assert!(pool.contains(&b));
    }

    #[test]
    fn extraction_respects_threshold_and_limit() {
        let pool = Mempool::new(64);
        for i in 0..10 {
            pool.insert(ordinary_tx(i));
        }
        let prev = Hash::sha256(b"prev");
        assert!(pool.extract_transactions(&prev, U256::zero(), 10).is_empty());
        let picked = pool.extract_transactions(&prev, U256::MAX, 4);
        assert_eq!(picked.len(), 4);
        assert_eq!(pool.size(), 6);
        let rest = pool.extract_transactions(&prev, U256::MAX, 100);
        assert_eq!(rest.len(), 6);
        assert!(pool.is_empty());
    }

    #[test]
    fn redemption_queue_is_fifo() {
        let pool = Mempool::new(16);
        let (_, addr_a) = new_address();
        let (_, addr_b) = new_address();
        let first = Arc::new(Transaction::first_registration(&addr_a));
        let second = Arc::new(Transaction::redemption(Hash::sha256(b"anchor"), Coin(1), &addr_b));
        pool.push_redemption(first.clone());
        pool.push_redemption(second.clone());

        assert_eq!(pool.get_redemption(false).unwrap().hash(), first.hash());
        // the head is now a redemption, so a first-reg-only request yields nothing
        assert!(pool.get_redemption(true).is_none());
        assert_eq!(pool.get_redemption(false).unwrap().hash(), second.hash());
    }
}
