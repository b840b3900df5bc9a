// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, HashSet, VecDeque},
    sync::Arc,
};

use epic_common::get_params;
use epic_common_types::Hash;
use log::*;
use parking_lot::RwLock;
use primitive_types::U256;
use rand::seq::IteratorRandom;

use crate::{
    blocks::{genesis_block, Block},
    chain_storage::BlockStore,
    dag::{
        error::DagError,
        milestone::Milestone,
        reg_change::RegChange,
        vertex::{RedemptionStatus, TxValidity, Vertex},
    },
    transactions::{Coin, Tasm, Transaction, Utxo},
};

const LOG_TARGET: &str = "c::dag::chain";

/// One candidate milestone history: the cached window of recent snapshots, the pool of blocks
/// seen on this chain but not yet anchored, and ledger overlays on top of the flushed store.
///
/// The overlays hold every delta of the cached (unflushed) milestones; a key maps to `Some` for
/// a live entry and to `None` as a tombstone for an entry the cached history spent or removed.
pub struct Chain {
    pub is_main: bool,
    milestones: VecDeque<Arc<Milestone>>,
    pending: HashMap<Hash, Arc<Block>>,
    utxo_overlay: HashMap<Hash, Option<Utxo>>,
    reg_overlay: HashMap<Hash, Option<Hash>>,
    /// Reverse registration index (last registration hash -> peer chain head) over the full
    /// visible state, maintained incrementally.
    reg_reverse: HashMap<Hash, Hash>,
    store: Arc<BlockStore>,
}

impl Chain {
    /// The initial chain: restores the head milestone from the store, or bootstraps from
    /// genesis on an empty store.
    pub fn init(store: Arc<BlockStore>) -> Result<Self, DagError> {
        let mut reg_reverse = HashMap::new();
        for (head, last) in store.db().get_all_reg()? {
            reg_reverse.insert(last, head);
        }

        let genesis_ms = Arc::new(Milestone::genesis(Vertex::new(Arc::new(genesis_block().clone()))));
        let mut chain = Self {
            is_main: true,
            milestones: VecDeque::new(),
            pending: HashMap::new(),
            utxo_overlay: HashMap::new(),
            reg_overlay: HashMap::new(),
            reg_reverse,
            store,
        };

        let head_height = chain.store.head_height();
        if head_height == 0 {
            chain.milestones.push_back(genesis_ms);
            return Ok(chain);
        }

        // Reload the most recent flushed milestone as the in-memory head. Its ledger deltas are
        // already committed, so the overlays start empty.
        let restored = chain.restore_snapshot(head_height)?;
        info!(
            target: LOG_TARGET,
            "Restored chain head at height {} with chainwork {}",
            restored.height,
            restored.chainwork
        );
        chain.milestones.push_back(restored);
        Ok(chain)
    }

    fn restore_snapshot(&self, height: u64) -> Result<Arc<Milestone>, DagError> {
        let stored = self.store.get_level_set_vertices_at(height)?;
        let record = stored
            .first()
            .and_then(|(_, record)| record.clone())
            .ok_or(crate::chain_storage::ChainStorageError::NotFound("head milestone record"))?;
        let mut ms = Milestone {
            height: record.height,
            chainwork: record.chainwork,
            block_target: record.block_target,
            milestone_target: record.milestone_target,
            hash_rate: record.hash_rate,
            last_update_time: record.last_update_time,
            level_set: Vec::with_capacity(stored.len()),
            vertices: HashMap::with_capacity(stored.len()),
            reg_change: record.reg_change,
            created_utxos: HashMap::new(),
            spent_utxos: HashMap::new(),
        };
        for (vertex, _) in stored {
            let hash = *vertex.block.hash();
            ms.level_set.push(hash);
            ms.vertices.insert(hash, RwLock::new(vertex));
        }
        Ok(Arc::new(ms))
    }

    pub fn head(&self) -> &Arc<Milestone> {
        self.milestones.back().expect("a chain always has a head")
    }

    pub fn height(&self) -> u64 {
        self.head().height
    }

    pub fn chainwork(&self) -> U256 {
        self.head().chainwork
    }

    pub fn cached_milestones(&self) -> impl Iterator<Item = &Arc<Milestone>> {
        self.milestones.iter()
    }

    /// The cached snapshot anchored by `ms_hash`, if it is within the window.
    pub fn find_cached_milestone(&self, ms_hash: &Hash) -> Option<&Arc<Milestone>> {
        self.milestones.iter().rev().find(|ms| ms.hash() == *ms_hash)
    }

    // --- pending pool ---

    pub fn add_pending_block(&mut self, block: Arc<Block>) {
        self.pending.insert(*block.hash(), block);
    }

    pub fn has_pending(&self, hash: &Hash) -> bool {
        self.pending.contains_key(hash)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// A uniformly random pending block, used by the miner for tip selection.
    pub fn random_tip(&self) -> Option<Arc<Block>> {
        self.pending.values().choose(&mut rand::thread_rng()).cloned()
    }

    /// A block is known to this chain when it is pending, confirmed in the cached window or
    /// flushed to the store.
    pub fn is_known(&self, hash: &Hash) -> bool {
        self.has_pending(hash) || self.is_confirmed(hash)
    }

    pub fn is_confirmed(&self, hash: &Hash) -> bool {
        *hash == *genesis_block().hash() ||
            self.milestones.iter().any(|ms| ms.contains(hash)) ||
            self.store.exists(hash)
    }

    /// Look up ledger bookkeeping of a confirmed block: (cumulative reward, miner chain height).
    fn peer_chain_state(&self, hash: &Hash) -> Option<(Coin, u64)> {
        for ms in self.milestones.iter().rev() {
            if let Some(vertex) = ms.vertices.get(hash) {
                let v = vertex.read();
                return Some((v.cumulative_reward, v.miner_chain_height));
            }
        }
        match self.store.get_vertex(hash) {
            Ok(Some((vertex, _))) => Some((vertex.cumulative_reward, vertex.miner_chain_height)),
            _ => None,
        }
    }

    // --- ledger views ---

    pub fn get_utxo(&self, key: &Hash) -> Option<Utxo> {
        match self.utxo_overlay.get(key) {
            Some(Some(utxo)) => Some(utxo.clone()),
            Some(None) => None,
            None => self.store.get_utxo(key),
        }
    }

    pub fn get_last_reg(&self, head: &Hash) -> Option<Hash> {
        match self.reg_overlay.get(head) {
            Some(entry) => *entry,
            None => self.store.get_last_reg(head),
        }
    }

    /// The peer chain (head hash) whose latest registration is `last_reg`.
    pub fn find_peer_chain_by_reg(&self, last_reg: &Hash) -> Option<Hash> {
        self.reg_reverse.get(last_reg).copied()
    }

    /// Mempool admission check: every input must refer to a currently unspent output.
    pub fn tx_fits_ledger(&self, tx: &Transaction) -> bool {
        tx.inputs()
            .iter()
            .all(|input| self.get_utxo(&input.outpoint.utxo_key()).is_some())
    }

    // --- confirmation ---

    /// Confirm the level set anchored by `ms_block`: build it from the pending pool by
    /// deterministic topological order, validate every transaction against the milestone-scoped
    /// ledger, and push the new snapshot. Returns the snapshot plus the milestone that fell out
    /// of the cached window (to be flushed), if any.
    pub fn process_milestone(
        &mut self,
        ms_block: Arc<Block>,
    ) -> Result<(Arc<Milestone>, Option<Arc<Milestone>>), DagError> {
        let params = get_params();
        let ms_hash = *ms_block.hash();
        let level_set = self.assemble_level_set(&ms_block);
        trace!(
            target: LOG_TARGET,
            "Confirming level set of {} blocks under milestone {}",
            level_set.len(),
            ms_hash.to_substr()
        );

        let mut snapshot = Milestone::next(self.head(), ms_block.timestamp());

        // Validate in traversal order. Per-level-set double spends resolve by order: the first
        // spender wins, later ones are marked invalid.
        for block in &level_set {
            let vertex = self.confirm_block(block.clone(), &mut snapshot);
            let hash = *block.hash();
            snapshot.level_set.push(hash);
            snapshot.vertices.insert(hash, RwLock::new(vertex));
            self.pending.remove(&hash);
        }
        snapshot.vertices.get_mut(&ms_hash).expect("milestone is in set").get_mut().is_milestone = true;

        // fold the snapshot's deltas into the chain overlays
        for (key, utxo) in &snapshot.created_utxos {
            self.utxo_overlay.insert(*key, Some(utxo.clone()));
        }
        for key in snapshot.spent_utxos.keys() {
            self.utxo_overlay.insert(*key, None);
        }
        let reg_change = snapshot.reg_change.clone();
        self.apply_reg_change_to_overlay(&reg_change);

        let snapshot = Arc::new(snapshot);
        self.milestones.push_back(snapshot.clone());

        let flushed = if self.milestones.len() > params.cache_window {
            self.milestones.pop_front()
        } else {
            None
        };
        if let Some(ref old) = flushed {
            // flushed deltas leave the overlays; the store owns them now
            for key in old.created_utxos.keys() {
                if matches!(self.utxo_overlay.get(key), Some(Some(_))) {
                    self.utxo_overlay.remove(key);
                }
            }
            for key in old.spent_utxos.keys() {
                if matches!(self.utxo_overlay.get(key), Some(None)) {
                    self.utxo_overlay.remove(key);
                }
            }
            for (head, _) in old.reg_change.created() {
                if self.get_last_reg_overlay_matches(head, old) {
                    self.reg_overlay.remove(head);
                }
            }
        }
        Ok((snapshot, flushed))
    }

    fn get_last_reg_overlay_matches(&self, head: &Hash, flushed: &Milestone) -> bool {
        match self.reg_overlay.get(head) {
            Some(Some(last)) => flushed.reg_change.created().iter().any(|(h, l)| h == head && l == last),
            _ => false,
        }
    }

    fn apply_reg_change_to_overlay(&mut self, change: &RegChange) {
        for (head, last) in change.removed() {
            self.reg_overlay.insert(*head, None);
            self.reg_reverse.remove(last);
        }
        for (head, last) in change.created() {
            self.reg_overlay.insert(*head, Some(*last));
            self.reg_reverse.insert(*last, *head);
        }
    }

    /// Collect every block confirmed by `ms_block` but by no earlier milestone, ordered with the
    /// milestone first and the rest in Kahn topological order (ties broken by ascending hash).
    fn assemble_level_set(&self, ms_block: &Arc<Block>) -> Vec<Arc<Block>> {
        // discover members by walking parent links until hitting confirmed territory
        let mut members: HashMap<Hash, Arc<Block>> = HashMap::new();
        let mut stack = vec![ms_block.clone()];
        while let Some(block) = stack.pop() {
            let hash = *block.hash();
            if members.contains_key(&hash) {
                continue;
            }
            members.insert(hash, block.clone());
            for parent in [block.prev_hash(), block.tip_hash(), block.milestone_hash()] {
                if members.contains_key(&parent) || self.is_confirmed(&parent) {
                    continue;
                }
                if let Some(parent_block) = self.pending.get(&parent) {
                    stack.push(parent_block.clone());
                }
            }
        }

        let ms_hash = *ms_block.hash();
        members.remove(&ms_hash);

        // Kahn over the remaining members with edges parent -> child
        let mut in_degree: HashMap<Hash, usize> = HashMap::new();
        let mut children: HashMap<Hash, Vec<Hash>> = HashMap::new();
        for (hash, block) in &members {
            let mut degree = 0;
            for parent in [block.prev_hash(), block.tip_hash(), block.milestone_hash()] {
                if members.contains_key(&parent) && parent != *hash {
                    degree += 1;
                    children.entry(parent).or_default().push(*hash);
                }
            }
            in_degree.insert(*hash, degree);
        }

        let mut ready: BinaryHeap<Reverse<Hash>> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(h, _)| Reverse(*h))
            .collect();
        let mut order = vec![ms_block.clone()];
        while let Some(Reverse(hash)) = ready.pop() {
            order.push(members[&hash].clone());
            if let Some(kids) = children.get(&hash) {
                for kid in kids {
                    let degree = in_degree.get_mut(kid).expect("member");
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(*kid));
                    }
                }
            }
        }
        debug_assert_eq!(order.len(), members.len() + 1, "level set has a parent cycle");
        order
    }

    /// Ledger-validate one block of the level set being confirmed, producing its vertex and
    /// accumulating UTXO/registration deltas into `snapshot`.
    fn confirm_block(&self, block: Arc<Block>, snapshot: &mut Milestone) -> Vertex {
        let params = get_params();
        let mut vertex = Vertex::new(block.clone());
        vertex.height = snapshot.height;

        // peer chain bookkeeping from the prev edge
        let (prev_reward, prev_height) = if block.prev_hash() == *genesis_block().hash() {
            (Coin::ZERO, 0)
        } else {
            self.peer_chain_state_in(&block.prev_hash(), snapshot)
                .unwrap_or((Coin::ZERO, 0))
        };
        vertex.miner_chain_height = prev_height + 1;

        let block_hash = *block.hash();
        let mut fees = Coin::ZERO;
        let mut registered = false;
        vertex.validity.clear();

        for (tx_index, tx) in block.transactions().iter().enumerate() {
            let validity = if tx.is_registration() {
                if tx_index != 0 {
                    TxValidity::Invalid
                } else {
                    let validity = self.validate_registration(tx, &block, prev_reward, snapshot);
                    if validity == TxValidity::Valid {
                        registered = true;
                        self.apply_registration(tx, &block_hash, snapshot);
                    }
                    validity
                }
            } else {
                match self.validate_ordinary(tx, snapshot) {
                    Some((spent, fee)) => {
                        fees = fees.checked_add(fee).unwrap_or(fees);
                        apply_ordinary(tx, &block_hash, tx_index as u32, spent, snapshot);
                        TxValidity::Valid
                    },
                    None => TxValidity::Invalid,
                }
            };
            vertex.validity.push(validity);
        }

        if registered {
            vertex.redemption_status = RedemptionStatus::NotYet;
            vertex.cumulative_reward = Coin::ZERO;
        } else {
            vertex.redemption_status = RedemptionStatus::NotRedemption;
            // valid fees only
            vertex.cumulative_reward = prev_reward
                .checked_add(Coin(params.reward))
                .and_then(|c| c.checked_add(fees))
                .unwrap_or(prev_reward);
        }
        vertex
    }

    /// Like [`peer_chain_state`], additionally seeing blocks already confirmed into the snapshot
    /// under construction.
    fn peer_chain_state_in(&self, hash: &Hash, snapshot: &Milestone) -> Option<(Coin, u64)> {
        if let Some(vertex) = snapshot.vertices.get(hash) {
            let v = vertex.read();
            return Some((v.cumulative_reward, v.miner_chain_height));
        }
        self.peer_chain_state(hash)
    }

    fn validate_registration(
        &self,
        tx: &Transaction,
        block: &Block,
        prev_reward: Coin,
        snapshot: &Milestone,
    ) -> TxValidity {
        let params = get_params();
        if tx.is_first_registration() {
            // the shape (prev == genesis, zero value) was enforced in syntax verification
            return TxValidity::Valid;
        }
        // redemption: the anchor must be the live registration of some peer chain
        let anchor = tx.inputs()[0].outpoint.block_hash;
        if self.find_peer_chain_by_reg_in(&anchor, snapshot).is_none() {
            debug!(
                target: LOG_TARGET,
                "Redemption in {} names unknown anchor {}",
                block.hash().to_substr(),
                anchor.to_substr()
            );
            return TxValidity::Invalid;
        }
        // the realized value may not exceed the reward accumulated since the anchor
        let available = prev_reward.checked_add(Coin(params.reward)).unwrap_or(prev_reward);
        let value = tx.outputs()[0].value;
        if value > available || value.value() > params.max_money {
            debug!(
                target: LOG_TARGET,
                "Redemption in {} claims {} but only {} accrued",
                block.hash().to_substr(),
                value,
                available
            );
            return TxValidity::Invalid;
        }
        TxValidity::Valid
    }

    fn find_peer_chain_by_reg_in(&self, last_reg: &Hash, snapshot: &Milestone) -> Option<Hash> {
        for (head, last) in snapshot.reg_change.created() {
            if last == last_reg {
                return Some(*head);
            }
        }
        // pairs removed earlier in this same level set are no longer redeemable
        if snapshot.reg_change.removed().iter().any(|(_, last)| last == last_reg) {
            return None;
        }
        self.find_peer_chain_by_reg(last_reg)
    }

    fn apply_registration(&self, tx: &Transaction, block_hash: &Hash, snapshot: &mut Milestone) {
        if tx.is_first_registration() {
            // a new peer chain; the block itself becomes the chain head marker
            snapshot.reg_change.create(*block_hash, *block_hash);
            return;
        }
        let anchor = tx.inputs()[0].outpoint.block_hash;
        if let Some(head) = self.find_peer_chain_by_reg_in(&anchor, snapshot) {
            snapshot.reg_change.remove(head, anchor);
            snapshot.reg_change.create(head, *block_hash);

            // flip the redeemed anchor's vertex
            if !self.flip_redeemed_in_cache(&anchor, snapshot) {
                if let Err(e) = self.store.modify_vertex(&anchor, |v| {
                    v.redemption_status = RedemptionStatus::IsRedeemed;
                }) {
                    warn!(target: LOG_TARGET, "Failed to flip redeemed vertex {}: {}", anchor.to_substr(), e);
                }
            }

            // the realized reward becomes a spendable output
            let utxo = Utxo::new(tx.outputs()[0].clone(), 0, 0);
            let key = utxo.key(block_hash);
            snapshot.created_utxos.insert(key, utxo);
        }
    }

    fn flip_redeemed_in_cache(&self, anchor: &Hash, snapshot: &Milestone) -> bool {
        if let Some(vertex) = snapshot.vertices.get(anchor) {
            vertex.write().redemption_status = RedemptionStatus::IsRedeemed;
            return true;
        }
        for ms in self.milestones.iter().rev() {
            if let Some(vertex) = ms.vertices.get(anchor) {
                vertex.write().redemption_status = RedemptionStatus::IsRedeemed;
                return true;
            }
        }
        false
    }

    /// Validate an ordinary transaction against the milestone-scoped UTXO view. On success,
    /// returns the resolved spent UTXOs (for rollback records) and the fee.
    fn validate_ordinary(&self, tx: &Transaction, snapshot: &Milestone) -> Option<(Vec<(Hash, Utxo)>, Coin)> {
        let params = get_params();
        let mut input_sum = Coin::ZERO;
        let mut seen: HashSet<Hash> = HashSet::with_capacity(tx.inputs().len());
        let mut spent = Vec::with_capacity(tx.inputs().len());

        for input in tx.inputs() {
            let key = input.outpoint.utxo_key();
            if !seen.insert(key) {
                return None;
            }
            let utxo = self.get_utxo_in(&key, snapshot)?;
            if !Tasm::verify_in_out(&input.listing, &utxo.output.listing) {
                return None;
            }
            input_sum = input_sum.checked_add(utxo.output.value)?;
            spent.push((key, utxo));
        }

        let mut output_sum = Coin::ZERO;
        for output in tx.outputs() {
            if output.value.value() > params.max_money {
                return None;
            }
            output_sum = output_sum.checked_add(output.value)?;
        }

        if output_sum > input_sum {
            return None;
        }
        let fee = Coin(input_sum.value() - output_sum.value());
        if fee.value() < params.min_fee {
            return None;
        }
        Some((spent, fee))
    }

    /// UTXO view inside a confirmation pass: the snapshot's fresh deltas shadow the chain view.
    fn get_utxo_in(&self, key: &Hash, snapshot: &Milestone) -> Option<Utxo> {
        if snapshot.spent_utxos.contains_key(key) {
            return None;
        }
        if let Some(utxo) = snapshot.created_utxos.get(key) {
            return Some(utxo.clone());
        }
        self.get_utxo(key)
    }

    // --- forking ---

    /// Create the fork that shares this chain's history up to the cached milestone `fork_point`.
    /// The divergent suffix's ledger deltas are reversed out of the overlays; pending blocks are
    /// carried over (they may confirm on either branch).
    pub fn fork_at(&self, fork_point: &Hash) -> Option<Chain> {
        let position = self.milestones.iter().position(|ms| ms.hash() == *fork_point)?;

        let mut fork = Chain {
            is_main: false,
            milestones: self.milestones.iter().take(position + 1).cloned().collect(),
            pending: self.pending.clone(),
            utxo_overlay: self.utxo_overlay.clone(),
            reg_overlay: self.reg_overlay.clone(),
            reg_reverse: self.reg_reverse.clone(),
            store: self.store.clone(),
        };

        // walk back along the abandoned suffix reversing its deltas
        for ms in self.milestones.iter().skip(position + 1).rev() {
            for key in ms.created_utxos.keys() {
                fork.utxo_overlay.remove(key);
            }
            for (key, utxo) in &ms.spent_utxos {
                fork.utxo_overlay.insert(*key, Some(utxo.clone()));
            }
            fork.apply_reg_change_to_overlay(&ms.reg_change.inverted());
            // abandoned blocks return to the pending pool of the fork
            for hash in &ms.level_set {
                if let Some(vertex) = ms.vertices.get(hash) {
                    fork.pending.insert(*hash, vertex.read().block.clone());
                }
            }
        }
        Some(fork)
    }
}

fn apply_ordinary(
    tx: &Transaction,
    block_hash: &Hash,
    tx_index: u32,
    spent: Vec<(Hash, Utxo)>,
    snapshot: &mut Milestone,
) {
    for (key, utxo) in spent {
        if snapshot.created_utxos.remove(&key).is_some() {
            // created and spent within the same level set: net zero, nothing to roll back
            continue;
        }
        snapshot.spent_utxos.insert(key, utxo);
    }
    for (out_index, output) in tx.outputs().iter().enumerate() {
        let utxo = Utxo::new(output.clone(), tx_index, out_index as u32);
        let key = utxo.key(block_hash);
        snapshot.created_utxos.insert(key, utxo);
    }
}
