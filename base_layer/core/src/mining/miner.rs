// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    thread::JoinHandle,
    time::Duration,
};

use epic_common::{get_params, MinerConfig};
use epic_common_types::Hash;
use log::*;
use parking_lot::{Condvar, Mutex};
use primitive_types::U256;

use crate::{
    blocks::{genesis_block, unix_time, Block, BlockSource},
    dag::DagManager,
    mempool::Mempool,
    mining::solver::{CpuSolver, SolveOutcome},
};

const LOG_TARGET: &str = "c::mining::miner";

/// Window of own recent blocks used to estimate the local hash fraction.
const SELF_CHAIN_WINDOW: usize = 20;

type RelayFn = Arc<dyn Fn(&Arc<Block>) + Send + Sync>;

/// The miner thread: assembles candidate blocks from the mempool and redemption queue, runs the
/// solver and publishes results through the DAG. After mining a milestone it blocks until the
/// DAG confirms a head update, and aborts the solver when a better external head arrives.
pub struct Miner {
    dag: Arc<DagManager>,
    mempool: Arc<Mempool>,
    config: MinerConfig,
    solver: Arc<CpuSolver>,
    enabled: Arc<AtomicBool>,
    dag_updated: Arc<(Mutex<bool>, Condvar)>,
    relay: Option<RelayFn>,
    handle: Option<JoinHandle<()>>,
}

impl Miner {
    pub fn new(dag: Arc<DagManager>, mempool: Arc<Mempool>, config: MinerConfig) -> Self {
        let solver = Arc::new(CpuSolver::new(config.solver_threads, config.trim_rounds));
        Self {
            dag,
            mempool,
            config,
            solver,
            enabled: Arc::new(AtomicBool::new(false)),
            dag_updated: Arc::new((Mutex::new(false), Condvar::new())),
            relay: None,
            handle: None,
        }
    }

    /// Install a hook that relays freshly mined blocks to peers.
    pub fn set_relay(&mut self, relay: impl Fn(&Arc<Block>) + Send + Sync + 'static) {
        self.relay = Some(Arc::new(relay));
    }

    pub fn is_running(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn start(&mut self) {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.solver.reset();

        // wake and abort on external main-chain head changes
        {
            let solver = self.solver.clone();
            let dag_updated = self.dag_updated.clone();
            let enabled = self.enabled.clone();
            self.dag.register_on_chain_updated(move |head, is_main| {
                if !enabled.load(Ordering::SeqCst) {
                    return;
                }
                let mined_by_us = matches!(head.source, BlockSource::Miner);
                if is_main && !mined_by_us {
                    debug!(
                        target: LOG_TARGET,
                        "Milestone chain head changed {}; aborting the current task",
                        head.hash().to_substr()
                    );
                    solver.abort();
                }
                if is_main || mined_by_us {
                    let (lock, condvar) = &*dag_updated;
                    *lock.lock() = true;
                    condvar.notify_all();
                }
            });
        }

        let worker = MinerWorker {
            dag: self.dag.clone(),
            mempool: self.mempool.clone(),
            solver: self.solver.clone(),
            enabled: self.enabled.clone(),
            dag_updated: self.dag_updated.clone(),
            relay: self.relay.clone(),
        };
        self.handle = Some(
            thread::Builder::new()
                .name("miner".into())
                .spawn(move || worker.run())
                .expect("spawn miner"),
        );
        info!(
            target: LOG_TARGET,
            "Miner started ({} solver threads, {} trim rounds)",
            self.config.solver_threads,
            self.config.trim_rounds
        );
    }

    pub fn stop(&mut self) {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(target: LOG_TARGET, "Stopping miner...");
        self.solver.abort();
        let (lock, condvar) = &*self.dag_updated;
        *lock.lock() = true;
        condvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Miner {
    fn drop(&mut self) {
        self.stop();
    }
}

struct MinerWorker {
    dag: Arc<DagManager>,
    mempool: Arc<Mempool>,
    solver: Arc<CpuSolver>,
    enabled: Arc<AtomicBool>,
    dag_updated: Arc<(Mutex<bool>, Condvar)>,
    relay: Option<RelayFn>,
}

impl MinerWorker {
    fn run(self) {
        let params = get_params();
        let store = self.dag.store().clone();

        // restore the miner's own peer chain head
        let mut self_chain_head: Option<Arc<Block>> = {
            let head = store.miner_chain_head();
            if head.is_zero() {
                None
            } else {
                store.get_block(&head).ok().flatten()
            }
        };
        let mut own_times: VecDeque<u32> = VecDeque::with_capacity(SELF_CHAIN_WINDOW);

        while self.enabled.load(Ordering::SeqCst) {
            let (ms_hash, block_target, ms_target, hash_rate) = {
                let chains = self.dag.chains().read();
                let head = chains.best().head();
                (head.hash(), head.block_target, head.milestone_target, head.hash_rate)
            };

            let mut block = Block::new(params.version);
            block.set_timestamp(unix_time() as u32);

            let prev_hash = match &self_chain_head {
                None => {
                    // a chain must begin with a first registration
                    let first_reg = match self.mempool.get_redemption(true) {
                        Some(tx) => tx,
                        None => {
                            trace!(target: LOG_TARGET, "Paused; waiting for the first registration...");
                            thread::sleep(Duration::from_millis(20));
                            continue;
                        },
                    };
                    info!(target: LOG_TARGET, "Got the first registration. Start mining.");
                    block.add_transaction(first_reg);
                    *genesis_block().hash()
                },
                Some(head) => {
                    let prev = *head.hash();
                    let mut capacity = params.block_capacity;

                    if let Some(tx) = self.mempool.get_redemption(false) {
                        if tx.is_first_registration() {
                            // the wallet restarted its peer chain; begin anew from genesis
                            self.mempool.push_redemption(tx);
                            self_chain_head = None;
                            own_times.clear();
                            continue;
                        }
                        block.add_transaction(tx);
                        capacity -= 1;
                    }

                    let allowed = allowed_distance(&own_times, block_target, hash_rate);
                    block.add_transactions(self.mempool.extract_transactions(&prev, allowed, capacity));
                    prev
                },
            };

            block.set_milestone_hash(ms_hash);
            block.set_prev_hash(prev_hash);
            block.set_tip_hash(self.select_tip());
            block.set_diff_target(crate::proof_of_work::target_to_compact(block_target));
            block.set_merkle();

            let outcome = self.solver.solve(&mut block);
            if outcome == SolveOutcome::Aborted || !block.verify() {
                self.reclaim_transactions(&block);
                self.solver.reset();
                continue;
            }

            block.source = BlockSource::Miner;
            let block = Arc::new(block);

            if let Some(relay) = &self.relay {
                relay(&block);
            }

            if own_times.len() == SELF_CHAIN_WINDOW {
                own_times.pop_front();
            }
            own_times.push_back(block.timestamp());
            self_chain_head = Some(block.clone());
            if let Err(e) = store.save_miner_chain_head(block.hash()) {
                warn!(target: LOG_TARGET, "Failed to persist miner chain head: {}", e);
            }

            {
                let (lock, _) = &*self.dag_updated;
                *lock.lock() = false;
            }
            self.dag.add_new_block(block.clone(), BlockSource::Miner);

            if block.check_milestone_pow(ms_target) {
                info!(
                    target: LOG_TARGET,
                    "Mined a milestone {}, ms {} prev {} tip {}",
                    block.hash().to_substr(),
                    block.milestone_hash().to_substr(),
                    block.prev_hash().to_substr(),
                    block.tip_hash().to_substr()
                );
                self.wait_dag_head_update();
            }
        }
    }

    /// A random pending tip of the best chain that we did not mine ourselves; genesis otherwise.
    fn select_tip(&self) -> Hash {
        let chains = self.dag.chains().read();
        let best = chains.best();
        for _ in 0..best.pending_count() {
            match best.random_tip() {
                Some(tip) if !matches!(tip.source, BlockSource::Miner) => return *tip.hash(),
                Some(_) => continue,
                None => break,
            }
        }
        *genesis_block().hash()
    }

    /// Return the transactions of an unpublished block to the pool, preserving the registration.
    fn reclaim_transactions(&self, block: &Block) {
        let mut txns = block.transactions().iter();
        if block.is_registration() {
            if let Some(reg) = txns.next() {
                if reg.is_first_registration() || reg.outputs()[0].value.value() > 0 {
                    self.mempool.push_redemption(reg.clone());
                }
            }
        }
        for tx in txns {
            self.mempool.insert(tx.clone());
        }
    }

    fn wait_dag_head_update(&self) {
        let (lock, condvar) = &*self.dag_updated;
        let mut updated = lock.lock();
        while !*updated && self.enabled.load(Ordering::SeqCst) {
            condvar.wait_for(&mut updated, Duration::from_millis(100));
        }
        self.solver.reset();
    }
}

/// Allowed sortition distance: the share of the distance space proportional to our estimated
/// fraction of the network hash rate. An empty own-block window admits everything.
fn allowed_distance(own_times: &VecDeque<u32>, block_target: U256, network_hash_rate: u64) -> U256 {
    if own_times.len() < 2 {
        return U256::MAX;
    }
    let span = u64::from(own_times.back().unwrap().saturating_sub(*own_times.front().unwrap())).max(1);
    let params = get_params();
    let difficulty = params.max_target / block_target.max(U256::one());
    let per_block = if difficulty.bits() > 64 { u64::MAX } else { difficulty.low_u64() };
    let own_rate = per_block.saturating_mul(own_times.len() as u64) / span;
    (U256::MAX / U256::from(network_hash_rate.max(1))).saturating_mul(U256::from(own_rate.max(1)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allowed_distance_scales_with_own_rate() {
        let target = get_params().max_target >> 4;
        let mut slow: VecDeque<u32> = VecDeque::new();
        slow.extend([0, 100]);
        let mut fast: VecDeque<u32> = VecDeque::new();
        fast.extend([0, 1]);
        let a = allowed_distance(&slow, target, 1_000);
        let b = allowed_distance(&fast, target, 1_000);
        assert!(b > a);
    }

    #[test]
    fn empty_window_admits_everything() {
        assert_eq!(allowed_distance(&VecDeque::new(), U256::one(), 10), U256::MAX);
    }
}
