// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! The DAG manager: a single verify thread ingesting blocks, checking syntax and solidity,
//! routing orphans to the OBC executor, assembling level sets on milestone arrival and fanning
//! out confirmation callbacks.
//!
//! The verify thread is the sole mutator of chains, overlays and vertex validity. Other threads
//! read the fork container through the shared lock; the write side is only ever taken here.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use epic_common_types::Hash;
use epic_shutdown::{Shutdown, ShutdownSignal};
use log::*;
use parking_lot::{Mutex, RwLock};

use crate::{
    blocks::{Block, BlockSource},
    chain_storage::BlockStore,
    dag::{
        chain::Chain,
        chains::Chains,
        error::DagError,
        milestone::Milestone,
        obc::{MissingMask, OrphanBlocksContainer},
    },
};

const LOG_TARGET: &str = "c::dag::manager";

/// Fired after a level set is confirmed.
pub struct LevelSetEvent {
    pub milestone: Arc<Milestone>,
    pub is_main_chain: bool,
}

type LevelSetCallback = Box<dyn Fn(&LevelSetEvent) + Send + Sync>;
type ChainHeadCallback = Box<dyn Fn(&Arc<Block>, bool) + Send + Sync>;

#[derive(Default)]
pub struct DagCallbacks {
    level_set_confirmed: Vec<LevelSetCallback>,
    chain_head_updated: Vec<ChainHeadCallback>,
}

enum ObcCommand {
    Add(Arc<Block>, MissingMask),
    Submit(Hash),
}

/// Shared handles onto the running DAG.
pub struct DagManager {
    ingress_tx: Sender<(Arc<Block>, BlockSource)>,
    obc_tx: Sender<ObcCommand>,
    chains: Arc<RwLock<Chains>>,
    block_cache: Arc<RwLock<HashMap<Hash, Arc<Block>>>>,
    obc: Arc<Mutex<OrphanBlocksContainer>>,
    store: Arc<BlockStore>,
    callbacks: Arc<RwLock<DagCallbacks>>,
    in_flight: Arc<AtomicUsize>,
    shutdown: Shutdown,
    verify_handle: Option<JoinHandle<()>>,
    obc_handle: Option<JoinHandle<()>>,
}

impl DagManager {
    pub fn start(store: Arc<BlockStore>) -> Result<Self, DagError> {
        let shutdown = Shutdown::new().keep_alive_on_drop();
        let chains = Arc::new(RwLock::new(Chains::new(Chain::init(store.clone())?)));
        let block_cache = Arc::new(RwLock::new(HashMap::new()));
        let obc = Arc::new(Mutex::new(OrphanBlocksContainer::new()));
        let callbacks = Arc::new(RwLock::new(DagCallbacks::default()));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let (ingress_tx, ingress_rx) = unbounded();
        let (obc_tx, obc_rx) = unbounded();

        let verify_handle = {
            let worker = VerifyWorker {
                chains: chains.clone(),
                block_cache: block_cache.clone(),
                obc: obc.clone(),
                obc_tx: obc_tx.clone(),
                store: store.clone(),
                callbacks: callbacks.clone(),
                in_flight: in_flight.clone(),
            };
            let signal = shutdown.to_signal();
            thread::Builder::new()
                .name("dag-verify".into())
                .spawn(move || worker.run(ingress_rx, signal))
                .expect("spawn dag-verify")
        };

        let obc_handle = {
            let obc = obc.clone();
            let ingress_tx = ingress_tx.clone();
            let in_flight = in_flight.clone();
            let signal = shutdown.to_signal();
            thread::Builder::new()
                .name("dag-obc".into())
                .spawn(move || obc_worker(obc_rx, obc, ingress_tx, in_flight, signal))
                .expect("spawn dag-obc")
        };

        Ok(Self {
            ingress_tx,
            obc_tx,
            chains,
            block_cache,
            obc,
            store,
            callbacks,
            in_flight,
            shutdown,
            verify_handle: Some(verify_handle),
            obc_handle: Some(obc_handle),
        })
    }

    /// Drain pending work, stop the verify and OBC threads and join them.
    pub fn stop(&mut self) {
        self.wait_idle();
        self.shutdown.trigger();
        if let Some(handle) = self.verify_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.obc_handle.take() {
            let _ = handle.join();
        }
    }

    /// Submit a block to the admission pipeline.
    pub fn add_new_block(&self, block: Arc<Block>, source: BlockSource) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let mut block = block;
        Arc::make_mut(&mut block).source = source;
        if self.ingress_tx.send((block, source)).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            warn!(target: LOG_TARGET, "DAG ingress is closed; dropping block");
        }
    }

    /// Whether the DAG knows this hash in any stage: orphaned, cached, confirmed or stored.
    pub fn exists(&self, hash: &Hash) -> bool {
        self.block_cache.read().contains_key(hash) ||
            self.obc.lock().contains(hash) ||
            self.chains.read().iter().any(|c| c.is_known(hash)) ||
            self.store.exists(hash)
    }

    pub fn chains(&self) -> &Arc<RwLock<Chains>> {
        &self.chains
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    /// Height of the best chain head.
    pub fn best_height(&self) -> u64 {
        self.chains.read().best().height()
    }

    /// Hash of the best chain's head milestone.
    pub fn best_milestone_hash(&self) -> Hash {
        self.chains.read().best().head().hash()
    }

    pub fn orphan_count(&self) -> usize {
        self.obc.lock().size()
    }

    pub fn register_on_level_set_confirmed(&self, cb: impl Fn(&LevelSetEvent) + Send + Sync + 'static) {
        self.callbacks.write().level_set_confirmed.push(Box::new(cb));
    }

    pub fn register_on_chain_updated(&self, cb: impl Fn(&Arc<Block>, bool) + Send + Sync + 'static) {
        self.callbacks.write().chain_head_updated.push(Box::new(cb));
    }

    /// Block the caller until every submitted block has been fully processed. Test aid.
    pub fn wait_idle(&self) {
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for DagManager {
    fn drop(&mut self) {
        self.stop();
    }
}

struct VerifyWorker {
    chains: Arc<RwLock<Chains>>,
    block_cache: Arc<RwLock<HashMap<Hash, Arc<Block>>>>,
    obc: Arc<Mutex<OrphanBlocksContainer>>,
    obc_tx: Sender<ObcCommand>,
    store: Arc<BlockStore>,
    callbacks: Arc<RwLock<DagCallbacks>>,
    in_flight: Arc<AtomicUsize>,
}

impl VerifyWorker {
    fn run(self, ingress_rx: Receiver<(Arc<Block>, BlockSource)>, shutdown: ShutdownSignal) {
        info!(target: LOG_TARGET, "DAG verify thread started");
        loop {
            match ingress_rx.recv_timeout(Duration::from_millis(50)) {
                Ok((block, source)) => {
                    self.handle_block(block, source);
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                },
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if shutdown.is_triggered() {
                        break;
                    }
                },
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
        info!(target: LOG_TARGET, "DAG verify thread stopped");
    }

    fn handle_block(&self, block: Arc<Block>, source: BlockSource) {
        let hash = *block.hash();
        trace!(target: LOG_TARGET, "Ingesting block {} from {:?}", hash.to_substr(), source);

        if self.is_seen(&hash) {
            trace!(target: LOG_TARGET, "Block {} already known", hash.to_substr());
            return;
        }

        if !block.verify() {
            info!(target: LOG_TARGET, "Block {} failed syntax verification", hash.to_substr());
            return;
        }

        // solidity: every parent must be resolvable outside the orphan buffer
        let mut mask = MissingMask::empty();
        {
            let obc = self.obc.lock();
            for (bit, parent) in [
                (MissingMask::MILESTONE, block.milestone_hash()),
                (MissingMask::PREV, block.prev_hash()),
                (MissingMask::TIP, block.tip_hash()),
            ] {
                if obc.contains(&parent) || !self.parent_resolvable(&parent) {
                    mask |= bit;
                }
            }
        }
        if !mask.is_empty() {
            debug!(target: LOG_TARGET, "Block {} enters OBC with mask {:?}", hash.to_substr(), mask);
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            if self.obc_tx.send(ObcCommand::Add(block, mask)).is_err() {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            return;
        }

        self.block_cache.write().insert(hash, block.clone());
        {
            let mut chains = self.chains.write();
            for chain in chains.iter_mut() {
                if chain.is_known(&block.milestone_hash()) {
                    chain.add_pending_block(block.clone());
                }
            }
        }

        // this hash may satisfy orphans
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.obc_tx.send(ObcCommand::Submit(hash)).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        self.try_confirm_milestone(block);
    }

    fn is_seen(&self, hash: &Hash) -> bool {
        self.block_cache.read().contains_key(hash) || self.store.exists(hash)
    }

    fn parent_resolvable(&self, parent: &Hash) -> bool {
        self.block_cache.read().contains_key(parent) ||
            self.chains.read().iter().any(|c| c.is_known(parent)) ||
            self.store.exists(parent)
    }

    /// If `block` meets the milestone target of its anchoring snapshot, confirm a level set:
    /// either extending the chain whose head it names, or forking off an older cached milestone.
    fn try_confirm_milestone(&self, block: Arc<Block>) {
        let ms_parent = block.milestone_hash();
        let mut chains = self.chains.write();

        let extend_index = chains.iter().position(|c| c.head().hash() == ms_parent);
        let index = match extend_index {
            Some(index) => {
                if !block.check_milestone_pow(chains.get(index).expect("found").head().milestone_target) {
                    return;
                }
                index
            },
            None => {
                // find a cached, non-head milestone to fork from
                let fork = chains.iter().find_map(|chain| {
                    let snapshot = chain.find_cached_milestone(&ms_parent)?;
                    if !block.check_milestone_pow(snapshot.milestone_target) {
                        return None;
                    }
                    chain.fork_at(&ms_parent)
                });
                match fork {
                    Some(fork) => {
                        let index = chains.push(fork);
                        debug!(
                            target: LOG_TARGET,
                            "Fork created at {} for candidate milestone {}",
                            ms_parent.to_substr(),
                            block.hash().to_substr()
                        );
                        index
                    },
                    None => return,
                }
            },
        };

        let chain = chains.get_mut(index).expect("valid index");
        let (snapshot, flushed) = match chain.process_milestone(block.clone()) {
            Ok(result) => result,
            Err(e) => {
                error!(target: LOG_TARGET, "Milestone confirmation failed: {}", e);
                return;
            },
        };

        // anchored blocks leave the unconfirmed cache
        {
            let mut cache = self.block_cache.write();
            for hash in &snapshot.level_set {
                cache.remove(hash);
            }
        }

        chains.update_best(index);
        chains.prune(epic_common::get_params().cache_window as u64);
        let is_main = chains.iter().any(|c| c.is_main && c.head().hash() == *block.hash());

        if is_main {
            if let Some(flushed) = flushed {
                // flushing the window tail is the ledger commit point; failure here means the
                // disk state no longer matches the chain and we cannot continue
                if let Err(e) = self.store.store_level_set(&flushed) {
                    error!(target: LOG_TARGET, "FATAL: failed to flush level set: {}", e);
                    panic!("storage failure while flushing level set: {}", e);
                }
            }
        }
        drop(chains);

        let event = LevelSetEvent {
            milestone: snapshot,
            is_main_chain: is_main,
        };
        let callbacks = self.callbacks.read();
        for cb in &callbacks.level_set_confirmed {
            cb(&event);
        }
        for cb in &callbacks.chain_head_updated {
            cb(&block, is_main);
        }
    }
}

fn obc_worker(
    rx: Receiver<ObcCommand>,
    obc: Arc<Mutex<OrphanBlocksContainer>>,
    ingress_tx: Sender<(Arc<Block>, BlockSource)>,
    in_flight: Arc<AtomicUsize>,
    shutdown: ShutdownSignal,
) {
    loop {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(command) => {
                match command {
                    ObcCommand::Add(block, mask) => {
                        obc.lock().add_block(block, mask);
                    },
                    ObcCommand::Submit(hash) => {
                        let released = obc.lock().submit_hash(&hash);
                        if let Some(blocks) = released {
                            for block in blocks {
                                let source = block.source;
                                in_flight.fetch_add(1, Ordering::SeqCst);
                                if ingress_tx.send((block, source)).is_err() {
                                    in_flight.fetch_sub(1, Ordering::SeqCst);
                                }
                            }
                        }
                    },
                }
                in_flight.fetch_sub(1, Ordering::SeqCst);
            },
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if shutdown.is_triggered() {
                    break;
                }
            },
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
}
