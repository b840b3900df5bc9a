// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! Wires storage, the DAG, the mempool, the miner and the comms stack together, then parks until
//! interrupted.

use std::sync::Arc;

use epic_common::{set_params, ExitCode, NodeConfig};
use epic_comms::ConnectionManager;
use epic_core::{
    blocks::BlockSource,
    chain_storage::BlockStore,
    dag::DagManager,
    mempool::Mempool,
    messages::{NetMessage, DEFAULT_COUNTDOWN},
    mining::Miner,
};
use epic_shutdown::Shutdown;
use log::*;

const LOG_TARGET: &str = "epic::node";

pub fn run(config: NodeConfig) -> Result<(), ExitCode> {
    let params = set_params(config.network);
    if params.network != config.network {
        // a different network was installed earlier in this process
        return Err(ExitCode::Params);
    }

    let store = Arc::new(BlockStore::open(&config.storage).map_err(|e| {
        error!(target: LOG_TARGET, "Storage initialization failed: {}", e);
        ExitCode::Storage
    })?);

    let dag = Arc::new(DagManager::start(store).map_err(|e| {
        error!(target: LOG_TARGET, "DAG initialization failed: {}", e);
        ExitCode::Dag
    })?);

    let mempool = Arc::new(Mempool::new(config.mempool.capacity));

    // confirmed level sets release their transactions from the pool
    {
        let mempool = mempool.clone();
        dag.register_on_level_set_confirmed(move |event| {
            if !event.is_main_chain {
                return;
            }
            for hash in &event.milestone.level_set {
                if let Some(vertex) = event.milestone.vertices.get(hash) {
                    let vertex = vertex.read();
                    for (i, tx) in vertex.block.transactions().iter().enumerate() {
                        let valid = matches!(
                            vertex.validity.get(i),
                            Some(epic_core::dag::TxValidity::Valid)
                        );
                        mempool.release_tx_from_confirmed(tx, valid);
                    }
                }
            }
        });
    }

    let comms = Arc::new(ConnectionManager::new(
        params.magic,
        config.comms.serialize_workers,
        config.comms.deserialize_workers,
    ));

    // inbound frames decode on the deserialize pool and dispatch into the DAG and mempool
    {
        let dag = dag.clone();
        let mempool = mempool.clone();
        let weak_comms = Arc::downgrade(&comms);
        comms.set_frame_handler(move |peer, frame| {
            let message = match NetMessage::from_frame(&frame) {
                Ok(message) => message,
                Err(e) => {
                    debug!(target: LOG_TARGET, "Dropping malformed frame from {}: {}", peer, e);
                    return;
                },
            };
            let reply = |message: NetMessage| {
                if let Some(comms) = weak_comms.upgrade() {
                    let _ = comms.send(&peer, message.to_frame(DEFAULT_COUNTDOWN));
                }
            };
            match message {
                NetMessage::Block(block) => dag.add_new_block(block, BlockSource::Network),
                NetMessage::Bundle { blocks, .. } => {
                    for block in blocks {
                        dag.add_new_block(block, BlockSource::Network);
                    }
                },
                NetMessage::Tx(tx) => {
                    let chains = dag.chains().read();
                    let admitted = mempool.receive_tx(tx, |t| chains.best().tx_fits_ledger(t));
                    if !admitted {
                        trace!(target: LOG_TARGET, "Transaction from {} not admitted", peer);
                    }
                },
                NetMessage::Ping { nonce } => reply(NetMessage::Pong { nonce }),
                NetMessage::Version(version) => {
                    debug!(
                        target: LOG_TARGET,
                        "Peer {} is at height {} (client {})", peer, version.current_height, version.client_version
                    );
                    reply(NetMessage::VersionAck);
                },
                NetMessage::GetAddr => {
                    if let Some(comms) = weak_comms.upgrade() {
                        let addresses = comms.peers();
                        let _ = comms.send(&peer, NetMessage::Addr { addresses }.to_frame(DEFAULT_COUNTDOWN));
                    }
                },
                other => {
                    trace!(target: LOG_TARGET, "Unhandled {:?} from {}", other.message_type(), peer);
                },
            }
        });
    }

    comms.listen(&config.comms.bind_address).map_err(|e| {
        error!(target: LOG_TARGET, "Failed to bind {}: {}", config.comms.bind_address, e);
        ExitCode::Dag
    })?;

    let mut miner = Miner::new(dag.clone(), mempool.clone(), config.miner.clone());
    {
        let comms = comms.clone();
        miner.set_relay(move |block| {
            comms.broadcast(NetMessage::Block(block.clone()).to_frame(DEFAULT_COUNTDOWN), None);
        });
    }
    if config.miner.solver_threads > 0 {
        miner.start();
    }

    let shutdown = Shutdown::new();
    let signal = shutdown.to_signal();
    let backup = dag
        .store()
        .start_periodic_backup(std::time::Duration::from_secs(60), shutdown.to_signal());
    stdin_to_shutdown(shutdown);

    info!(target: LOG_TARGET, "Node is up");
    signal.wait();

    info!(target: LOG_TARGET, "Shutting down");
    miner.stop();
    comms.stop();
    let _ = backup.join();
    Ok(())
}

/// Trigger shutdown when stdin closes or delivers a line.
fn stdin_to_shutdown(shutdown: Shutdown) {
    std::thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        shutdown.trigger();
    });
}
