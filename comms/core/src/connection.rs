// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    io::Write,
    net::{SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use crossbeam_channel::Sender;
use log::*;

use crate::error::CommsError;

const LOG_TARGET: &str = "comms::connection";

/// Stable identifier for a peer connection: its remote `ip:port`.
pub type PeerId = String;

/// One live peer connection. The writer thread owns the outbound half of the socket; encoded
/// wire bytes are queued to it and written in a single call per message. Teardown is
/// idempotent: the `valid` flag transitions exactly once under CAS, so the inbound/outbound
/// counters in the manager decrement exactly once.
pub struct Connection {
    remote: SocketAddr,
    inbound: bool,
    valid: AtomicBool,
    writer_tx: Sender<Vec<u8>>,
    stream: TcpStream,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, remote: SocketAddr, inbound: bool, writer_tx: Sender<Vec<u8>>) -> Self {
        Self {
            remote,
            inbound,
            valid: AtomicBool::new(true),
            writer_tx,
            stream,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.remote.to_string()
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    /// Queue already-serialized wire bytes for the writer thread.
    pub fn send_wire(&self, wire: Vec<u8>) -> Result<(), CommsError> {
        if !self.is_valid() {
            return Err(CommsError::ConnectionInvalid);
        }
        self.writer_tx.send(wire).map_err(|_| CommsError::ConnectionInvalid)
    }

    /// Mark the connection released. Returns true for the caller that performed the transition;
    /// later calls are no-ops.
    pub fn release(&self) -> bool {
        let released = self
            .valid
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if released {
            debug!(target: LOG_TARGET, "Connection to {} released", self.remote);
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
        }
        released
    }
}

/// Writer loop: drains the outbound queue, one write per message.
pub(crate) fn writer_loop(mut stream: TcpStream, rx: crossbeam_channel::Receiver<Vec<u8>>) {
    while let Ok(wire) = rx.recv() {
        if let Err(e) = stream.write_all(&wire).and_then(|_| stream.flush()) {
            debug!(target: LOG_TARGET, "Write failed: {}", e);
            break;
        }
    }
}

pub(crate) struct ConnectionThreads {
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

pub(crate) struct ConnectionHandle {
    pub connection: Arc<Connection>,
    pub threads: ConnectionThreads,
}
