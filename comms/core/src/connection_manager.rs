// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    collections::HashMap,
    io::Read,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::unbounded;
use epic_shutdown::{Shutdown, ShutdownSignal};
use log::*;
use parking_lot::RwLock;

use crate::{
    connection::{writer_loop, Connection, ConnectionHandle, ConnectionThreads, PeerId},
    error::CommsError,
    framing::{Frame, Framer},
    pools::WorkerPool,
};

const LOG_TARGET: &str = "comms::connection_manager";
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Invoked on the deserialize pool for every valid inbound frame.
pub type FrameHandler = Arc<dyn Fn(PeerId, Frame) + Send + Sync>;

/// Owns the listener, the per-connection reader/writer threads, the serialize/deserialize pools
/// and the peer registry.
pub struct ConnectionManager {
    magic: u32,
    connections: Arc<RwLock<HashMap<PeerId, ConnectionHandle>>>,
    inbound_count: Arc<AtomicUsize>,
    outbound_count: Arc<AtomicUsize>,
    serialize_pool: WorkerPool,
    deserialize_pool: Arc<WorkerPool>,
    handler: Arc<RwLock<Option<FrameHandler>>>,
    shutdown: Shutdown,
    listener_handle: parking_lot::Mutex<Option<thread::JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(magic: u32, serialize_workers: usize, deserialize_workers: usize) -> Self {
        Self {
            magic,
            connections: Arc::new(RwLock::new(HashMap::new())),
            inbound_count: Arc::new(AtomicUsize::new(0)),
            outbound_count: Arc::new(AtomicUsize::new(0)),
            serialize_pool: WorkerPool::new("serialize", serialize_workers),
            deserialize_pool: Arc::new(WorkerPool::new("deserialize", deserialize_workers)),
            handler: Arc::new(RwLock::new(None)),
            shutdown: Shutdown::new().keep_alive_on_drop(),
            listener_handle: parking_lot::Mutex::new(None),
        }
    }

    /// Install the inbound dispatch target. Must be set before frames are expected.
    pub fn set_frame_handler(&self, handler: impl Fn(PeerId, Frame) + Send + Sync + 'static) {
        *self.handler.write() = Some(Arc::new(handler));
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }

    pub fn inbound_count(&self) -> usize {
        self.inbound_count.load(Ordering::SeqCst)
    }

    pub fn outbound_count(&self) -> usize {
        self.outbound_count.load(Ordering::SeqCst)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.connections.read().keys().cloned().collect()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connections.read().contains_key(peer)
    }

    /// Bind and start accepting inbound connections.
    pub fn listen(&self, bind_address: &str) -> Result<SocketAddr, CommsError> {
        let listener = TcpListener::bind(bind_address)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        info!(target: LOG_TARGET, "Start listen on {}", local);

        let manager = self.spawn_context();
        let signal = self.shutdown.to_signal();
        *self.listener_handle.lock() = Some(
            thread::Builder::new()
                .name("comms-listener".into())
                .spawn(move || listener_loop(listener, manager, signal))
                .expect("spawn listener"),
        );
        Ok(local)
    }

    /// Dial a remote peer.
    pub fn connect(&self, address: &str) -> Result<PeerId, CommsError> {
        let stream = TcpStream::connect(address)?;
        let remote = stream.peer_addr()?;
        info!(target: LOG_TARGET, "Connected to peer: {}", remote);
        self.register(stream, remote, false)
    }

    /// Serialize and send a frame to one peer via the serialize pool.
    pub fn send(&self, peer: &PeerId, frame: Frame) -> Result<(), CommsError> {
        let connections = self.connections.read();
        let handle = connections.get(peer).ok_or_else(|| CommsError::UnknownPeer(peer.clone()))?;
        let connection = handle.connection.clone();
        drop(connections);
        let magic = self.magic;
        self.serialize_pool.execute(move || {
            let wire = frame.to_wire(magic);
            if connection.send_wire(wire).is_err() {
                debug!(target: LOG_TARGET, "Send to released connection dropped");
            }
        });
        Ok(())
    }

    /// Relay a frame to every connected peer except `skip`, decrementing the countdown. Frames
    /// whose countdown reaches zero are not forwarded.
    pub fn broadcast(&self, frame: Frame, skip: Option<&PeerId>) {
        if frame.countdown == 0 {
            return;
        }
        let mut relayed = frame;
        relayed.countdown -= 1;
        eprintln!("DEBUG broadcast: peers={}", self.peers().len());
        for peer in self.peers() {
            if Some(&peer) == skip {
                continue;
            }
            eprintln!("DEBUG broadcast: sending to peer");
            let r = self.send(&peer, relayed.clone());
            eprintln!("DEBUG broadcast: send result ok={}", r.is_ok());
        }
    }

    /// Release and remove one peer.
    pub fn disconnect(&self, peer: &PeerId) {
        let handle = self.connections.write().remove(peer);
        if let Some(handle) = handle {
            if handle.connection.release() {
                self.decrement(handle.connection.is_inbound());
            }
            let _ = handle.threads.reader.join();
            let _ = handle.threads.writer.join();
        }
    }

    pub fn disconnect_all(&self) {
        let peers = self.peers();
        for peer in peers {
            self.disconnect(&peer);
        }
    }

    /// Stop listening, drop every connection and drain the pools.
    pub fn stop(&self) {
        self.shutdown.trigger();
        if let Some(handle) = self.listener_handle.lock().take() {
            let _ = handle.join();
        }
        self.disconnect_all();
        self.serialize_pool.stop();
        // deserialize pool is shared with reader threads; they are joined by disconnect_all
        info!(target: LOG_TARGET, "Connection manager stopped");
    }

    fn decrement(&self, inbound: bool) {
        if inbound {
            self.inbound_count.fetch_sub(1, Ordering::SeqCst);
        } else {
            self.outbound_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn spawn_context(&self) -> SpawnContext {
        SpawnContext {
            magic: self.magic,
            connections: self.connections.clone(),
            inbound_count: self.inbound_count.clone(),
            outbound_count: self.outbound_count.clone(),
            deserialize_pool: self.deserialize_pool.clone(),
            handler: self.handler.clone(),
            shutdown: self.shutdown.to_signal(),
        }
    }

    fn register(&self, stream: TcpStream, remote: SocketAddr, inbound: bool) -> Result<PeerId, CommsError> {
        register_connection(&self.spawn_context(), stream, remote, inbound)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
struct SpawnContext {
    magic: u32,
    connections: Arc<RwLock<HashMap<PeerId, ConnectionHandle>>>,
    inbound_count: Arc<AtomicUsize>,
    outbound_count: Arc<AtomicUsize>,
    deserialize_pool: Arc<WorkerPool>,
    handler: Arc<RwLock<Option<FrameHandler>>>,
    shutdown: ShutdownSignal,
}

fn listener_loop(listener: TcpListener, ctx: SpawnContext, shutdown: ShutdownSignal) {
    loop {
        if shutdown.is_triggered() {
            break;
        }
        match listener.accept() {
            Ok((stream, remote)) => {
                info!(target: LOG_TARGET, "Socket accepted: {}", remote);
                if let Err(e) = register_connection(&ctx, stream, remote, true) {
                    warn!(target: LOG_TARGET, "Failed to register inbound connection: {}", e);
                }
            },
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(20));
            },
            Err(e) => {
                warn!(target: LOG_TARGET, "Accept failed: {}", e);
                thread::sleep(Duration::from_millis(100));
            },
        }
    }
}

fn register_connection(
    ctx: &SpawnContext,
    stream: TcpStream,
    remote: SocketAddr,
    inbound: bool,
) -> Result<PeerId, CommsError> {
    eprintln!("DEBUG register_connection start inbound={}", inbound);
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(Duration::from_millis(100)))?;
    eprintln!("DEBUG after set_read_timeout");

    let (writer_tx, writer_rx) = unbounded();
    let write_stream = stream.try_clone()?;
    eprintln!("DEBUG after try_clone write_stream");
    let connection = Arc::new(Connection::new(stream.try_clone()?, remote, inbound, writer_tx));
    eprintln!("DEBUG after Connection::new");
    let peer_id = connection.peer_id();

    if inbound {
        ctx.inbound_count.fetch_add(1, Ordering::SeqCst);
    } else {
        ctx.outbound_count.fetch_add(1, Ordering::SeqCst);
    }

    let writer = thread::Builder::new()
        .name(format!("comms-writer-{}", remote))
        .spawn(move || writer_loop(write_stream, writer_rx))
        .expect("spawn writer");
    eprintln!("DEBUG after writer spawn");

    let reader = {
        let ctx = ctx.clone();
        let connection = connection.clone();
        thread::Builder::new()
            .name(format!("comms-reader-{}", remote))
            .spawn(move || reader_loop(stream, connection, ctx))
            .expect("spawn reader")
    };
    eprintln!("DEBUG after reader spawn");

    ctx.connections.write().insert(peer_id.clone(), ConnectionHandle {
        connection,
        threads: ConnectionThreads { reader, writer },
    });
    eprintln!("DEBUG after insert");
    Ok(peer_id)
}

/// Per-connection read loop: bytes through the framer, completed frames onto the deserialize
/// pool for dispatch.
fn reader_loop(mut stream: TcpStream, connection: Arc<Connection>, ctx: SpawnContext) {
    let mut framer = Framer::new(ctx.magic);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let peer_id = connection.peer_id();

    loop {
        if ctx.shutdown.is_triggered() || !connection.is_valid() {
            break;
        }
        match stream.read(&mut buf) {
            Ok(0) => {
                info!(target: LOG_TARGET, "Socket closed: {}", peer_id);
                break;
            },
            Ok(n) => {
                for frame in framer.feed(&buf[..n]) {
                    let handler = ctx.handler.read().clone();
                    if let Some(handler) = handler {
                        let peer_id = peer_id.clone();
                        ctx.deserialize_pool.execute(move || handler(peer_id, frame));
                    }
                }
            },
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {},
            Err(e) => {
                info!(target: LOG_TARGET, "Socket exception: {} error {}", peer_id, e);
                break;
            },
        }
    }

    if connection.release() {
        if connection.is_inbound() {
            ctx.inbound_count.fetch_sub(1, Ordering::SeqCst);
        } else {
            ctx.outbound_count.fetch_sub(1, Ordering::SeqCst);
        }
    }
    // drop our own registry entry; the writer exits once its queue sender is gone
    ctx.connections.write().remove(&peer_id);
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;

    const MAGIC: u32 = 0x4550_4943;

    fn wait_for(predicate: impl Fn() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn connect_send_receive_roundtrip() {
        let server = ConnectionManager::new(MAGIC, 1, 1);
        let received: Arc<Mutex<Vec<Frame>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let received = received.clone();
            server.set_frame_handler(move |_peer, frame| {
                received.lock().unwrap().push(frame);
            });
        }
        let addr = server.listen("127.0.0.1:0").unwrap();

        let client = ConnectionManager::new(MAGIC, 1, 1);
        client.set_frame_handler(|_, _| {});
        let server_peer = client.connect(&addr.to_string()).unwrap();

        let frame = Frame::new(3, 200, b"hello epic".to_vec());
        client.send(&server_peer, frame.clone()).unwrap();

        wait_for(|| !received.lock().unwrap().is_empty());
        assert_eq!(received.lock().unwrap()[0], frame);
        assert_eq!(client.outbound_count(), 1);
        wait_for(|| server.inbound_count() == 1);
    }

    #[test]
    fn disconnect_decrements_exactly_once() {
        let server = ConnectionManager::new(MAGIC, 1, 1);
        server.set_frame_handler(|_, _| {});
        let addr = server.listen("127.0.0.1:0").unwrap();

        let client = ConnectionManager::new(MAGIC, 1, 1);
        client.set_frame_handler(|_, _| {});
        let peer = client.connect(&addr.to_string()).unwrap();
        assert_eq!(client.outbound_count(), 1);

        client.disconnect(&peer);
        assert_eq!(client.outbound_count(), 0);
        // releasing again is a no-op
        client.disconnect(&peer);
        assert_eq!(client.outbound_count(), 0);
        assert!(!client.is_connected(&peer));
    }

    #[test]
    fn broadcast_decrements_countdown_and_skips_origin() {
        let server = ConnectionManager::new(MAGIC, 1, 1);
        let received: Arc<Mutex<Vec<Frame>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let received = received.clone();
            server.set_frame_handler(move |_peer, frame| {
                received.lock().unwrap().push(frame);
            });
        }
        let addr = server.listen("127.0.0.1:0").unwrap();

        let client = ConnectionManager::new(MAGIC, 1, 1);
        client.set_frame_handler(|_, _| {});
        client.connect(&addr.to_string()).unwrap();
        eprintln!("DEBUG test: connected");

        client.broadcast(Frame::new(1, 2, b"relayed".to_vec()), None);
        eprintln!("DEBUG test: broadcast sent");
        wait_for(|| !received.lock().unwrap().is_empty());
        eprintln!("DEBUG test: wait_for done");
        assert_eq!(received.lock().unwrap()[0].countdown, 1);

        // countdown zero is never forwarded
        client.broadcast(Frame::new(1, 0, b"dead".to_vec()), None);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(received.lock().unwrap().len(), 1);
    }
}
