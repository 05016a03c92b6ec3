//! Point-to-point and request/response message channels.
//!
//! An [`IpcChannel`] is attached to exactly one endpoint, either by binding it
//! or by connecting it to a peer that is already bound:
//!
//! | Type     | Attach    | Peers | Send                      |
//! | :------- | :-------- | :---- | :------------------------ |
//! | `Pair`   | bind or connect | 1 | `send`                |
//! | `Router` | bind      | many  | `send_to(peer, ..)`       |
//! | `Dealer` | connect   | 1     | `send`                    |
//!
//! Messages are opaque [`Bytes`]. Every received message is wrapped in an
//! [`Envelope`] naming the peer it came from, so a router can address its reply.
//!
//! # Transports
//!
//! `inproc://` endpoints live in an [`IpcContext`]. Binding registers the name
//! with the context; connecting looks it up, so connecting before the peer is
//! bound fails with `ConnectionRefused` rather than silently waiting.
//!
//! `tcp://` endpoints use real sockets. Each message is framed with a 4-byte
//! big-endian length prefix. The channel owns its socket threads (one acceptor
//! per bound endpoint, one reader per connection) and joins them on drop.

use super::endpoint::Endpoint;
use crate::error::IpcError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Select, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Identifies the peer a message came from, or the peer to send a reply to.
pub type PeerId = u64;

/// Peer id under which a connected channel sees the bound side.
pub const BOUND_PEER: PeerId = 0;

/// Upper bound on a single tcp frame.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const ACCEPT_POLL: Duration = Duration::from_millis(10);
const READ_POLL: Duration = Duration::from_millis(50);

/// Longest a tcp send may block on a peer that is not reading. The peer is
/// dropped when this expires, since a partial frame cannot be resumed.
const WRITE_TIMEOUT: Duration = Duration::from_millis(250);

/// Channel socket type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    /// Exactly one peer, either side may bind.
    Pair,
    /// Bound side of request/response; replies are addressed by peer id.
    Router,
    /// Connecting side of request/response.
    Dealer,
}

impl ChannelType {
    fn name(self) -> &'static str {
        match self {
            ChannelType::Pair => "pair",
            ChannelType::Router => "router",
            ChannelType::Dealer => "dealer",
        }
    }
}

/// A received message together with the peer that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Sender of the message.
    pub peer: PeerId,
    /// Message body
    pub payload: Bytes,
}

// =============================================================================
// Peers
// =============================================================================

#[derive(Clone)]
enum PeerSender {
    Inproc(Sender<Envelope>),
    /// Serializes writers so frames from different threads never interleave.
    Tcp(Arc<Mutex<TcpStream>>),
}

/// Outbound route to one peer.
#[derive(Clone)]
struct PeerLink {
    sender: PeerSender,
    /// Our identity as seen by that peer; stamped on inproc envelopes.
    stamp: PeerId,
}

impl PeerLink {
    fn deliver(&self, payload: Bytes) -> Result<(), IpcError> {
        match &self.sender {
            PeerSender::Inproc(tx) => tx
                .send(Envelope {
                    peer: self.stamp,
                    payload,
                })
                .map_err(|_| IpcError::Closed),
            PeerSender::Tcp(stream) => {
                write_frame(&stream.lock(), &payload).map_err(IpcError::Send)
            }
        }
    }

    fn shutdown(&self) {
        if let PeerSender::Tcp(stream) = &self.sender {
            let _ = stream.lock().shutdown(std::net::Shutdown::Both);
        }
    }
}

fn tcp_link(stream: TcpStream) -> PeerLink {
    PeerLink {
        sender: PeerSender::Tcp(Arc::new(Mutex::new(stream))),
        stamp: BOUND_PEER,
    }
}

#[derive(Default)]
struct PeerTable {
    links: Mutex<HashMap<PeerId, PeerLink>>,
    next_id: AtomicU64,
}

impl PeerTable {
    /// Attach a new peer, returning its id. `None` if a pair channel already has one.
    fn attach(&self, kind: ChannelType, link: PeerLink) -> Option<PeerId> {
        let mut links = self.links.lock();
        if kind == ChannelType::Pair && !links.is_empty() {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        links.insert(id, link);
        Some(id)
    }

    /// Copy of the route to `id`, taken so the table is not locked while sending.
    fn get(&self, id: PeerId) -> Option<PeerLink> {
        self.links.lock().get(&id).cloned()
    }

    fn first(&self) -> Option<(PeerId, PeerLink)> {
        self.links
            .lock()
            .iter()
            .next()
            .map(|(id, link)| (*id, link.clone()))
    }

    fn insert(&self, id: PeerId, link: PeerLink) {
        self.links.lock().insert(id, link);
    }

    fn detach(&self, id: PeerId) {
        if let Some(link) = self.links.lock().remove(&id) {
            link.shutdown();
        }
    }

    fn clear(&self) {
        for (_, link) in self.links.lock().drain() {
            link.shutdown();
        }
    }

    fn len(&self) -> usize {
        self.links.lock().len()
    }
}

// =============================================================================
// Context
// =============================================================================

#[derive(Clone)]
struct InprocBinding {
    kind: ChannelType,
    inbound: Sender<Envelope>,
    peers: Arc<PeerTable>,
}

#[derive(Default)]
struct ContextInner {
    inproc: Mutex<HashMap<String, InprocBinding>>,
}

/// In-process address space for `inproc://` endpoints.
///
/// Cloning is cheap and yields a handle to the same address space. Channels
/// created from different contexts cannot see each other's inproc names.
#[derive(Clone, Default)]
pub struct IpcContext {
    inner: Arc<ContextInner>,
}

static GLOBAL_CONTEXT: Lazy<IpcContext> = Lazy::new(IpcContext::new);

impl IpcContext {
    /// Create an empty context
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide default context.
    #[must_use]
    pub fn global() -> Self {
        GLOBAL_CONTEXT.clone()
    }

    /// Whether an inproc name is currently bound in this context.
    #[must_use]
    pub fn is_bound(&self, name: &str) -> bool {
        self.inner.inproc.lock().contains_key(name)
    }

    fn bind_inproc(&self, name: &str, binding: InprocBinding) -> Result<(), IpcError> {
        let mut inproc = self.inner.inproc.lock();
        if inproc.contains_key(name) {
            return Err(IpcError::AddressInUse(format!("inproc://{name}")));
        }
        inproc.insert(name.to_string(), binding);
        Ok(())
    }

    fn lookup_inproc(&self, name: &str) -> Option<InprocBinding> {
        self.inner.inproc.lock().get(name).cloned()
    }

    fn unbind_inproc(&self, name: &str) {
        self.inner.inproc.lock().remove(name);
    }
}

impl std::fmt::Debug for IpcContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.inner.inproc.lock().keys().cloned().collect();
        f.debug_struct("IpcContext").field("inproc", &names).finish()
    }
}

// =============================================================================
// Channel
// =============================================================================

enum Attachment {
    Detached,
    Bound(Endpoint),
    Connected {
        endpoint: Endpoint,
        /// Peer table of the inproc binder and our id in it.
        remote: Option<(Arc<PeerTable>, PeerId)>,
    },
}

/// A message channel attached to one endpoint.
pub struct IpcChannel {
    kind: ChannelType,
    context: IpcContext,
    inbound_tx: Sender<Envelope>,
    inbound_rx: Receiver<Envelope>,
    peers: Arc<PeerTable>,
    attachment: Attachment,
    closed: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl IpcChannel {
    /// Create a detached channel in `context`.
    #[must_use]
    pub fn new(kind: ChannelType, context: &IpcContext) -> Self {
        let (inbound_tx, inbound_rx) = unbounded();
        Self {
            kind,
            context: context.clone(),
            inbound_tx,
            inbound_rx,
            peers: Arc::new(PeerTable::default()),
            attachment: Attachment::Detached,
            closed: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        }
    }

    /// Bind the channel to `endpoint` so peers can connect to it.
    pub fn bind(&mut self, endpoint: &str) -> Result<(), IpcError> {
        self.ensure_detached()?;
        if self.kind == ChannelType::Dealer {
            return Err(self.unsupported("bind"));
        }
        let ep = Endpoint::parse(endpoint)?;

        match &ep {
            Endpoint::Inproc(name) => self.context.bind_inproc(
                name,
                InprocBinding {
                    kind: self.kind,
                    inbound: self.inbound_tx.clone(),
                    peers: Arc::clone(&self.peers),
                },
            )?,
            Endpoint::Tcp { port, .. } => {
                let addr = ep.bind_addr().unwrap_or_default();
                let bind_error = |source| IpcError::Bind {
                    endpoint: endpoint.to_string(),
                    source,
                };
                let listener = TcpListener::bind(&addr).map_err(bind_error)?;
                listener.set_nonblocking(true).map_err(bind_error)?;
                self.spawn_acceptor(listener, *port).map_err(bind_error)?;
            }
        }

        debug!(kind = self.kind.name(), endpoint = %ep, "Channel bound");
        self.attachment = Attachment::Bound(ep);
        Ok(())
    }

    /// Connect the channel to a peer already bound at `endpoint`.
    pub fn connect(&mut self, endpoint: &str) -> Result<(), IpcError> {
        self.ensure_detached()?;
        if self.kind == ChannelType::Router {
            return Err(self.unsupported("connect"));
        }
        let ep = Endpoint::parse(endpoint)?;

        let remote = match &ep {
            Endpoint::Inproc(name) => Some(self.connect_inproc(name, endpoint)?),
            Endpoint::Tcp { .. } => {
                self.connect_tcp(&ep.connect_addr()?, endpoint)?;
                None
            }
        };

        debug!(kind = self.kind.name(), endpoint = %ep, "Channel connected");
        self.attachment = Attachment::Connected {
            endpoint: ep,
            remote,
        };
        Ok(())
    }

    fn connect_inproc(
        &mut self,
        name: &str,
        endpoint: &str,
    ) -> Result<(Arc<PeerTable>, PeerId), IpcError> {
        let refused = |reason: &str| IpcError::ConnectionRefused {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        };
        let binding = self
            .context
            .lookup_inproc(name)
            .ok_or_else(|| refused("no channel is bound to this endpoint"))?;

        let id = binding
            .peers
            .attach(
                binding.kind,
                PeerLink {
                    sender: PeerSender::Inproc(self.inbound_tx.clone()),
                    stamp: BOUND_PEER,
                },
            )
            .ok_or_else(|| refused("pair endpoint already has a peer"))?;

        self.peers.insert(
            BOUND_PEER,
            PeerLink {
                sender: PeerSender::Inproc(binding.inbound.clone()),
                stamp: id,
            },
        );
        Ok((binding.peers, id))
    }

    fn connect_tcp(&mut self, addr: &str, endpoint: &str) -> Result<(), IpcError> {
        let refused = |e: std::io::Error| IpcError::ConnectionRefused {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        };
        let stream = TcpStream::connect(addr).map_err(refused)?;
        let write_half = writer_for(&stream).map_err(refused)?;
        self.peers.insert(BOUND_PEER, tcp_link(write_half));

        let inbound = self.inbound_tx.clone();
        let closed = Arc::clone(&self.closed);
        let peers = Arc::clone(&self.peers);
        let handle = thread::Builder::new()
            .name("ipc-tcp-reader".to_string())
            .spawn(move || {
                read_loop(stream, BOUND_PEER, &inbound, &closed);
                peers.detach(BOUND_PEER);
            })
            .map_err(refused)?;
        self.workers.push(handle);
        Ok(())
    }

    fn spawn_acceptor(&mut self, listener: TcpListener, port: u16) -> std::io::Result<()> {
        let kind = self.kind;
        let peers = Arc::clone(&self.peers);
        let inbound = self.inbound_tx.clone();
        let closed = Arc::clone(&self.closed);
        let handle = thread::Builder::new()
            .name(format!("ipc-accept-{port}"))
            .spawn(move || accept_loop(listener, kind, peers, inbound, closed))?;
        self.workers.push(handle);
        Ok(())
    }

    /// Send to the single peer of a pair or dealer channel.
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<(), IpcError> {
        if self.kind == ChannelType::Router {
            return Err(self.unsupported("send without a peer id"));
        }
        let (peer, link) = self.peers.first().ok_or(IpcError::NotConnected)?;
        self.deliver(peer, &link, payload.into())
    }

    /// Send to a specific peer, typically the sender of a request.
    pub fn send_to(&self, peer: PeerId, payload: impl Into<Bytes>) -> Result<(), IpcError> {
        let link = self.peers.get(peer).ok_or(IpcError::UnknownPeer(peer))?;
        self.deliver(peer, &link, payload.into())
    }

    fn deliver(&self, peer: PeerId, link: &PeerLink, payload: Bytes) -> Result<(), IpcError> {
        let sent = link.deliver(payload);
        if let Err(IpcError::Send(e)) = &sent {
            warn!(peer, error = %e, "Dropping tcp peer after failed send");
            self.peers.detach(peer);
        }
        sent
    }

    /// Block until a message arrives.
    pub fn recv(&self) -> Result<Envelope, IpcError> {
        self.inbound_rx.recv().map_err(|_| IpcError::Closed)
    }

    /// Take a pending message without blocking.
    #[must_use]
    pub fn try_recv(&self) -> Option<Envelope> {
        self.inbound_rx.try_recv().ok()
    }

    /// Wait up to `timeout` for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Envelope, IpcError> {
        self.inbound_rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => IpcError::Timeout,
            RecvTimeoutError::Disconnected => IpcError::Closed,
        })
    }

    /// Wait up to `timeout` for a message to become readable without consuming it.
    #[must_use]
    pub fn poll(&self, timeout: Duration) -> bool {
        if !self.inbound_rx.is_empty() {
            return true;
        }
        let mut sel = Select::new();
        sel.recv(&self.inbound_rx);
        sel.ready_timeout(timeout).is_ok()
    }

    /// Socket type of this channel
    #[must_use]
    pub fn kind(&self) -> ChannelType {
        self.kind
    }

    /// Endpoint the channel is bound or connected to, as given to `bind`/`connect`.
    #[must_use]
    pub fn endpoint(&self) -> Option<String> {
        match &self.attachment {
            Attachment::Detached => None,
            Attachment::Bound(ep) | Attachment::Connected { endpoint: ep, .. } => {
                Some(ep.to_string())
            }
        }
    }

    /// Whether the channel is bound and open
    #[must_use]
    pub fn is_bound(&self) -> bool {
        matches!(self.attachment, Attachment::Bound(_)) && !self.is_closed()
    }

    /// Whether the channel is connected and open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self.attachment, Attachment::Connected { .. }) && !self.is_closed()
    }

    /// Whether [`close`](Self::close) has run
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of peers currently reachable from this channel.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Receiver used by the reactor to wait for readability.
    pub(crate) fn readiness(&self) -> Receiver<Envelope> {
        self.inbound_rx.clone()
    }

    pub(crate) fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    /// Detach from the endpoint, release its name and stop socket threads.
    pub fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.attachment {
            Attachment::Bound(Endpoint::Inproc(name)) => self.context.unbind_inproc(name),
            Attachment::Connected {
                remote: Some((table, id)),
                ..
            } => table.detach(*id),
            _ => {}
        }
        self.peers.clear();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("IPC socket thread panicked");
            }
        }
        if let Some(endpoint) = self.endpoint() {
            debug!(kind = self.kind.name(), %endpoint, "Channel closed");
        }
    }

    fn ensure_detached(&self) -> Result<(), IpcError> {
        if self.is_closed() {
            return Err(IpcError::Closed);
        }
        match self.endpoint() {
            Some(endpoint) => Err(IpcError::AlreadyAttached(endpoint)),
            None => Ok(()),
        }
    }

    fn unsupported(&self, operation: &'static str) -> IpcError {
        IpcError::UnsupportedOperation {
            kind: self.kind.name(),
            operation,
        }
    }
}

impl Drop for IpcChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for IpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcChannel")
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint())
            .field("peers", &self.peer_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// =============================================================================
// TCP transport
// =============================================================================

fn accept_loop(
    listener: TcpListener,
    kind: ChannelType,
    peers: Arc<PeerTable>,
    inbound: Sender<Envelope>,
    closed: Arc<AtomicBool>,
) {
    let mut readers = Vec::new();

    while !closed.load(Ordering::Acquire) {
        reap_finished(&mut readers);
        match listener.accept() {
            Ok((stream, addr)) => {
                let write_half = match stream
                    .set_nonblocking(false)
                    .and_then(|()| writer_for(&stream))
                {
                    Ok(write_half) => write_half,
                    Err(e) => {
                        warn!(%addr, error = %e, "Failed to prepare accepted connection");
                        continue;
                    }
                };
                let Some(id) = peers.attach(kind, tcp_link(write_half)) else {
                    warn!(%addr, "Rejecting connection: pair channel already has a peer");
                    let _ = stream.shutdown(std::net::Shutdown::Both);
                    continue;
                };
                debug!(%addr, peer = id, "Accepted connection");

                let reader_peers = Arc::clone(&peers);
                let reader_inbound = inbound.clone();
                let reader_closed = Arc::clone(&closed);
                let spawned = thread::Builder::new()
                    .name(format!("ipc-tcp-peer-{id}"))
                    .spawn(move || {
                        read_loop(stream, id, &reader_inbound, &reader_closed);
                        reader_peers.detach(id);
                    });
                match spawned {
                    Ok(handle) => readers.push(handle),
                    Err(e) => {
                        warn!(peer = id, error = %e, "Failed to spawn connection reader");
                        peers.detach(id);
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!(error = %e, "Accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }

    for reader in readers {
        let _ = reader.join();
    }
}

/// Drop handles of reader threads whose connection has already ended.
fn reap_finished(readers: &mut Vec<JoinHandle<()>>) {
    readers.retain(|reader| !reader.is_finished());
}

/// Write half of a connection, with sends bounded by [`WRITE_TIMEOUT`].
fn writer_for(stream: &TcpStream) -> std::io::Result<TcpStream> {
    let write_half = stream.try_clone()?;
    write_half.set_write_timeout(Some(WRITE_TIMEOUT))?;
    Ok(write_half)
}

fn read_loop(mut stream: TcpStream, peer: PeerId, inbound: &Sender<Envelope>, closed: &AtomicBool) {
    if let Err(e) = stream.set_read_timeout(Some(READ_POLL)) {
        warn!(peer, error = %e, "Failed to set read timeout");
        return;
    }
    let mut assembler = FrameAssembler::default();
    let mut chunk = [0u8; 8192];

    while !closed.load(Ordering::Acquire) {
        match stream.read(&mut chunk) {
            Ok(0) => {
                trace!(peer, "Peer closed connection");
                return;
            }
            Ok(n) => {
                assembler.extend(&chunk[..n]);
                loop {
                    match assembler.next_frame() {
                        Ok(Some(payload)) => {
                            if inbound.send(Envelope { peer, payload }).is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(peer, error = %e, "Dropping connection with corrupt framing");
                            return;
                        }
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                debug!(peer, error = %e, "Connection read failed");
                return;
            }
        }
    }
}

/// Reassembles length-prefixed frames from a byte stream.
#[derive(Default)]
struct FrameAssembler {
    buf: BytesMut,
}

impl FrameAssembler {
    fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn next_frame(&mut self) -> std::io::Result<Option<Bytes>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds limit"),
            ));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        self.buf.advance(4);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

fn write_frame(mut stream: &TcpStream, payload: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_LEN)
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "frame too large"))?;
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(len);
    frame.extend_from_slice(payload);
    stream.write_all(&frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn inproc_pair_exchanges_messages_both_ways() {
        let ctx = IpcContext::new();
        let mut bound = IpcChannel::new(ChannelType::Pair, &ctx);
        bound.bind("inproc://pair").unwrap();
        let mut peer = IpcChannel::new(ChannelType::Pair, &ctx);
        peer.connect("inproc://pair").unwrap();

        peer.send(&b"ping"[..]).unwrap();
        let msg = bound.recv_timeout(WAIT).unwrap();
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
        assert_ne!(msg.peer, BOUND_PEER);

        bound.send(&b"pong"[..]).unwrap();
        let reply = peer.recv_timeout(WAIT).unwrap();
        assert_eq!(reply.payload, Bytes::from_static(b"pong"));
        assert_eq!(reply.peer, BOUND_PEER);
    }

    #[test]
    fn inproc_preserves_fifo_order() {
        let ctx = IpcContext::new();
        let mut bound = IpcChannel::new(ChannelType::Pair, &ctx);
        bound.bind("inproc://fifo").unwrap();
        let mut peer = IpcChannel::new(ChannelType::Pair, &ctx);
        peer.connect("inproc://fifo").unwrap();

        for i in 0..100u32 {
            peer.send(i.to_be_bytes().to_vec()).unwrap();
        }
        for i in 0..100u32 {
            let msg = bound.recv_timeout(WAIT).unwrap();
            assert_eq!(&msg.payload[..], &i.to_be_bytes());
        }
    }

    #[test]
    fn connect_before_bind_is_refused() {
        let ctx = IpcContext::new();
        let mut peer = IpcChannel::new(ChannelType::Pair, &ctx);
        assert!(matches!(
            peer.connect("inproc://nobody"),
            Err(IpcError::ConnectionRefused { .. })
        ));
        // A failed connect leaves the channel detached and reusable.
        assert!(peer.endpoint().is_none());
    }

    #[test]
    fn second_bind_of_inproc_name_fails_until_released() {
        let ctx = IpcContext::new();
        let mut first = IpcChannel::new(ChannelType::Pair, &ctx);
        first.bind("inproc://dup").unwrap();

        let mut second = IpcChannel::new(ChannelType::Pair, &ctx);
        assert!(matches!(
            second.bind("inproc://dup"),
            Err(IpcError::AddressInUse(_))
        ));

        drop(first);
        assert!(!ctx.is_bound("dup"));
        second.bind("inproc://dup").unwrap();
    }

    #[test]
    fn contexts_are_isolated() {
        let a = IpcContext::new();
        let b = IpcContext::new();
        let mut bound = IpcChannel::new(ChannelType::Pair, &a);
        bound.bind("inproc://shared_name").unwrap();
        let mut other = IpcChannel::new(ChannelType::Pair, &b);
        other.bind("inproc://shared_name").unwrap();
    }

    #[test]
    fn pair_accepts_a_single_peer() {
        let ctx = IpcContext::new();
        let mut bound = IpcChannel::new(ChannelType::Pair, &ctx);
        bound.bind("inproc://single").unwrap();
        let mut first = IpcChannel::new(ChannelType::Pair, &ctx);
        first.connect("inproc://single").unwrap();
        let mut second = IpcChannel::new(ChannelType::Pair, &ctx);
        assert!(matches!(
            second.connect("inproc://single"),
            Err(IpcError::ConnectionRefused { .. })
        ));

        drop(first);
        assert_eq!(bound.peer_count(), 0);
        second.connect("inproc://single").unwrap();
    }

    #[test]
    fn router_replies_to_the_requesting_peer() {
        let ctx = IpcContext::new();
        let mut router = IpcChannel::new(ChannelType::Router, &ctx);
        router.bind("inproc://router").unwrap();
        let mut a = IpcChannel::new(ChannelType::Dealer, &ctx);
        a.connect("inproc://router").unwrap();
        let mut b = IpcChannel::new(ChannelType::Dealer, &ctx);
        b.connect("inproc://router").unwrap();

        b.send(&b"from b"[..]).unwrap();
        let request = router.recv_timeout(WAIT).unwrap();
        router.send_to(request.peer, &b"to b"[..]).unwrap();

        assert_eq!(b.recv_timeout(WAIT).unwrap().payload, Bytes::from_static(b"to b"));
        assert!(a.try_recv().is_none());
        assert!(matches!(router.send(&b"x"[..]), Err(IpcError::UnsupportedOperation { .. })));
        assert!(matches!(router.send_to(999, &b"x"[..]), Err(IpcError::UnknownPeer(999))));
    }

    #[test]
    fn send_without_peer_is_not_connected() {
        let ctx = IpcContext::new();
        let mut bound = IpcChannel::new(ChannelType::Pair, &ctx);
        bound.bind("inproc://lonely").unwrap();
        assert!(matches!(bound.send(&b"x"[..]), Err(IpcError::NotConnected)));
    }

    #[test]
    fn channel_attaches_only_once() {
        let ctx = IpcContext::new();
        let mut bound = IpcChannel::new(ChannelType::Pair, &ctx);
        bound.bind("inproc://once").unwrap();
        assert!(matches!(
            bound.bind("inproc://twice"),
            Err(IpcError::AlreadyAttached(_))
        ));
        assert!(matches!(
            bound.connect("inproc://once"),
            Err(IpcError::AlreadyAttached(_))
        ));
    }

    #[test]
    fn malformed_endpoint_is_rejected_without_attaching() {
        let ctx = IpcContext::new();
        let mut channel = IpcChannel::new(ChannelType::Router, &ctx);
        assert!(matches!(
            channel.bind("tcp:/broken"),
            Err(IpcError::InvalidEndpoint { .. })
        ));
        assert!(channel.endpoint().is_none());
    }

    #[test]
    fn poll_reports_readability_without_consuming() {
        let ctx = IpcContext::new();
        let mut bound = IpcChannel::new(ChannelType::Pair, &ctx);
        bound.bind("inproc://poll").unwrap();
        let mut peer = IpcChannel::new(ChannelType::Pair, &ctx);
        peer.connect("inproc://poll").unwrap();

        assert!(!bound.poll(Duration::from_millis(10)));
        peer.send(&b"x"[..]).unwrap();
        assert!(bound.poll(WAIT));
        assert!(bound.poll(Duration::ZERO));
        assert!(bound.try_recv().is_some());
        assert!(matches!(
            bound.recv_timeout(Duration::from_millis(10)),
            Err(IpcError::Timeout)
        ));
    }

    #[test]
    fn tcp_router_and_dealer_round_trip() {
        let ctx = IpcContext::new();
        let port = ephemeral_port();
        let mut router = IpcChannel::new(ChannelType::Router, &ctx);
        router.bind(&format!("tcp://*:{port}")).unwrap();
        let mut dealer = IpcChannel::new(ChannelType::Dealer, &ctx);
        dealer.connect(&format!("tcp://127.0.0.1:{port}")).unwrap();

        dealer.send(vec![1u8; 20_000]).unwrap();
        let request = router.recv_timeout(WAIT).unwrap();
        assert_eq!(request.payload.len(), 20_000);

        router.send_to(request.peer, &b"ok"[..]).unwrap();
        assert_eq!(dealer.recv_timeout(WAIT).unwrap().payload, Bytes::from_static(b"ok"));
    }

    #[test]
    fn tcp_peer_that_stops_reading_is_dropped() {
        let ctx = IpcContext::new();
        let port = ephemeral_port();
        let mut router = IpcChannel::new(ChannelType::Router, &ctx);
        router.bind(&format!("tcp://*:{port}")).unwrap();

        // Sends one request, then never reads a reply.
        let mut stalled = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut request = BytesMut::new();
        request.put_u32(4);
        request.extend_from_slice(b"stat");
        stalled.write_all(&request).unwrap();
        let peer = router.recv_timeout(WAIT).unwrap().peer;

        let reply = Bytes::from(vec![0u8; 1024 * 1024]);
        let started = Instant::now();
        let mut refused = None;
        for _ in 0..256 {
            if let Err(e) = router.send_to(peer, reply.clone()) {
                refused = Some(e);
                break;
            }
        }
        assert!(matches!(refused, Some(IpcError::Send(_))), "{refused:?}");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(router.peer_count(), 0);
        assert!(matches!(
            router.send_to(peer, &b"x"[..]),
            Err(IpcError::UnknownPeer(_))
        ));
    }

    #[test]
    fn finished_readers_are_reaped() {
        let mut readers = vec![
            thread::spawn(|| {}),
            thread::spawn(|| thread::sleep(Duration::from_millis(500))),
        ];
        let deadline = Instant::now() + WAIT;
        while !readers[0].is_finished() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }

        reap_finished(&mut readers);
        assert_eq!(readers.len(), 1);
        readers.pop().unwrap().join().unwrap();
    }

    #[test]
    fn tcp_bind_to_port_in_use_fails() {
        let ctx = IpcContext::new();
        let port = ephemeral_port();
        let mut first = IpcChannel::new(ChannelType::Router, &ctx);
        first.bind(&format!("tcp://127.0.0.1:{port}")).unwrap();
        let mut second = IpcChannel::new(ChannelType::Router, &ctx);
        assert!(matches!(
            second.bind(&format!("tcp://127.0.0.1:{port}")),
            Err(IpcError::Bind { .. })
        ));
    }

    #[test]
    fn tcp_connect_without_listener_is_refused() {
        let ctx = IpcContext::new();
        let port = ephemeral_port();
        let mut dealer = IpcChannel::new(ChannelType::Dealer, &ctx);
        assert!(matches!(
            dealer.connect(&format!("tcp://127.0.0.1:{port}")),
            Err(IpcError::ConnectionRefused { .. })
        ));
    }

    #[test]
    fn assembler_handles_split_and_coalesced_frames() {
        let mut assembler = FrameAssembler::default();
        let mut wire = BytesMut::new();
        for payload in [&b"abc"[..], &b""[..], &b"defgh"[..]] {
            wire.put_u32(payload.len() as u32);
            wire.extend_from_slice(payload);
        }

        assembler.extend(&wire[..2]);
        assert!(assembler.next_frame().unwrap().is_none());
        assembler.extend(&wire[2..]);
        assert_eq!(assembler.next_frame().unwrap().unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(assembler.next_frame().unwrap().unwrap(), Bytes::new());
        assert_eq!(assembler.next_frame().unwrap().unwrap(), Bytes::from_static(b"defgh"));
        assert!(assembler.next_frame().unwrap().is_none());
    }

    #[test]
    fn assembler_rejects_oversized_frames() {
        let mut assembler = FrameAssembler::default();
        assembler.extend(&u32::MAX.to_be_bytes());
        assert!(assembler.next_frame().is_err());
    }

    /// Ask the OS for a free port, then release it for the test to bind.
    fn ephemeral_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }
}
