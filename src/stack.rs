//! The concrete "underlying IP stack" (§6): a `smoltcp`-backed reactor task
//! that owns one `Interface`/`SocketSet`/`ChannelDevice` triple and is the
//! sole place raw TCP segments are simulated. Everything else — Packet
//! Ingress, the TCP Origin Table, the UDP Flow Table — talks to it only
//! through channels, never through a shared lock, matching the
//! shared-nothing-core-with-channels-at-the-edges shape the lineage used
//! for its Swift FFI boundary (here reused for an internal task boundary
//! instead, per `SPEC_FULL.md` §5).
//!
//! Generalizes the lineage's `flow_manager::interface::build_interface_and_sockets`
//! pool-of-pre-allocated-sockets setup, and its `handle_tcp_packet`'s
//! allocate-and-listen-on-first-sight pattern (`flow_manager/mod.rs`), to a
//! per-origin accept channel instead of a single opaque flow table.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use parking_lot::Mutex;
use smallvec::SmallVec;
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer as TcpSocketBuffer, State as TcpState};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpListenEndpoint, Ipv4Address, Ipv6Address};
use tokio::sync::{mpsc, Notify};

use crate::device::ChannelDevice;
use crate::key::FourTuple;
use crate::stream::TcpConnStream;

const TCP_RX_BUFFER_SIZE: usize = 16 * 1024;
const TCP_TX_BUFFER_SIZE: usize = 16 * 1024;
const CONN_CHANNEL_CAPACITY: usize = 64;
const RING_CAPACITY: usize = 256;
const REACTOR_TICK: Duration = Duration::from_millis(5);

/// One accepted TCP byte-stream, tagged with the client's address, handed
/// from the reactor to a `TcpListener::accept()` caller (§4.3, §6).
pub struct AcceptedTcp {
    pub stream: TcpConnStream,
    pub peer: SocketAddr,
}

/// The per-origin accept handle `TcpOriginTable::ensure_origin` gets back
/// from `IpStack::listen_tcp`.
pub struct TcpListener {
    rx: mpsc::UnboundedReceiver<AcceptedTcp>,
}

impl TcpListener {
    pub async fn accept(&mut self) -> Option<AcceptedTcp> {
        self.rx.recv().await
    }
}

struct ListenState {
    accept_tx: mpsc::UnboundedSender<AcceptedTcp>,
}

struct PendingSocket {
    handle: SocketHandle,
}

struct EstablishedConn {
    origin_addr: SocketAddr,
    to_app: mpsc::Sender<Vec<u8>>,
    from_app: mpsc::Receiver<Vec<u8>>,
    /// A chunk pulled off `from_app` that `send_slice` only partially
    /// accepted (the TX buffer filled up mid-chunk). Kept here, rather
    /// than dropped, so a slow socket never silently loses bytes (§8: byte
    /// delivery must be a contiguous, non-duplicated prefix).
    pending_write: Option<(Vec<u8>, usize)>,
}

struct StackInner {
    interface: Interface,
    sockets: SocketSet<'static>,
    device: ChannelDevice,
    free_tcp: Vec<SocketHandle>,
    listen_origins: HashMap<SocketAddr, ListenState>,
    pending: HashMap<FourTuple, PendingSocket>,
    established: HashMap<SocketHandle, EstablishedConn>,
}

impl StackInner {
    fn poll_once(&mut self, now: SmolInstant) -> Vec<Vec<u8>> {
        self.interface.poll(now, &mut self.device, &mut self.sockets);
        self.promote_pending();
        self.pump_established();
        self.device.handle().drain_outbound()
    }

    fn promote_pending(&mut self) {
        let mut resolved: SmallVec<[FourTuple; 8]> = SmallVec::new();
        for (key, pending) in self.pending.iter() {
            let socket = self.sockets.get::<TcpSocket>(pending.handle);
            match socket.state() {
                TcpState::Established => resolved.push(*key),
                TcpState::Closed => resolved.push(*key), // reset before the handshake completed
                _ => {}
            }
        }

        for key in resolved {
            let Some(pending) = self.pending.remove(&key) else { continue };
            let socket = self.sockets.get::<TcpSocket>(pending.handle);
            let established = socket.state() == TcpState::Established;
            if !established {
                self.sockets.remove(pending.handle);
                self.free_tcp.push(self.spare_socket_handle());
                continue;
            }

            let origin_addr = key.dst();
            let Some(listen) = self.listen_origins.get(&origin_addr) else {
                self.sockets.get_mut::<TcpSocket>(pending.handle).abort();
                self.sockets.remove(pending.handle);
                continue;
            };

            let (to_app_tx, to_app_rx) = mpsc::channel(CONN_CHANNEL_CAPACITY);
            let (from_app_tx, from_app_rx) = mpsc::channel(CONN_CHANNEL_CAPACITY);
            let stream = TcpConnStream::new(to_app_rx, from_app_tx, origin_addr, key.src());

            if listen.accept_tx.send(AcceptedTcp { stream, peer: key.src() }).is_err() {
                self.sockets.get_mut::<TcpSocket>(pending.handle).abort();
                self.sockets.remove(pending.handle);
                continue;
            }

            self.established.insert(
                pending.handle,
                EstablishedConn {
                    origin_addr,
                    to_app: to_app_tx,
                    from_app: from_app_rx,
                    pending_write: None,
                },
            );
            self.replenish_listener(origin_addr);
        }
    }

    /// `self.sockets.remove` takes a `SmolTcpSocket` by value out of the set;
    /// pool slots are tracked by re-adding a fresh socket rather than
    /// recycling the freed handle, since `SocketSet` does not expose a way
    /// to reinsert at a specific handle.
    fn spare_socket_handle(&mut self) -> SocketHandle {
        let socket = new_tcp_socket();
        self.sockets.add(socket)
    }

    fn replenish_listener(&mut self, origin_addr: SocketAddr) {
        if !self.listen_origins.contains_key(&origin_addr) {
            return;
        }
        let handle = self.spare_socket_handle();
        let endpoint = socket_addr_to_listen_endpoint(origin_addr);
        if self.sockets.get_mut::<TcpSocket>(handle).listen(endpoint).is_err() {
            self.sockets.remove(handle);
            return;
        }
        // The replacement listens on the origin address only; it is
        // promoted into `pending` lazily the moment a fresh client 4-tuple
        // is admitted for that destination (see `admit_client`), mirroring
        // how a freshly allocated pool socket starts idle until claimed.
        self.free_tcp.push(handle);
    }

    fn pump_established(&mut self) {
        let mut finished: SmallVec<[SocketHandle; 8]> = SmallVec::new();
        for (&handle, conn) in self.established.iter_mut() {
            let socket = self.sockets.get_mut::<TcpSocket>(handle);

            loop {
                if let Some((data, offset)) = conn.pending_write.take() {
                    if !socket.can_send() {
                        conn.pending_write = Some((data, offset));
                        break;
                    }
                    match socket.send_slice(&data[offset..]) {
                        Ok(n) if offset + n < data.len() => {
                            conn.pending_write = Some((data, offset + n));
                            break;
                        }
                        Ok(_) => continue,
                        Err(_) => {
                            conn.pending_write = Some((data, offset));
                            break;
                        }
                    }
                }

                if !socket.can_send() {
                    break;
                }
                match conn.from_app.try_recv() {
                    Ok(data) => {
                        if data.is_empty() {
                            socket.close();
                            break;
                        }
                        conn.pending_write = Some((data, 0));
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        socket.close();
                        break;
                    }
                }
            }

            if socket.can_recv() {
                let mut buf = vec![0u8; TCP_RX_BUFFER_SIZE];
                match socket.recv_slice(&mut buf) {
                    Ok(n) if n > 0 => {
                        buf.truncate(n);
                        if conn.to_app.try_send(buf).is_err() {
                            socket.abort();
                        }
                    }
                    _ => {}
                }
            }

            if socket.state() == TcpState::Closed {
                let _ = conn.to_app.try_send(Vec::new());
                finished.push(handle);
            }
        }

        for handle in finished {
            self.established.remove(&handle);
            self.sockets.remove(handle);
        }
    }

    fn admit_client(&mut self, key: FourTuple) {
        if self.pending.contains_key(&key) {
            return;
        }
        let origin_addr = key.dst();
        if !self.listen_origins.contains_key(&origin_addr) {
            return;
        }
        let Some(handle) = self.free_tcp.pop() else { return };
        let endpoint = socket_addr_to_listen_endpoint(origin_addr);
        if self.sockets.get_mut::<TcpSocket>(handle).listen(endpoint).is_err() {
            self.free_tcp.push(handle);
            return;
        }
        self.pending.insert(key, PendingSocket { handle });
    }
}

fn new_tcp_socket() -> TcpSocket<'static> {
    TcpSocket::new(
        TcpSocketBuffer::new(vec![0u8; TCP_RX_BUFFER_SIZE]),
        TcpSocketBuffer::new(vec![0u8; TCP_TX_BUFFER_SIZE]),
    )
}

fn socket_addr_to_listen_endpoint(addr: SocketAddr) -> IpListenEndpoint {
    IpListenEndpoint { addr: Some(std_ip_to_smol(addr.ip())), port: addr.port() }
}

fn std_ip_to_smol(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address::from(v4)),
        IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address::from(v6)),
    }
}

/// The reactor. Cheap to clone (an `Arc` inside); `run` must be spawned
/// exactly once and drives every TCP socket in the pool.
#[derive(Clone)]
pub struct IpStack {
    inner: Arc<Mutex<StackInner>>,
    wake: Arc<Notify>,
    started_at: StdInstant,
    pool_size: usize,
}

impl IpStack {
    pub fn new(mtu: usize, pool_size: usize) -> Self {
        let wake = Arc::new(Notify::new());
        let mut device = ChannelDevice::new(mtu, Arc::clone(&wake), RING_CAPACITY);

        let mut config = IfaceConfig::new(HardwareAddress::Ip);
        config.random_seed = 0;
        let mut interface = Interface::new(config, &mut device, SmolInstant::from_millis(0));
        interface.set_any_ip(true);
        interface.update_ip_addrs(|addrs| {
            addrs.clear();
            let _ = addrs.push(IpCidr::new(IpAddress::Ipv4(Ipv4Address::new(10, 0, 0, 1)), 24));
            let _ = addrs.push(IpCidr::new(IpAddress::Ipv6(Ipv6Address::new(0xfd00, 0, 0, 0, 0, 0, 0, 1)), 64));
        });
        {
            let routes = interface.routes_mut();
            let _ = routes.add_default_ipv4_route(Ipv4Address::new(10, 0, 0, 1));
            let _ = routes.add_default_ipv6_route(Ipv6Address::new(0xfd00, 0, 0, 0, 0, 0, 0, 1));
        }

        let mut sockets = SocketSet::new(Vec::new());
        let mut free_tcp = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            free_tcp.push(sockets.add(new_tcp_socket()));
        }

        let inner = StackInner {
            interface,
            sockets,
            device,
            free_tcp,
            listen_origins: HashMap::new(),
            pending: HashMap::new(),
            established: HashMap::new(),
        };

        Self { inner: Arc::new(Mutex::new(inner)), wake, started_at: StdInstant::now(), pool_size }
    }

    pub fn channel_handle(&self) -> crate::device::ChannelHandle {
        self.inner.lock().device.handle()
    }

    /// Registers `addr` as a TCP origin: allocates one listening socket for
    /// it and returns the channel the origin's accept task reads from.
    pub fn listen_tcp(&self, addr: SocketAddr) -> Option<TcpListener> {
        let mut inner = self.inner.lock();
        if inner.listen_origins.contains_key(&addr) {
            return None;
        }
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        inner.listen_origins.insert(addr, ListenState { accept_tx });
        Some(TcpListener { rx: accept_rx })
    }

    /// Tears down an origin's listening registration. Any still-pending
    /// (unconnected) socket reserved for it is abandoned back to the pool;
    /// already-established connections are left alone (the origin's client
    /// set is empty by the time this is called — §4.3).
    pub fn unlisten_tcp(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock();
        inner.listen_origins.remove(&addr);
        let stale: SmallVec<[FourTuple; 4]> = inner
            .pending
            .iter()
            .filter(|(k, _)| k.dst() == addr)
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            if let Some(pending) = inner.pending.remove(&key) {
                inner.sockets.get_mut::<TcpSocket>(pending.handle).abort();
                inner.sockets.remove(pending.handle);
            }
        }
    }

    /// Called by Packet Ingress the first time it sees a TCP packet for a
    /// not-yet-admitted client 4-tuple whose destination has a registered
    /// origin. A no-op if the 4-tuple is already pending/established or the
    /// destination has no origin (caller is expected to `ensure_origin`
    /// first).
    pub fn admit_client(&self, key: FourTuple) {
        self.inner.lock().admit_client(key);
    }

    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// Drives `Interface::poll` until `shutdown` fires, handing every frame
    /// the interface wants transmitted to `outbound_tx` — the Link
    /// Injector's single writer task (§4.2) is the other end.
    pub async fn run(&self, outbound_tx: mpsc::UnboundedSender<Vec<u8>>, shutdown: Arc<Notify>) {
        let mut ticker = tokio::time::interval(REACTOR_TICK);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
                _ = shutdown.notified() => break,
            }
            let now = SmolInstant::from_millis(self.started_at.elapsed().as_millis() as i64);
            let outbound = self.inner.lock().poll_once(now);
            for frame in outbound {
                if outbound_tx.send(frame).is_err() {
                    return;
                }
            }
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Proxy-close teardown (§4.7): drops every established connection's
    /// app-side channel halves so in-flight relay tasks observe EOF/closed
    /// on their next poll instead of blocking forever, and discards every
    /// pending/listening registration. The reactor itself stops separately
    /// when `run`'s `shutdown` fires.
    pub fn close_all(&self) {
        let mut inner = self.inner.lock();
        inner.established.clear();
        for (_, pending) in inner.pending.drain() {
            inner.sockets.get_mut::<TcpSocket>(pending.handle).abort();
        }
        inner.listen_origins.clear();
    }
}
