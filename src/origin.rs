//! The TCP Origin Table and per-client relay (§4.3, §4.4): demultiplexes
//! accepted byte-streams by destination and relays each full-duplex against
//! a dialed upstream. Generalizes the lineage's single opaque
//! `flow_manager` flow table into a two-level index — this file is the
//! destination-keyed level; `proxy.rs` drives Packet Ingress, which is the
//! only caller that also reaches into `stack.rs` to admit a 4-tuple.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use crate::counters::Counters;
use crate::dial::{DialTcp, TcpUpstream};
use crate::stack::{AcceptedTcp, IpStack, TcpListener};
use crate::stream::TcpConnStream;
use crate::task::TaskTracker;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;
const DOWN_TO_UP_FINISHED: u8 = 0b01;
const UP_TO_DOWN_FINISHED: u8 = 0b10;

/// Destination → `Origin` index (§3, §4.3). A single `parking_lot::Mutex`
/// guards the map; held only for lookup/insert/delete, never across I/O or
/// a call into an origin (§5).
pub struct TcpOriginTable {
    origins: Mutex<HashMap<SocketAddr, Arc<Origin>>>,
    stack: IpStack,
    dial_tcp: DialTcp,
    counters: Arc<Counters>,
    shutdown: Arc<Notify>,
    tracker: Arc<TaskTracker>,
    next_client_id: AtomicU64,
}

/// One per distinct destination observed on the TUN (§3). Exists iff it
/// has at least one active client, or its idle timer has not yet expired
/// since the last client departed.
pub struct Origin {
    dest: SocketAddr,
    clients: Mutex<HashSet<u64>>,
    last_activity: Mutex<Instant>,
    accept_task: Mutex<Option<AbortHandle>>,
}

impl Origin {
    fn new(dest: SocketAddr) -> Self {
        Self {
            dest,
            clients: Mutex::new(HashSet::new()),
            last_activity: Mutex::new(Instant::now()),
            accept_task: Mutex::new(None),
        }
    }

    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// `now - last_activity >= idle_timeout` with zero active clients
    /// (§4.6). The idle window is a fresh `idle_timeout` counted from the
    /// moment the *last* client departed (§9 Open Questions).
    pub fn is_evictable(&self, idle_timeout: Duration) -> bool {
        self.client_count() == 0 && self.last_activity.lock().elapsed() >= idle_timeout
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

impl TcpOriginTable {
    pub fn new(
        stack: IpStack,
        dial_tcp: DialTcp,
        counters: Arc<Counters>,
        shutdown: Arc<Notify>,
        tracker: Arc<TaskTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            origins: Mutex::new(HashMap::new()),
            stack,
            dial_tcp,
            counters,
            shutdown,
            tracker,
            next_client_id: AtomicU64::new(1),
        })
    }

    pub fn len(&self) -> usize {
        self.origins.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_clients(&self) -> usize {
        self.snapshot().iter().map(|origin| origin.client_count()).sum()
    }

    /// Get-or-create (§4.3). On create, binds a listening endpoint in the
    /// stack and starts the origin's accept task. The table's own mutex
    /// serializes concurrent callers, so at most one origin per `dest` is
    /// ever inserted — no separate race-resolution step is needed.
    pub fn ensure_origin(self: &Arc<Self>, dest: SocketAddr) -> Option<Arc<Origin>> {
        let mut origins = self.origins.lock();
        if let Some(existing) = origins.get(&dest) {
            return Some(Arc::clone(existing));
        }
        let listener = self.stack.listen_tcp(dest)?;
        let origin = Arc::new(Origin::new(dest));
        origins.insert(dest, Arc::clone(&origin));
        drop(origins);

        let table = Arc::clone(self);
        let accept_origin = Arc::clone(&origin);
        let handle = self
            .tracker
            .spawn(async move { table.accept_loop(accept_origin, listener).await });
        *origin.accept_task.lock() = Some(handle);
        Some(origin)
    }

    /// Removes `dest` iff its origin reports zero clients (§4.3); a no-op
    /// otherwise. Caller must hold no origin-internal lock.
    pub fn remove_origin(&self, dest: SocketAddr) {
        let removed = {
            let mut origins = self.origins.lock();
            match origins.get(&dest) {
                Some(origin) if origin.client_count() == 0 => origins.remove(&dest),
                _ => None,
            }
        };
        if let Some(origin) = removed {
            if let Some(task) = origin.accept_task.lock().take() {
                task.abort();
            }
            self.stack.unlisten_tcp(dest);
        }
    }

    /// Copies the table under its lock, then releases before the caller
    /// inspects origins — the idiom that avoids lock-order inversion with
    /// origin-internal locks (§4.3, §9).
    pub fn snapshot(&self) -> Vec<Arc<Origin>> {
        self.origins.lock().values().cloned().collect()
    }

    /// Unconditional teardown for proxy close (§4.7): every origin's
    /// listening endpoint and accept task is torn down regardless of its
    /// client count. In-flight clients observe their streams close as the
    /// reactor and upstream connections are closed alongside.
    pub fn close_all(&self) {
        let origins: Vec<(SocketAddr, Arc<Origin>)> = self.origins.lock().drain().collect();
        for (dest, origin) in origins {
            if let Some(task) = origin.accept_task.lock().take() {
                task.abort();
            }
            self.stack.unlisten_tcp(dest);
        }
    }

    async fn accept_loop(self: Arc<Self>, origin: Arc<Origin>, mut listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Some(accepted) => self.spawn_client(&origin, accepted).await,
                        None => break,
                    }
                }
            }
        }
    }

    /// Dials upstream for a freshly accepted stream (§4.3). On failure the
    /// accepted stream is dropped (closed), `rejected_packets` increments,
    /// and no client is registered. On success, registers a `TcpClient` and
    /// launches its two relay tasks.
    async fn spawn_client(self: &Arc<Self>, origin: &Arc<Origin>, accepted: AcceptedTcp) {
        match (self.dial_tcp)(origin.dest).await {
            Ok(upstream) => {
                let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
                origin.clients.lock().insert(client_id);
                origin.touch();

                let origin = Arc::clone(origin);
                self.tracker
                    .spawn(run_client(origin, client_id, accepted.stream, upstream));
            }
            Err(error) => {
                tracing::debug!(dest = %origin.dest, %error, "tcp dial failed");
                self.counters.record_rejected();
            }
        }
    }
}

/// Runs both relay directions concurrently for one accepted/upstream pair,
/// registered as a single task in the shared tracker (§4.7's leak contract
/// covers this task directly rather than through a per-direction handle),
/// then deregisters the client once both halves have finished (§3, §4.4
/// invariant).
async fn run_client(
    origin: Arc<Origin>,
    client_id: u64,
    accepted: TcpConnStream,
    upstream: Box<dyn TcpUpstream>,
) {
    let (down_r, down_w) = tokio::io::split(accepted);
    let (up_r, up_w) = tokio::io::split(upstream);
    let finished = Arc::new(AtomicU8::new(0));

    tokio::join!(
        relay_direction(down_r, up_w, Arc::clone(&origin), Arc::clone(&finished), DOWN_TO_UP_FINISHED),
        relay_direction(up_r, down_w, Arc::clone(&origin), Arc::clone(&finished), UP_TO_DOWN_FINISHED),
    );
    debug_assert_eq!(finished.load(Ordering::Acquire), DOWN_TO_UP_FINISHED | UP_TO_DOWN_FINISHED);

    let left_empty = {
        let mut clients = origin.clients.lock();
        clients.remove(&client_id);
        clients.is_empty()
    };
    if left_empty {
        // The idle sweep can now collect this origin after `idle_timeout`
        // (§4.4, §9).
        origin.touch();
    }
}

/// One unidirectional copy (§4.4): streams until EOF or error, refreshing
/// `last_activity` per successful transfer, then half-closes the peer
/// direction. `finished`'s bitmask across both directions stands in for
/// the `Active → HalfClosed{dir} → Closed` state machine: the bit this
/// call sets marks its own direction done; the caller observes `Closed`
/// once both bits are set via `tokio::join!`.
async fn relay_direction<R, W>(
    mut reader: R,
    mut writer: W,
    origin: Arc<Origin>,
    finished: Arc<AtomicU8>,
    bit: u8,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if writer.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                origin.touch();
            }
            Err(error) => {
                tracing::debug!(%error, "tcp relay read error");
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
    finished.fetch_or(bit, Ordering::AcqRel);
}
