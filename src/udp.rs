//! The UDP Flow Table (§4.5): a flat 4-tuple → upstream-connection map.
//! Unlike the TCP side, this never allocates a `smoltcp` socket — UDP here
//! is connectionless demultiplexing plus payload relay with no handshake
//! state machine to simulate, so reply packets are built directly (see
//! `packet.rs`) and handed to the Link Injector's outbound channel (§9 Open
//! Questions, "why UDP bypasses `smoltcp` sockets").

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify, OnceCell};
use tokio::task::AbortHandle;

use crate::counters::Counters;
use crate::dial::{DialUdp, UdpUpstream};
use crate::key::FourTuple;
use crate::packet;
use crate::task::TaskTracker;

/// A slot reserved for one 4-tuple while its upstream dial is in flight.
/// `OnceCell` makes "dial once per key" race-free without holding the
/// table lock across the dial's `.await` (§5): concurrent datagrams for a
/// brand new key share the same slot and the same dial attempt.
struct FlowSlot {
    cell: OnceCell<Arc<UdpFlow>>,
}

impl FlowSlot {
    fn new() -> Self {
        Self { cell: OnceCell::new() }
    }
}

/// One UDP flow (§3): the upstream datagram connection for a single
/// 4-tuple, plus the bookkeeping the idle reaper needs.
pub struct UdpFlow {
    key: FourTuple,
    upstream: Arc<dyn UdpUpstream>,
    last_activity: Mutex<Instant>,
    reader_task: Mutex<Option<AbortHandle>>,
}

impl UdpFlow {
    fn new(key: FourTuple, upstream: Arc<dyn UdpUpstream>) -> Self {
        Self {
            key,
            upstream,
            last_activity: Mutex::new(Instant::now()),
            reader_task: Mutex::new(None),
        }
    }

    pub fn key(&self) -> FourTuple {
        self.key
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn is_idle(&self, idle_timeout: Duration) -> bool {
        self.last_activity.lock().elapsed() >= idle_timeout
    }
}

/// A single lock guards the 4-tuple → flow map (§5), held only for table
/// mutations — never across the dial or an upstream read/write.
pub struct UdpFlowTable {
    flows: Mutex<HashMap<FourTuple, Arc<FlowSlot>>>,
    dial_udp: DialUdp,
    counters: Arc<Counters>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: Arc<Notify>,
    tracker: Arc<TaskTracker>,
}

impl UdpFlowTable {
    pub fn new(
        dial_udp: DialUdp,
        counters: Arc<Counters>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        shutdown: Arc<Notify>,
        tracker: Arc<TaskTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            flows: Mutex::new(HashMap::new()),
            dial_udp,
            counters,
            outbound,
            shutdown,
            tracker,
        })
    }

    /// Only slots whose dial has actually succeeded count as flows (§8:
    /// a failed dial must leave `num_udp_flows` at 0).
    pub fn len(&self) -> usize {
        self.flows.lock().values().filter(|slot| slot.cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<UdpFlow>> {
        self.flows.lock().values().filter_map(|slot| slot.cell.get().cloned()).collect()
    }

    /// Handles one inbound UDP datagram (§4.5): get-or-create the flow for
    /// `key`, dialing upstream on first sight, then writes the payload and
    /// refreshes `last_activity`. A dial failure or write failure
    /// increments `rejected_packets` and drops the datagram; no flow is
    /// left behind.
    pub async fn handle_datagram(self: &Arc<Self>, key: FourTuple, payload: &[u8]) {
        let slot = {
            let mut flows = self.flows.lock();
            Arc::clone(flows.entry(key).or_insert_with(|| Arc::new(FlowSlot::new())))
        };

        let table = Arc::clone(self);
        let init_result = slot
            .cell
            .get_or_try_init(move || Self::create_flow(table, key))
            .await;

        match init_result {
            Ok(flow) => {
                if flow.upstream.send(payload).await.is_err() {
                    self.counters.record_rejected();
                    return;
                }
                flow.touch();
            }
            Err(()) => {
                self.counters.record_rejected();
                let mut flows = self.flows.lock();
                if let Some(existing) = flows.get(&key) {
                    if Arc::ptr_eq(existing, &slot) && !slot.cell.initialized() {
                        flows.remove(&key);
                    }
                }
            }
        }
    }

    async fn create_flow(table: Arc<Self>, key: FourTuple) -> Result<Arc<UdpFlow>, ()> {
        match (table.dial_udp)(key.dst()).await {
            Ok(upstream) => {
                let upstream: Arc<dyn UdpUpstream> = Arc::from(upstream);
                let flow = Arc::new(UdpFlow::new(key, upstream));
                let reader_table = Arc::clone(&table);
                let reader_flow = Arc::clone(&flow);
                let handle = table
                    .tracker
                    .spawn(async move { reader_table.reader_loop(key, reader_flow).await });
                *flow.reader_task.lock() = Some(handle);
                Ok(flow)
            }
            Err(error) => {
                tracing::debug!(dest = %key.dst(), %error, "udp dial failed");
                Err(())
            }
        }
    }

    /// The upstream-reader task (§4.5): reads datagrams from the upstream
    /// connection and writes them back through the stack to the original
    /// source. Exit (EOF, error, or shutdown) removes the flow.
    async fn reader_loop(self: Arc<Self>, key: FourTuple, flow: Arc<UdpFlow>) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                result = flow.upstream.recv(&mut buf) => {
                    match result {
                        Ok(n) if n > 0 => {
                            flow.touch();
                            if let Some(packet) = packet::build_udp_reply(
                                key.dst_ip,
                                key.dst_port,
                                key.src_ip,
                                key.src_port,
                                &buf[..n],
                            ) {
                                let _ = self.outbound.send(packet);
                            }
                        }
                        Ok(_) => break,
                        Err(error) => {
                            tracing::debug!(%error, "udp upstream read error");
                            break;
                        }
                    }
                }
            }
        }
        self.remove_and_abort(key);
    }

    fn remove_and_abort(&self, key: FourTuple) {
        let slot = self.flows.lock().remove(&key);
        if let Some(slot) = slot {
            if let Some(flow) = slot.cell.get() {
                if let Some(task) = flow.reader_task.lock().take() {
                    task.abort();
                }
            }
        }
    }

    /// The idle sweep's UDP half (§4.6): removes and closes every flow
    /// idle for at least `idle_timeout`.
    pub fn evict_idle(&self, idle_timeout: Duration) {
        let idle_keys: Vec<FourTuple> = self
            .snapshot()
            .iter()
            .filter(|flow| flow.is_idle(idle_timeout))
            .map(|flow| flow.key())
            .collect();
        for key in idle_keys {
            self.remove_and_abort(key);
        }
    }

    /// Unconditional teardown for proxy close (§4.7).
    pub fn close_all(&self) {
        let slots: Vec<Arc<FlowSlot>> = self.flows.lock().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            if let Some(flow) = slot.cell.get() {
                if let Some(task) = flow.reader_task.lock().take() {
                    task.abort();
                }
            }
        }
    }
}
