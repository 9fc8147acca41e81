//! The join-set Proxy uses to guarantee the leak contract (§4.7, §8): every
//! task spawned anywhere in the engine — Packet Ingress, the reactor, the
//! Link Injector writer, the Idle Reaper, every origin's accept loop, every
//! client's pair of relay tasks, every UDP flow's reader — registers here.
//! `close()` aborts and joins the lot in one place instead of each
//! substructure tracking its own completion.

use std::future::Future;

use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinSet};

pub struct TaskTracker {
    inner: Mutex<JoinSet<()>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(JoinSet::new()),
        }
    }

    /// Spawns `fut` onto the shared set and returns an `AbortHandle` the
    /// caller can use for targeted early cancellation (e.g. tearing down a
    /// single idle origin) without affecting any other task.
    pub fn spawn<F>(&self, fut: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.lock().spawn(fut)
    }

    /// Aborts every still-running task and waits for all of them —
    /// already-finished or freshly aborted — to actually complete. Taking
    /// the set out from behind the lock lets the join itself happen without
    /// holding any lock across an `.await` (§5).
    pub async fn abort_and_join_all(&self) {
        let mut set = std::mem::replace(&mut *self.inner.lock(), JoinSet::new());
        set.abort_all();
        while set.join_next().await.is_some() {}
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Drains every already-finished task from the set without blocking.
    /// Called opportunistically (per ingress packet, not on a timer) so a
    /// per-flow spawn pattern — one task per UDP datagram's `handle_datagram`
    /// call, one pair per TCP client — doesn't let the `JoinSet` grow
    /// without bound under sustained traffic; only tasks that have already
    /// completed are removed, so this never waits on anything still running.
    pub fn reap_finished(&self) {
        let mut set = self.inner.lock();
        while set.try_join_next().is_some() {}
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}
