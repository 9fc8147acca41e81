//! The TUN device interface (§6), consumed rather than implemented by this
//! crate: device creation and addressing live entirely with the caller.
//! `Proxy::open` takes an already-open handle.

use std::io;

/// One raw IP packet per `recv`/`send` call; no framing. Implementations
/// are expected to block the calling task until a packet is available (an
/// `async fn`, not a poll), matching the "blocking read/write of one IP
/// packet" language in §6.
#[async_trait::async_trait]
pub trait TunDevice: Send + Sync + 'static {
    /// Reads one IP packet into `buf`, returning its length. `Ok(0)` with no
    /// error is EOF (§4.1): orderly shutdown, not a fatal error.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes one IP packet. Callers serialize calls to this method
    /// themselves (§4.2); implementations need not be internally
    /// synchronized against concurrent `send` calls.
    async fn send(&self, packet: &[u8]) -> io::Result<()>;

    /// Releases the underlying handle. Called once by `Proxy::close` (§4.7);
    /// the default no-op suits handles the caller owns and tears down
    /// itself after `Proxy::close` returns.
    async fn close(&self) -> io::Result<()> {
        Ok(())
    }
}
