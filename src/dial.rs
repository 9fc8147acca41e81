//! The dialer interface (§6): host-supplied async closures that re-originate
//! a flow as an ordinary outbound connection. Generalized from the
//! lineage's FFI `request_dial`/`on_dial_result` round trip (`dial.rs`,
//! `ffi/mod.rs`) into a direct async call, since this crate has no FFI
//! boundary to bounce the result back across.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A boxed upstream TCP byte-stream. Any type that is a `tokio` async
/// stream qualifies; callers hand back anything from `TcpStream` to a TLS
/// wrapper.
pub trait TcpUpstream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> TcpUpstream for T {}

/// A boxed upstream UDP datagram connection, already implicitly "connected"
/// to the re-origination target (§4.5 never needs the peer address again
/// once dialed).
#[async_trait::async_trait]
pub trait UdpUpstream: Send + Sync {
    async fn send(&self, payload: &[u8]) -> std::io::Result<()>;
    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize>;
}

pub type DialTcp =
    Arc<dyn Fn(SocketAddr) -> BoxFuture<'static, std::io::Result<Box<dyn TcpUpstream>>> + Send + Sync>;
pub type DialUdp =
    Arc<dyn Fn(SocketAddr) -> BoxFuture<'static, std::io::Result<Box<dyn UdpUpstream>>> + Send + Sync>;

/// Wraps a connected `tokio::net::UdpSocket` as a `UdpUpstream`; the
/// dialer most callers will actually hand back.
pub struct ConnectedUdpSocket(pub tokio::net::UdpSocket);

#[async_trait::async_trait]
impl UdpUpstream for ConnectedUdpSocket {
    async fn send(&self, payload: &[u8]) -> std::io::Result<()> {
        self.0.send(payload).await.map(|_| ())
    }

    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.recv(buf).await
    }
}
