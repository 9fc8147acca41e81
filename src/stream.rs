//! Bridges a reactor-owned `smoltcp` TCP socket to a genuine
//! `tokio::io::{AsyncRead, AsyncWrite}` stream the per-client relay
//! (`origin.rs`) can drive with ordinary `tokio::io::copy`-style code.
//!
//! A channel pair stands in for the socket; an empty `Vec` on either channel
//! is the EOF sentinel, letting the reactor (`stack.rs`, which owns and
//! pumps the real `smoltcp` socket) signal close without a separate control
//! message.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

pub struct TcpConnStream {
    rx: mpsc::Receiver<Vec<u8>>,
    tx: mpsc::Sender<Vec<u8>>,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_closed: bool,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl TcpConnStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<Vec<u8>>,
        tx: mpsc::Sender<Vec<u8>>,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            rx,
            tx,
            read_buf: Vec::new(),
            read_pos: 0,
            read_closed: false,
            local_addr,
            peer_addr,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl AsyncRead for TcpConnStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_closed {
            return Poll::Ready(Ok(()));
        }

        if self.read_pos < self.read_buf.len() {
            let available = &self.read_buf[self.read_pos..];
            let n = available.len().min(buf.remaining());
            buf.put_slice(&available[..n]);
            self.read_pos += n;
            return Poll::Ready(Ok(()));
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                if data.is_empty() {
                    self.read_closed = true;
                    return Poll::Ready(Ok(()));
                }
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    self.read_buf = data;
                    self.read_pos = n;
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => {
                self.read_closed = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for TcpConnStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        match self.tx.try_send(data.to_vec()) {
            Ok(()) => Poll::Ready(Ok(data.len())),
            Err(mpsc::error::TrySendError::Full(_)) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed")))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let _ = self.tx.try_send(Vec::new());
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn addr() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    #[tokio::test]
    async fn read_drains_buffered_remainder_across_polls() {
        let (to_app_tx, to_app_rx) = mpsc::channel(4);
        let (from_app_tx, _from_app_rx) = mpsc::channel(4);
        let mut stream = TcpConnStream::new(to_app_rx, from_app_tx, addr(), addr());
        to_app_tx.send(b"hello world".to_vec()).await.unwrap();

        let mut first = [0u8; 5];
        let n = stream.read(&mut first).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&first, b"hello");

        let mut second = vec![0u8; 16];
        let n = stream.read(&mut second).await.unwrap();
        assert_eq!(&second[..n], b" world");
    }

    #[tokio::test]
    async fn empty_vec_signals_eof() {
        let (to_app_tx, to_app_rx) = mpsc::channel(4);
        let (from_app_tx, _from_app_rx) = mpsc::channel(4);
        let mut stream = TcpConnStream::new(to_app_rx, from_app_tx, addr(), addr());
        to_app_tx.send(Vec::new()).await.unwrap();

        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn shutdown_sends_eof_sentinel_to_peer() {
        let (_to_app_tx, to_app_rx) = mpsc::channel(4);
        let (from_app_tx, mut from_app_rx) = mpsc::channel(4);
        let mut stream = TcpConnStream::new(to_app_rx, from_app_tx, addr(), addr());
        stream.shutdown().await.unwrap();
        let sentinel = from_app_rx.recv().await.unwrap();
        assert!(sentinel.is_empty());
    }
}
