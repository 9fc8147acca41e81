//! The typed error taxonomy from the error handling design: one enum
//! covering every fallible public operation. Per-flow failures (dial
//! failures, relay I/O) never become a `ProxyError` — they are contained
//! within the flow and only move a counter (see `counters.rs`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Invalid `Options` at construction time.
    #[error("invalid proxy configuration: {0}")]
    Configuration(String),

    /// TUN read/write failure while the proxy is running.
    #[error("TUN device error: {0}")]
    Device(#[source] std::io::Error),

    /// Packet injection into, or emission from, the underlying IP stack failed.
    #[error("IP stack error: {0}")]
    Stack(String),

    /// The operation was attempted on a proxy that has already closed.
    #[error("proxy is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ProxyError>;
