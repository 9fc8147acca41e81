//! A user-space TCP/UDP termination proxy for a TUN device (§1, §2): every
//! flow the kernel routes onto the TUN is terminated locally, re-originated
//! through a caller-supplied dialer, and relayed full-duplex until either
//! side closes or it sits idle past `Options::idle_timeout`.
//!
//! `Proxy` is the entry point: `Proxy::open` builds it from a `TunDevice`
//! handle and `Options`, `Proxy::serve` drives it until closed, and
//! `Proxy::close` tears it down. See `proxy.rs` for the lifecycle and
//! `SPEC_FULL.md` §6 for the full interface this module realizes.

mod counters;
mod device;
mod dial;
mod error;
mod key;
mod options;
mod origin;
mod packet;
mod proxy;
mod stack;
mod stream;
mod task;
mod tun;
mod udp;

pub use crate::dial::{
    BoxFuture, ConnectedUdpSocket, DialTcp, DialUdp, TcpUpstream, UdpUpstream,
};
pub use crate::error::{ProxyError, Result};
pub use crate::options::{Options, OptionsBuilder, DEFAULT_MTU, DEFAULT_TCP_SOCKET_POOL};
pub use crate::proxy::Proxy;
pub use crate::tun::TunDevice;
