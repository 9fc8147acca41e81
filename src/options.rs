//! `Options` (§3 Data Model): the proxy's construction-time configuration,
//! including the dialer interface (§6) the TCP Origin Table and UDP Flow
//! Table call out to. Generalized from the lineage's FFI `request_dial`/
//! `on_dial_result` round trip into a direct async call — this crate has no
//! FFI boundary to bounce the dial result back across.

use std::time::Duration;

use anyhow::{ensure, Context};

use crate::dial::{DialTcp, DialUdp};
use crate::error::ProxyError;

/// Default `mtu` (§3) when the caller does not override it.
pub const DEFAULT_MTU: usize = 1500;

const MIN_MTU: usize = 576;
const MAX_MTU: usize = 9000;

/// Total TCP sockets kept pre-allocated across all origins (§9, "per-origin
/// listening-socket replenishment count"). Shared pool, not per-origin.
pub const DEFAULT_TCP_SOCKET_POOL: usize = 128;

/// Recognized `Options` fields (§3). Construct with `Options::builder()`;
/// `idle_timeout` and `stats_interval` have no safe default and must be
/// supplied before `build()` succeeds.
pub struct Options {
    pub(crate) idle_timeout: Duration,
    pub(crate) stats_interval: Duration,
    pub(crate) mtu: usize,
    pub(crate) tcp_socket_pool: usize,
    pub(crate) dial_tcp: DialTcp,
    pub(crate) dial_udp: DialUdp,
}

impl Options {
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::default()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn stats_interval(&self) -> Duration {
        self.stats_interval
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }
}

/// Builder for `Options`. `mtu` and `tcp_socket_pool` have sane defaults;
/// `idle_timeout`, `stats_interval`, `dial_tcp`, and `dial_udp` are
/// mandatory — `build()` returns `ProxyError::Configuration` if any are
/// missing or out of range.
#[derive(Default)]
pub struct OptionsBuilder {
    idle_timeout: Option<Duration>,
    stats_interval: Option<Duration>,
    mtu: Option<usize>,
    tcp_socket_pool: Option<usize>,
    dial_tcp: Option<DialTcp>,
    dial_udp: Option<DialUdp>,
}

impl OptionsBuilder {
    pub fn idle_timeout(mut self, value: Duration) -> Self {
        self.idle_timeout = Some(value);
        self
    }

    pub fn stats_interval(mut self, value: Duration) -> Self {
        self.stats_interval = Some(value);
        self
    }

    pub fn mtu(mut self, value: usize) -> Self {
        self.mtu = Some(value);
        self
    }

    pub fn tcp_socket_pool(mut self, value: usize) -> Self {
        self.tcp_socket_pool = Some(value);
        self
    }

    pub fn dial_tcp(mut self, dialer: DialTcp) -> Self {
        self.dial_tcp = Some(dialer);
        self
    }

    pub fn dial_udp(mut self, dialer: DialUdp) -> Self {
        self.dial_udp = Some(dialer);
        self
    }

    pub fn build(self) -> Result<Options, ProxyError> {
        self.validate().map_err(|error| ProxyError::Configuration(format!("{error:#}")))
    }

    /// The actual validation, composed with `anyhow` so every missing or
    /// out-of-range field reports with its own context regardless of which
    /// one fails first; `build` converts the single resulting error into
    /// the public `ProxyError::Configuration` variant.
    fn validate(self) -> anyhow::Result<Options> {
        let idle_timeout = self.idle_timeout.context("idle_timeout is required")?;
        ensure!(!idle_timeout.is_zero(), "idle_timeout must be non-zero");

        let stats_interval = self.stats_interval.context("stats_interval is required")?;
        ensure!(!stats_interval.is_zero(), "stats_interval must be non-zero");

        let dial_tcp = self.dial_tcp.context("dial_tcp is required")?;
        let dial_udp = self.dial_udp.context("dial_udp is required")?;

        let mtu = self.mtu.unwrap_or(DEFAULT_MTU).clamp(MIN_MTU, MAX_MTU);
        let tcp_socket_pool = self.tcp_socket_pool.unwrap_or(DEFAULT_TCP_SOCKET_POOL);
        ensure!(tcp_socket_pool > 0, "tcp_socket_pool must be non-zero");

        Ok(Options {
            idle_timeout,
            stats_interval,
            mtu,
            tcp_socket_pool,
            dial_tcp,
            dial_udp,
        })
    }
}
