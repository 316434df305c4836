// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Engine configuration and the timing rules derived from it.
use bytes::Bytes;
use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    time::Duration,
};
use thiserror::Error;

/// The oldest protocol version this crate understands.
pub const PROTOCOL_VERSION_MIN: u8 = 1;

/// The newest protocol version this crate understands.
pub const PROTOCOL_VERSION_MAX: u8 = 2;

/// Upper bound on the size of a node's metadata.
pub const META_MAX_SIZE: usize = 512;

/// A configuration error, returned before any network activity takes place.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("node name is empty")]
    EmptyName,

    #[error(
        "protocol version {} is outside of [{}, {}]",
        .0,
        PROTOCOL_VERSION_MIN,
        PROTOCOL_VERSION_MAX
    )]
    ProtocolVersion(u8),

    #[error("delegate version {} is outside of [{}, {}]", .cur, .min, .max)]
    DelegateVersion { min: u8, cur: u8, max: u8 },

    #[error("key must be 16 or 32 bytes, got {}", .0)]
    KeySize(usize),

    #[error("metadata is {} bytes, which exceeds the {} byte limit", .0, META_MAX_SIZE)]
    MetaTooLarge(usize),

    #[error("{} must be non-zero", .0)]
    Zero(&'static str),

    #[error("probe timeout {:?} exceeds probe interval {:?}", .0, .1)]
    ProbeTimeout(Duration, Duration),

    #[error("no routable address to advertise: {}", .0)]
    Advertise(#[source] io::Error),
}

/// Validated engine configuration. Constructed via [Mesh](crate::Mesh).
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) name: String,
    pub(crate) bind_addr: SocketAddr,
    pub(crate) advertise_addr: Option<SocketAddr>,
    pub(crate) seeds: Vec<SocketAddr>,
    pub(crate) meta: Bytes,

    pub(crate) probe_interval: Duration,
    pub(crate) probe_timeout: Duration,
    pub(crate) indirect_checks: usize,
    pub(crate) disable_tcp_pings: bool,
    pub(crate) awareness_max_multiplier: u32,

    pub(crate) suspicion_mult: u32,
    pub(crate) suspicion_max_timeout_mult: u32,

    pub(crate) gossip_interval: Duration,
    pub(crate) gossip_nodes: usize,
    pub(crate) retransmit_mult: u32,

    pub(crate) push_pull_interval: Duration,
    pub(crate) tcp_timeout: Duration,

    pub(crate) tombstone_timeout: Duration,

    pub(crate) compression: bool,
    pub(crate) keys: Vec<Vec<u8>>,
    pub(crate) verify_incoming: bool,

    pub(crate) protocol_version: u8,
    pub(crate) delegate_min: u8,
    pub(crate) delegate_version: u8,
    pub(crate) delegate_max: u8,

    pub(crate) handoff_queue_depth: usize,
    pub(crate) packet_budget: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::lan()
    }
}

impl Config {
    /// Tuned for a local network: low latency, little loss.
    pub(crate) fn lan() -> Self {
        Self {
            name: String::new(),
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7946),
            advertise_addr: None,
            seeds: vec![],
            meta: Bytes::new(),

            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            indirect_checks: 3,
            disable_tcp_pings: false,
            awareness_max_multiplier: 8,

            suspicion_mult: 4,
            suspicion_max_timeout_mult: 6,

            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            retransmit_mult: 4,

            push_pull_interval: Duration::from_secs(30),
            tcp_timeout: Duration::from_secs(10),

            tombstone_timeout: Duration::from_secs(30),

            compression: true,
            keys: vec![],
            verify_incoming: true,

            protocol_version: PROTOCOL_VERSION_MAX,
            delegate_min: 0,
            delegate_version: 0,
            delegate_max: 0,

            handoff_queue_depth: 1024,
            packet_budget: 1400,
        }
    }

    /// Tuned for links between datacenters.
    pub(crate) fn wan() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            gossip_interval: Duration::from_millis(500),
            gossip_nodes: 4,
            push_pull_interval: Duration::from_secs(60),
            suspicion_mult: 6,
            tcp_timeout: Duration::from_secs(30),
            tombstone_timeout: Duration::from_secs(60),
            ..Self::lan()
        }
    }

    /// Tuned for tiny clusters that need to detect failures quickly.
    pub(crate) fn low_latency() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(200),
            gossip_interval: Duration::from_millis(100),
            push_pull_interval: Duration::from_secs(15),
            suspicion_mult: 3,
            retransmit_mult: 2,
            indirect_checks: 1,
            tcp_timeout: Duration::from_secs(1),
            tombstone_timeout: Duration::from_secs(15),
            ..Self::lan()
        }
    }

    /// Check that the configuration is usable.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        use ConfigError::*;

        if self.name.is_empty() {
            return Err(EmptyName);
        }

        let v = self.protocol_version;
        if v < PROTOCOL_VERSION_MIN || v > PROTOCOL_VERSION_MAX {
            return Err(ProtocolVersion(v));
        }

        let (min, cur, max) = (self.delegate_min, self.delegate_version, self.delegate_max);
        if min > cur || cur > max {
            return Err(DelegateVersion { min, cur, max });
        }

        if let Some(key) = self.keys.iter().find(|k| !valid_key_len(k.len())) {
            return Err(KeySize(key.len()));
        }

        if self.meta.len() > META_MAX_SIZE {
            return Err(MetaTooLarge(self.meta.len()));
        }

        let zero = [
            ("probe_interval", self.probe_interval == Duration::ZERO),
            ("probe_timeout", self.probe_timeout == Duration::ZERO),
            ("gossip_interval", self.gossip_interval == Duration::ZERO),
            ("push_pull_interval", self.push_pull_interval == Duration::ZERO),
            ("tcp_timeout", self.tcp_timeout == Duration::ZERO),
            ("gossip_nodes", self.gossip_nodes == 0),
            ("suspicion_mult", self.suspicion_mult == 0),
            ("suspicion_max_timeout_mult", self.suspicion_max_timeout_mult == 0),
            ("retransmit_mult", self.retransmit_mult == 0),
            ("awareness_max_multiplier", self.awareness_max_multiplier == 0),
            ("handoff_queue_depth", self.handoff_queue_depth == 0),
            ("packet_budget", self.packet_budget == 0),
        ];

        if let Some((knob, _)) = zero.iter().find(|(_, z)| *z) {
            return Err(Zero(*knob));
        }

        if self.probe_timeout > self.probe_interval {
            return Err(ProbeTimeout(self.probe_timeout, self.probe_interval));
        }

        Ok(())
    }

    /// Returns the version bytes advertised in alive messages.
    pub(crate) fn vsn(&self) -> [u8; 6] {
        [
            PROTOCOL_VERSION_MIN,
            PROTOCOL_VERSION_MAX,
            self.protocol_version,
            self.delegate_min,
            self.delegate_max,
            self.delegate_version,
        ]
    }

    /// Resolve the address to advertise to peers, given the address the transport is
    /// actually bound to.
    pub(crate) fn resolve_advertise(&self, bound: SocketAddr) -> Result<SocketAddr, ConfigError> {
        if let Some(addr) = self.advertise_addr {
            return Ok(addr);
        }

        if !bound.ip().is_unspecified() {
            return Ok(bound);
        }

        local_ip()
            .map(|ip| SocketAddr::new(ip, bound.port()))
            .map_err(ConfigError::Advertise)
    }
}

pub(crate) fn valid_key_len(len: usize) -> bool {
    len == 16 || len == 32
}

/// Discover the address of the interface that routes to the outside world. Connecting a
/// udp socket doesn't send anything.
fn local_ip() -> io::Result<IpAddr> {
    let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    sock.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
    let ip = sock.local_addr()?.ip();

    if ip.is_unspecified() {
        return Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "unspecified"));
    }

    Ok(ip)
}

/// Returns the minimum suspicion timeout for a cluster of `n` nodes.
pub(crate) fn suspicion_timeout(mult: u32, n: usize, interval: Duration) -> Duration {
    let scale = (n.max(1) as f64).log10().max(1.0);
    interval.mul_f64(mult as f64 * scale)
}

/// Returns how many times a broadcast is retransmitted in a cluster of `n` nodes.
pub(crate) fn retransmit_limit(mult: u32, n: usize) -> usize {
    let scale = ((n + 1) as f64).log10().ceil() as usize;
    mult as usize * scale
}

/// Returns the push/pull interval for a cluster of `n` nodes. Large clusters sync less
/// often, so the aggregate stream load stays flat.
pub(crate) fn push_pull_scale(interval: Duration, n: usize) -> Duration {
    const THRESHOLD: usize = 32;

    if n <= THRESHOLD {
        return interval;
    }

    let mult = ((n as f64).log2() - (THRESHOLD as f64).log2()).ceil() + 1.0;
    interval.mul_f64(mult)
}
