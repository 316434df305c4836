// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Configuring and running a member of a swarm.
use crate::{
    cluster::{config::Config, Cluster, Error, Keyring, Member, Subscription},
    delegate::{
        BroadcastSource, ConflictObserver, Delegates, JoinPolicy, MergePolicy,
        MessageObserver, NodeMetaProvider, PingObserver, StateExchanger,
    },
    transport::{Incoming, NetTransport, Transport},
};
use bytes::Bytes;
use std::{net::SocketAddr, sync::Arc, time::Duration};

/// An unstarted member of a swarm.
///
/// Start from one of the presets ([lan](Mesh::lan), [wan](Mesh::wan), or
/// [low_latency](Mesh::low_latency)), adjust what needs adjusting, and
/// [create](Mesh::create) it. Every node needs a [name](Mesh::name) that is unique within
/// the swarm.
///
/// The configuration is validated when the mesh is created, before any socket is bound.
#[derive(Debug, Default)]
pub struct Mesh {
    cfg: Config,
    delegates: Delegates,
}

impl Mesh {
    /// Create a new [Mesh], configured for a local network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a configuration tuned for a local network.
    ///
    /// Probes every second (with a 500ms timeout), gossips to 3 nodes every 200ms, and
    /// does a full state sync every 30s.
    pub fn lan() -> Self {
        Self::with(Config::lan())
    }

    /// Returns a configuration tuned for links between datacenters.
    ///
    /// Probes every 5s (with a 3s timeout), gossips to 4 nodes every 500ms, and does a
    /// full state sync every 60s. Suspicions last longer.
    pub fn wan() -> Self {
        Self::with(Config::wan())
    }

    /// Returns a configuration tuned for small clusters that need to detect failures
    /// quickly, on a fast and reliable network.
    pub fn low_latency() -> Self {
        Self::with(Config::low_latency())
    }

    fn with(cfg: Config) -> Self {
        Self {
            cfg,
            delegates: Delegates::default(),
        }
    }
}

/// Methods for node identity and addressing.
impl Mesh {
    /// Set the name of the local node, which must be unique within the swarm.
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.cfg.name = name.into();
        self
    }

    /// Set the address to bind to.
    ///
    /// Defaults to `0.0.0.0:7946`.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.cfg.bind_addr = addr;
        self
    }

    /// Set the address advertised to peers. If unset, the bound address is used, unless
    /// it is unspecified, in which case the address of the default route is.
    pub fn advertise_addr(mut self, addr: SocketAddr) -> Self {
        self.cfg.advertise_addr = Some(addr);
        self
    }

    /// Add a seed to join on startup, and to fall back to if the local node is ever left
    /// without live peers.
    pub fn seed(mut self, addr: SocketAddr) -> Self {
        self.cfg.seeds.push(addr);
        self
    }

    /// Add several seeds. See [seed](Mesh::seed).
    pub fn seeds<I: IntoIterator<Item = SocketAddr>>(mut self, addrs: I) -> Self {
        self.cfg.seeds.extend(addrs);
        self
    }

    /// Set metadata to distribute to other members. Ignored if a [NodeMetaProvider] is
    /// installed.
    ///
    /// Must not exceed [META_MAX_SIZE](crate::META_MAX_SIZE) bytes.
    pub fn meta<B: Into<Bytes>>(mut self, meta: B) -> Self {
        self.cfg.meta = meta.into();
        self
    }
}

/// Methods for failure detection.
impl Mesh {
    /// Set how often a random node is probed. Scaled up while the local node is
    /// unhealthy.
    pub fn probe_interval(mut self, d: Duration) -> Self {
        self.cfg.probe_interval = d;
        self
    }

    /// Set how long to wait for a direct probe to be acked before trying indirect probes.
    ///
    /// Must not exceed the probe interval.
    pub fn probe_timeout(mut self, d: Duration) -> Self {
        self.cfg.probe_timeout = d;
        self
    }

    /// Set how many peers are asked to probe a node indirectly after a failed direct
    /// probe.
    pub fn indirect_checks(mut self, n: usize) -> Self {
        self.cfg.indirect_checks = n;
        self
    }

    /// Disable the stream ping that runs alongside indirect probes.
    pub fn disable_tcp_pings(mut self, disable: bool) -> Self {
        self.cfg.disable_tcp_pings = disable;
        self
    }

    /// Set the upper bound on how far probe timing is stretched while the local node is
    /// unhealthy.
    pub fn awareness_max_multiplier(mut self, n: u32) -> Self {
        self.cfg.awareness_max_multiplier = n;
        self
    }

    /// Set the suspicion multiplier. Suspicions last at least `mult * log10(n)` probe
    /// intervals, in a cluster of `n` nodes.
    pub fn suspicion_mult(mut self, mult: u32) -> Self {
        self.cfg.suspicion_mult = mult;
        self
    }

    /// Set how many times longer than the minimum a suspicion may last, if nobody
    /// confirms it.
    pub fn suspicion_max_timeout_mult(mut self, mult: u32) -> Self {
        self.cfg.suspicion_max_timeout_mult = mult;
        self
    }

    /// Set how long dead and departed nodes are remembered. Once a tombstone is this old,
    /// its name may be reclaimed from a different address.
    pub fn tombstone_timeout(mut self, d: Duration) -> Self {
        self.cfg.tombstone_timeout = d;
        self
    }
}

/// Methods for dissemination.
impl Mesh {
    /// Set how often queued broadcasts are gossiped.
    pub fn gossip_interval(mut self, d: Duration) -> Self {
        self.cfg.gossip_interval = d;
        self
    }

    /// Set how many random nodes are gossiped to every gossip interval.
    pub fn gossip_nodes(mut self, n: usize) -> Self {
        self.cfg.gossip_nodes = n;
        self
    }

    /// Set the retransmit multiplier. Broadcasts are sent `mult * ceil(log10(n + 1))`
    /// times, in a cluster of `n` nodes.
    pub fn retransmit_mult(mut self, mult: u32) -> Self {
        self.cfg.retransmit_mult = mult;
        self
    }

    /// Set how often full state is exchanged with a random node.
    pub fn push_pull_interval(mut self, d: Duration) -> Self {
        self.cfg.push_pull_interval = d;
        self
    }

    /// Set the timeout for stream operations (push/pull, reliable sends, and stream
    /// pings).
    pub fn tcp_timeout(mut self, d: Duration) -> Self {
        self.cfg.tcp_timeout = d;
        self
    }

    /// Set how many gossip messages may be waiting to be processed before new ones are
    /// dropped.
    pub fn handoff_queue_depth(mut self, n: usize) -> Self {
        self.cfg.handoff_queue_depth = n;
        self
    }

    /// Set the largest packet to send, in bytes.
    ///
    /// Defaults to 1400, which fits in a typical ethernet frame.
    pub fn packet_budget(mut self, n: usize) -> Self {
        self.cfg.packet_budget = n;
        self
    }
}

/// Methods for the wire protocol.
impl Mesh {
    /// Set whether outbound traffic is compressed.
    ///
    /// Defaults to true.
    pub fn compression(mut self, enabled: bool) -> Self {
        self.cfg.compression = enabled;
        self
    }

    /// Install an encryption key, which must be 16 or 32 bytes. The first key installed
    /// is used for encryption, and every key is tried for decryption.
    pub fn add_key<K: Into<Vec<u8>>>(mut self, key: K) -> Self {
        self.cfg.keys.push(key.into());
        self
    }

    /// Set whether unencrypted traffic is rejected while a key is installed.
    ///
    /// Defaults to true. Disabling this allows encryption to be rolled out to a running
    /// swarm.
    pub fn verify_incoming(mut self, enabled: bool) -> Self {
        self.cfg.verify_incoming = enabled;
        self
    }

    /// Set the protocol version to speak.
    ///
    /// Must be within `[PROTOCOL_VERSION_MIN, PROTOCOL_VERSION_MAX]`.
    pub fn protocol_version(mut self, v: u8) -> Self {
        self.cfg.protocol_version = v;
        self
    }

    /// Set the application protocol version to advertise, along with the range of
    /// versions the application understands.
    pub fn delegate_version(mut self, min: u8, cur: u8, max: u8) -> Self {
        self.cfg.delegate_min = min;
        self.cfg.delegate_version = cur;
        self.cfg.delegate_max = max;
        self
    }
}

/// Methods for installing delegates.
impl Mesh {
    /// Install a [NodeMetaProvider].
    pub fn node_meta_provider<D: NodeMetaProvider + 'static>(mut self, d: D) -> Self {
        self.delegates.meta = Some(Arc::new(d));
        self
    }

    /// Install a [MessageObserver].
    pub fn message_observer<D: MessageObserver + 'static>(mut self, d: D) -> Self {
        self.delegates.msgs = Some(Arc::new(d));
        self
    }

    /// Install a [BroadcastSource].
    pub fn broadcast_source<D: BroadcastSource + 'static>(mut self, d: D) -> Self {
        self.delegates.broadcasts = Some(Arc::new(d));
        self
    }

    /// Install a [StateExchanger].
    pub fn state_exchanger<D: StateExchanger + 'static>(mut self, d: D) -> Self {
        self.delegates.state = Some(Arc::new(d));
        self
    }

    /// Install a [ConflictObserver].
    pub fn conflict_observer<D: ConflictObserver + 'static>(mut self, d: D) -> Self {
        self.delegates.conflict = Some(Arc::new(d));
        self
    }

    /// Install a [PingObserver].
    pub fn ping_observer<D: PingObserver + 'static>(mut self, d: D) -> Self {
        self.delegates.ping = Some(Arc::new(d));
        self
    }

    /// Install a [JoinPolicy].
    pub fn join_policy<D: JoinPolicy + 'static>(mut self, d: D) -> Self {
        self.delegates.join = Some(Arc::new(d));
        self
    }

    /// Install a [MergePolicy].
    pub fn merge_policy<D: MergePolicy + 'static>(mut self, d: D) -> Self {
        self.delegates.merge = Some(Arc::new(d));
        self
    }
}

/// Methods for starting the local node.
impl Mesh {
    /// Bind to the configured address over UDP and TCP, and start the local node.
    ///
    /// Resolves once the node is running, and has tried to join any configured seeds.
    pub async fn create(self) -> Result<Swarm, Error> {
        self.cfg.validate()?;

        let (transport, incoming) = NetTransport::bind(self.cfg.bind_addr).await?;
        self.create_with(transport, incoming).await
    }

    /// Start the local node on the provided transport.
    ///
    /// Resolves once the node is running, and has tried to join any configured seeds.
    pub async fn create_with<T: Transport>(
        self,
        transport: T,
        incoming: Incoming,
    ) -> Result<Swarm, Error> {
        let Mesh { cfg, delegates } = self;

        let cluster = Cluster::start(cfg, delegates, Arc::new(transport), incoming).await?;

        Ok(Swarm { cluster })
    }
}

/// A running member of a swarm.
///
/// Dropping a [Swarm] shuts the local node down, as if [shutdown](Swarm::shutdown) was
/// called.
pub struct Swarm {
    pub(crate) cluster: Arc<Cluster>,
}

impl Drop for Swarm {
    fn drop(&mut self) {
        self.cluster.signal_shutdown();
    }
}

impl Swarm {
    /// Join a swarm through `seeds`, exchanging full state with each.
    ///
    /// Returns the number of seeds that were contacted. This only fails if none of them
    /// were.
    pub async fn join(&self, seeds: &[SocketAddr]) -> Result<usize, Error> {
        self.cluster.join(seeds).await
    }

    /// Gracefully leave the swarm.
    ///
    /// Other members learn that the local node left, rather than assuming it failed. If
    /// there are other live members, this waits up to `timeout` for the departure to be
    /// gossiped. The node keeps running until [shutdown](Swarm::shutdown) is called.
    pub async fn leave(&self, timeout: Duration) -> Result<(), Error> {
        self.cluster.leave(timeout).await
    }

    /// Re-read the local node's metadata from its [NodeMetaProvider], and announce it.
    ///
    /// If there are other live members, this waits up to `timeout` for the announcement
    /// to be gossiped.
    pub async fn update_node(&self, timeout: Duration) -> Result<(), Error> {
        self.cluster.update_node(timeout).await
    }

    /// Stop the local node without telling anyone. Peers will detect it as failed.
    pub async fn shutdown(&self) {
        self.cluster.shutdown().await
    }

    /// Returns every live member (including the local node), sorted by name.
    pub async fn members(&self) -> Vec<Member> {
        self.cluster.members().await
    }

    /// Returns the number of live members, including the local node.
    pub async fn num_members(&self) -> usize {
        self.cluster.num_members().await
    }

    /// Returns the local node.
    pub async fn local_node(&self) -> Member {
        self.cluster.local_node().await
    }

    /// Subscribe to membership events.
    pub fn subscribe(&self) -> Subscription {
        self.cluster.subscribe()
    }

    /// Returns the keyring, if encryption is enabled.
    pub fn keyring(&self) -> Option<&Keyring> {
        self.cluster.keyring()
    }

    /// Returns the health of the local node. 0 is healthy; higher is worse.
    pub fn health_score(&self) -> u32 {
        self.cluster.health_score()
    }

    /// Returns the address advertised to peers.
    pub fn local_addr(&self) -> SocketAddr {
        self.cluster.local_addr()
    }

    /// Send `msg` to the member named `name` over a stream.
    pub async fn send_reliable(&self, name: &str, msg: &[u8]) -> Result<(), Error> {
        self.cluster.send_reliable(name, msg).await
    }

    /// Send `msg` to the member named `name` in a single packet. Delivery is best effort.
    pub async fn send_best_effort(&self, name: &str, msg: &[u8]) -> Result<(), Error> {
        self.cluster.send_best_effort(name, msg).await
    }

    /// Send `msg` to `addr` in a single packet. Delivery is best effort.
    pub async fn send_to(&self, addr: SocketAddr, msg: &[u8]) -> Result<(), Error> {
        self.cluster.send_to(addr, msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ConfigError;

    #[tokio::test]
    async fn configs_are_validated_before_binding() {
        let nameless = Mesh::new().bind_addr("127.0.0.1:0".parse().unwrap());
        assert!(matches!(
            nameless.create().await,
            Err(Error::Config(ConfigError::EmptyName))
        ));

        let short_key = Mesh::lan().name("a").add_key(vec![0; 7]);
        assert!(matches!(
            short_key.create().await,
            Err(Error::Config(ConfigError::KeySize(7)))
        ));

        let slow = Mesh::wan()
            .name("a")
            .probe_interval(Duration::from_millis(10))
            .probe_timeout(Duration::from_millis(20));
        assert!(matches!(
            slow.create().await,
            Err(Error::Config(ConfigError::ProbeTimeout(..)))
        ));
    }

    #[test]
    fn presets_differ() {
        let (lan, wan, fast) = (Mesh::lan().cfg, Mesh::wan().cfg, Mesh::low_latency().cfg);

        assert!(wan.probe_interval > lan.probe_interval);
        assert!(fast.probe_timeout < lan.probe_timeout);
        assert_eq!(Mesh::new().cfg.probe_interval, lan.probe_interval);
    }
}
