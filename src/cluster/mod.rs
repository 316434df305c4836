// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! An implementation of [SWIM] with the [Lifeguard] extensions.
//!
//! Each node periodically probes a random peer, falling back to indirect probes through
//! `indirect_checks` other peers (and a stream ping) when the direct probe goes
//! unanswered. Nodes that fail every probe are suspected, and declared dead unless they
//! refute the suspicion before it times out. State changes are disseminated by
//! piggy-backing them on probe traffic and by periodic gossip, and a slower push/pull
//! exchange of full state repairs anything gossip missed.
//!
//! [SWIM]: https://www.cs.cornell.edu/projects/Quicksilver/public_pdfs/SWIM.pdf
//! [Lifeguard]: https://arxiv.org/abs/1707.00788
mod awareness;
mod faultdetect;
mod gossip;
mod keyring;
mod member;
mod pushpull;
mod state;
mod suspicion;

pub(crate) mod config;
pub(crate) mod proto;

pub use config::{ConfigError, META_MAX_SIZE, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN};
pub use keyring::{Keyring, KeyringError};
pub use member::{Closed, Member, MemberEvent, MemberState, Subscription};
pub use proto::DecodeError;

use self::{
    awareness::Awareness,
    config::Config,
    proto::{Ack, ErrResp, Message, MessageType},
    state::{Effects, State},
};
use crate::{
    collections::TransmitQueue,
    delegate::{Delegates, Veto},
    transport::{Conn, Incoming, Packet, Transport},
};
use bytes::Bytes;
use fnv::FnvHashMap;
use log::{debug, info, warn};
use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    select,
    sync::{broadcast, mpsc, oneshot, watch, RwLock},
    task,
    time::{self, Instant},
};
use tracing::{info_span, Instrument};

/// Largest stream frame we'll read.
const MAX_STREAM_FRAME: usize = 20 * 1024 * 1024;

/// How many membership events a subscriber may fall behind by.
const EVENT_BACKLOG: usize = 256;

/// Queued broadcasts past this are pruned, most transmitted first.
const MAX_QUEUED_BROADCASTS: usize = 4096;

/// An error returned by the membership engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration is invalid.
    #[error("invalid configuration: {}", .0)]
    Config(#[from] ConfigError),

    /// A network operation failed.
    #[error("io error: {}", .0)]
    Io(#[from] io::Error),

    /// A peer sent a malformed frame.
    #[error("malformed frame: {}", .0)]
    Decode(#[from] DecodeError),

    /// Encryption or decryption failed.
    #[error("keyring: {}", .0)]
    Keyring(#[from] KeyringError),

    /// A frame arrived unencrypted while encryption is required.
    #[error("unencrypted frame rejected")]
    Unencrypted,

    /// A frame arrived encrypted, but no keyring is installed.
    #[error("encrypted frame, but no keyring is installed")]
    NoKeyring,

    /// A delegate vetoed the operation.
    #[error("vetoed: {}", .0)]
    Veto(#[from] Veto),

    /// The remote end replied with an error.
    #[error("remote error: {}", .0)]
    Remote(String),

    /// The operation did not complete in time.
    #[error("timed out")]
    Timeout,

    /// The local and remote views can't be merged.
    #[error("incompatible protocol: {}", .0)]
    Protocol(String),

    /// None of the seeds could be joined.
    #[error("failed to join any of {} seeds", .0.len())]
    Join(Vec<(SocketAddr, Error)>),

    /// Metadata supplied for the local node is too large.
    #[error("metadata is {} bytes, which exceeds the {} byte limit", .0, META_MAX_SIZE)]
    MetaTooLarge(usize),

    /// No member with the provided name is known.
    #[error("no member named {}", .0)]
    UnknownMember(String),
}

/// An event delivered to a pending probe.
#[derive(Debug)]
enum AckEvent {
    Ack { payload: Bytes, at: Instant },
    Nack,
}

/// Receives acks for a registered sequence number, which is released when this is
/// dropped.
struct AckHandler<'a> {
    cluster: &'a Cluster,
    seq_no: u32,
    rx: mpsc::Receiver<AckEvent>,
}

impl AckHandler<'_> {
    async fn next(&mut self) -> Option<AckEvent> {
        self.rx.recv().await
    }

    /// Wait for an ack, ignoring any nacks.
    async fn ack(&mut self) -> Option<(Bytes, Instant)> {
        loop {
            match self.next().await? {
                AckEvent::Ack { payload, at } => return Some((payload, at)),
                AckEvent::Nack => continue,
            }
        }
    }
}

impl Drop for AckHandler<'_> {
    fn drop(&mut self) {
        self.cluster.acks().remove(&self.seq_no);
    }
}

/// Resolves once `stopped` flips to true (or its sender is gone).
async fn wait_stopped(mut stopped: watch::Receiver<bool>) {
    loop {
        let done = *stopped.borrow();
        if done || stopped.changed().await.is_err() {
            return;
        }
    }
}

/// The membership engine. Shared (via [Arc]) between the handle and background tasks.
pub(crate) struct Cluster {
    cfg: Arc<Config>,
    addr: SocketAddr,
    transport: Arc<dyn Transport>,
    delegates: Delegates,
    keyring: Option<Keyring>,

    state: RwLock<State>,
    broadcasts: Mutex<TransmitQueue>,
    awareness: Awareness,
    num_nodes: AtomicUsize,

    seq_no: AtomicU32,
    acks: Mutex<FnvHashMap<u32, mpsc::Sender<AckEvent>>>,

    handoff: mpsc::Sender<(Message, SocketAddr)>,
    events: broadcast::Sender<MemberEvent>,

    shutdown: watch::Sender<bool>,
    stopped: watch::Receiver<bool>,
}

impl Cluster {
    /// Start a node on `transport`, announce it as alive, spawn every background task,
    /// and join any configured seeds.
    pub(crate) async fn start(
        cfg: Config,
        delegates: Delegates,
        transport: Arc<dyn Transport>,
        incoming: Incoming,
    ) -> Result<Arc<Self>, Error> {
        cfg.validate()?;

        let keyring = match cfg.keys.is_empty() {
            true => None,
            false => Some(Keyring::new(&cfg.keys)?),
        };

        let addr = cfg.resolve_advertise(transport.local_addr())?;

        let meta = (delegates.node_meta(META_MAX_SIZE)).unwrap_or_else(|| cfg.meta.clone());
        if meta.len() > META_MAX_SIZE {
            return Err(Error::MetaTooLarge(meta.len()));
        }

        let cfg = Arc::new(cfg);
        let (handoff, handoffs) = mpsc::channel(cfg.handoff_queue_depth);
        let (events, _) = broadcast::channel(EVENT_BACKLOG);
        let (shutdown, stopped) = watch::channel(false);

        let cluster = Arc::new(Cluster {
            state: RwLock::new(State::new(Arc::clone(&cfg), delegates.clone(), addr)),
            broadcasts: Mutex::new(TransmitQueue::new()),
            awareness: Awareness::new(cfg.awareness_max_multiplier),
            num_nodes: AtomicUsize::new(1),
            seq_no: AtomicU32::new(0),
            acks: Mutex::new(FnvHashMap::default()),
            cfg,
            addr,
            transport,
            delegates,
            keyring,
            handoff,
            events,
            shutdown,
            stopped,
        });

        {
            let mut state = cluster.state.write().await;
            let mut fx = Effects::default();
            state.set_alive(meta, &mut fx);
            cluster.apply(&state, fx);
        }

        info!("{} is alive at {}", cluster.cfg.name, addr);

        let Incoming { packets, streams } = incoming;

        cluster.spawn("packets", Arc::clone(&cluster).recv_packets(packets));
        cluster.spawn("streams", Arc::clone(&cluster).accept_streams(streams));
        cluster.spawn("handoff", Arc::clone(&cluster).handle_handoffs(handoffs));
        cluster.spawn("probe", Arc::clone(&cluster).probe_loop());
        cluster.spawn("gossip", Arc::clone(&cluster).gossip_loop());
        cluster.spawn("pushpull", Arc::clone(&cluster).push_pull_loop());
        cluster.spawn("rejoin", Arc::clone(&cluster).rejoin_loop());

        let transport = Arc::clone(&cluster.transport);
        let stopped = cluster.stopped.clone();
        task::spawn(async move {
            wait_stopped(stopped).await;
            transport.shutdown().await;
        });

        if !cluster.cfg.seeds.is_empty() {
            if let Err(e) = cluster.join(&cluster.cfg.seeds).await {
                warn!("failed to join seeds, will retry: {}", e);
            }
        }

        Ok(cluster)
    }

    /// Spawn a background task that runs until shutdown.
    fn spawn<F>(&self, name: &'static str, f: F)
    where F: Future<Output = ()> + Send + 'static {
        let span = info_span!("gossamer", node = %self.cfg.name, task = name);
        let stopped = self.stopped.clone();

        let task = async move {
            select! {
                _ = f => {}
                _ = wait_stopped(stopped) => {}
            }
        };

        task::spawn(task.instrument(span));
    }

    #[inline]
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    #[inline]
    pub(crate) fn keyring(&self) -> Option<&Keyring> {
        self.keyring.as_ref()
    }

    #[inline]
    pub(crate) fn health_score(&self) -> u32 {
        self.awareness.score()
    }

    #[inline]
    pub(crate) fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    pub(crate) fn subscribe(&self) -> Subscription {
        Subscription::new(self.events.subscribe())
    }

    pub(crate) async fn members(&self) -> Vec<Member> {
        self.state.read().await.members()
    }

    pub(crate) async fn num_members(&self) -> usize {
        self.state.read().await.num_alive()
    }

    pub(crate) async fn local_node(&self) -> Member {
        self.state.read().await.local_member()
    }

    fn queue(&self) -> MutexGuard<'_, TransmitQueue> {
        self.broadcasts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acks(&self) -> MutexGuard<'_, FnvHashMap<u32, mpsc::Sender<AckEvent>>> {
        self.acks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply the side effects of a state transition. `state` must be the state that
    /// produced `fx`.
    fn apply(self: &Arc<Self>, state: &State, fx: Effects) {
        let Effects {
            broadcasts,
            events,
            timers,
            awareness,
        } = fx;

        self.num_nodes.store(state.len(), Ordering::Relaxed);

        if !broadcasts.is_empty() {
            let mut queue = self.queue();
            for b in broadcasts {
                queue.push(b);
            }

            if queue.len() > MAX_QUEUED_BROADCASTS {
                warn!("broadcast queue is backed up, pruning {} items", queue.len());
                queue.prune(MAX_QUEUED_BROADCASTS);
            }
        }

        for e in events {
            // NOTE: fails only if nobody is subscribed.
            let _ = self.events.send(e);
        }

        for t in timers {
            self.start_suspicion_timer(t);
        }

        if awareness != 0 {
            self.awareness.apply_delta(awareness);
        }
    }

    /// Returns the byte budget of a single packet, before encryption.
    fn packet_budget(&self) -> usize {
        match self.keyring {
            Some(_) => (self.cfg.packet_budget).saturating_sub(keyring::overhead()),
            None => self.cfg.packet_budget,
        }
    }

    /// Apply compression and encryption to an outbound frame, as configured.
    fn seal(&self, frame: Bytes) -> Result<Bytes, Error> {
        let frame = match self.cfg.compression {
            true => proto::compress(&frame)?,
            false => frame,
        };

        match &self.keyring {
            Some(k) => Ok(k.encrypt(&frame)?),
            None => Ok(frame),
        }
    }

    /// Remove the encryption layer from an inbound frame, enforcing encryption if
    /// required.
    fn open(&self, frame: Bytes) -> Result<Bytes, Error> {
        let encrypted = proto::peek_type(&frame)? == MessageType::Encrypt;

        match &self.keyring {
            Some(k) if encrypted => Ok(k.decrypt(&frame)?),
            Some(_) if self.cfg.verify_incoming => Err(Error::Unencrypted),
            Some(_) => Ok(frame),
            None if encrypted => Err(Error::NoKeyring),
            None => Ok(frame),
        }
    }

    /// Send a frame as a single packet, without piggy-backing anything.
    async fn send_raw(&self, addr: SocketAddr, frame: Bytes) -> Result<(), Error> {
        let buf = self.seal(frame)?;
        self.transport.send_packet(addr, &buf).await?;
        Ok(())
    }

    /// Send `frames` in a single packet, filling any leftover budget with broadcasts.
    async fn send_frames(&self, addr: SocketAddr, mut frames: Vec<Bytes>) -> Result<(), Error> {
        let used: usize = (frames.iter())
            .map(|f| f.len() + proto::COMPOUND_OVERHEAD)
            .sum::<usize>()
            + proto::COMPOUND_HEADER_OVERHEAD;

        let budget = self.packet_budget().saturating_sub(used);
        frames.extend(self.get_broadcasts(proto::COMPOUND_OVERHEAD, budget));

        let frame = match frames.len() {
            1 => frames.remove(0),
            _ => proto::make_compound(&frames),
        };

        self.send_raw(addr, frame).await
    }

    /// Send a message as a packet, piggy-backing broadcasts.
    async fn send_msg(&self, addr: SocketAddr, msg: Message) -> Result<(), Error> {
        self.send_frames(addr, vec![msg.encode()]).await
    }

    /// Write a length-prefixed frame to a stream.
    async fn write_frame(&self, conn: &mut Conn, frame: Bytes) -> Result<(), Error> {
        let buf = self.seal(frame)?;

        if buf.len() > MAX_STREAM_FRAME {
            return Err(DecodeError::TooLarge.into());
        }

        conn.write_u32(buf.len() as u32).await?;
        conn.write_all(&buf).await?;
        conn.flush().await?;
        Ok(())
    }

    /// Read a length-prefixed frame from a stream.
    async fn read_frame(&self, conn: &mut Conn) -> Result<Bytes, Error> {
        let len = conn.read_u32().await? as usize;

        if len > MAX_STREAM_FRAME {
            return Err(DecodeError::TooLarge.into());
        }

        let mut buf = vec![0; len];
        conn.read_exact(&mut buf).await?;

        let frame = self.open(buf.into())?;
        let inner = (proto::unwrap_frames(frame).into_iter())
            .next()
            .unwrap_or(Err(DecodeError::Empty))?;

        Ok(inner)
    }

    /// Register a handler for acks to a fresh sequence number.
    fn register_ack(&self) -> AckHandler<'_> {
        let seq_no = self.seq_no.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.cfg.indirect_checks + 2);

        self.acks().insert(seq_no, tx);

        AckHandler {
            cluster: self,
            seq_no,
            rx,
        }
    }

    fn notify_ack(&self, seq_no: u32, event: AckEvent) {
        let tx = self.acks().get(&seq_no).cloned();

        match tx {
            Some(tx) => {
                let _ = tx.try_send(event);
            }
            None => debug!("dropping {:?} for unknown seq_no {}", event, seq_no),
        }
    }

    async fn recv_packets(self: Arc<Self>, mut packets: mpsc::Receiver<Packet>) {
        while let Some(p) = packets.recv().await {
            self.handle_packet(p).await;
        }
    }

    async fn handle_packet(self: &Arc<Self>, p: Packet) {
        let Packet {
            buf,
            from,
            timestamp,
        } = p;

        let buf = match self.open(buf) {
            Ok(buf) => buf,
            Err(e) => return warn!("dropping packet from {}: {}", from, e),
        };

        for frame in proto::unwrap_frames(buf) {
            match frame.and_then(Message::decode) {
                Ok(msg) => self.handle_msg(msg, from, timestamp).await,
                Err(e) => warn!("dropping message from {}: {}", from, e),
            }
        }
    }

    async fn handle_msg(self: &Arc<Self>, msg: Message, from: SocketAddr, at: Instant) {
        match msg {
            Message::Ping(p) => {
                if !p.node.is_empty() && p.node != self.cfg.name {
                    return warn!("got ping for {} from {}, but we're not them", p.node, from);
                }

                let ack = Message::Ack(Ack {
                    seq_no: p.seq_no,
                    payload: self.delegates.ack_payload(),
                });

                let to = proto::socket_addr(&p.source_addr).unwrap_or(from);
                if let Err(e) = self.send_msg(to, ack).await {
                    warn!("failed to ack ping from {}: {}", to, e);
                }
            }

            Message::IndirectPing(p) => {
                self.spawn("relay", Arc::clone(self).relay_indirect(p, from));
            }

            Message::Ack(a) => self.notify_ack(a.seq_no, AckEvent::Ack {
                payload: a.payload,
                at,
            }),

            Message::Nack(n) => self.notify_ack(n.seq_no, AckEvent::Nack),

            Message::Err(e) => warn!("{} replied with an error: {}", from, e.error),

            msg => {
                let kind = msg.kind();
                if self.handoff.try_send((msg, from)).is_err() {
                    warn!("handoff queue is full, dropping {:?} from {}", kind, from);
                }
            }
        }
    }

    async fn handle_handoffs(self: Arc<Self>, mut rx: mpsc::Receiver<(Message, SocketAddr)>) {
        while let Some((msg, from)) = rx.recv().await {
            if let Message::User(raw) = msg {
                self.delegates.notify_msg(raw);
                continue;
            }

            let mut state = self.state.write().await;
            let mut fx = Effects::default();

            match &msg {
                Message::Alive(a) => state.alive(a, false, &mut fx),
                Message::Suspect(s) => state.suspect(s, &mut fx),
                Message::Dead(d) => state.dead(d, None, &mut fx),
                msg => debug!("ignoring {:?} from {}", msg.kind(), from),
            }

            self.apply(&state, fx);
        }
    }

    async fn accept_streams(self: Arc<Self>, mut streams: mpsc::Receiver<(Conn, SocketAddr)>) {
        while let Some((conn, from)) = streams.recv().await {
            self.spawn("stream", Arc::clone(&self).handle_stream(conn, from));
        }
    }

    /// Serve a single inbound stream.
    async fn handle_stream(self: Arc<Self>, mut conn: Conn, from: SocketAddr) {
        let served = time::timeout(self.cfg.tcp_timeout, self.serve_stream(&mut conn)).await;

        let e = match served {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(_) => return warn!("stream from {} timed out", from),
        };

        warn!("failed to serve stream from {}: {}", from, e);

        let resp = Message::Err(ErrResp {
            error: e.to_string(),
        });

        // NOTE: the peer may well be gone by now.
        let _ = self.write_frame(&mut conn, resp.encode()).await;
    }

    async fn serve_stream(self: &Arc<Self>, conn: &mut Conn) -> Result<(), Error> {
        let frame = self.read_frame(conn).await?;

        if proto::peek_type(&frame)? == MessageType::PushPull {
            let remote = proto::decode_push_pull(frame)?;
            let local = self.local_push_pull(remote.join).await;
            self.write_frame(conn, local).await?;
            return self.merge_push_pull(remote).await;
        }

        match Message::decode(frame)? {
            Message::Ping(p) => {
                if !p.node.is_empty() && p.node != self.cfg.name {
                    let e = format!("got ping for {}, but we're not them", p.node);
                    return Err(Error::Protocol(e));
                }

                let ack = Message::Ack(Ack {
                    seq_no: p.seq_no,
                    payload: self.delegates.ack_payload(),
                });

                self.write_frame(conn, ack.encode()).await
            }

            Message::User(raw) => {
                self.delegates.notify_msg(raw);
                Ok(())
            }

            msg => Err(DecodeError::Unexpected(msg.kind()).into()),
        }
    }

    /// Gracefully leave the cluster, waiting up to `timeout` for the leave to be
    /// disseminated.
    pub(crate) async fn leave(self: &Arc<Self>, timeout: Duration) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();

        let (started, live) = {
            let mut state = self.state.write().await;
            let mut fx = Effects::default();
            let started = state.leave(tx, &mut fx);
            self.apply(&state, fx);
            (started, state.has_live_peers())
        };

        if !started {
            return Ok(());
        }

        info!("{} is leaving the cluster", self.cfg.name);

        if !live {
            return Ok(());
        }

        time::timeout(timeout, rx)
            .await
            .map(|_| ())
            .map_err(|_| Error::Timeout)
    }

    /// Re-read local metadata and announce it at a fresh incarnation, waiting up to
    /// `timeout` for the announcement to be disseminated.
    pub(crate) async fn update_node(self: &Arc<Self>, timeout: Duration) -> Result<(), Error> {
        let meta = (self.delegates.node_meta(META_MAX_SIZE))
            .unwrap_or_else(|| self.cfg.meta.clone());

        if meta.len() > META_MAX_SIZE {
            return Err(Error::MetaTooLarge(meta.len()));
        }

        let (tx, rx) = oneshot::channel();

        let live = {
            let mut state = self.state.write().await;
            let mut fx = Effects::default();
            state.set_alive(meta, &mut fx);
            fx.notify_last(tx);
            self.apply(&state, fx);
            state.has_live_peers()
        };

        if !live {
            return Ok(());
        }

        time::timeout(timeout, rx)
            .await
            .map(|_| ())
            .map_err(|_| Error::Timeout)
    }

    async fn addr_of(&self, name: &str) -> Result<SocketAddr, Error> {
        (self.state.read().await.get(name))
            .map(|n| n.addr)
            .ok_or_else(|| Error::UnknownMember(name.to_owned()))
    }

    /// Send a user message to `name` over a stream.
    pub(crate) async fn send_reliable(&self, name: &str, msg: &[u8]) -> Result<(), Error> {
        let addr = self.addr_of(name).await?;

        let send = async {
            let mut conn = self.transport.open_stream(addr, self.cfg.tcp_timeout).await?;
            self.write_frame(&mut conn, proto::user_frame(msg)).await
        };

        time::timeout(self.cfg.tcp_timeout, send)
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Send a user message to `name` in a single packet.
    pub(crate) async fn send_best_effort(&self, name: &str, msg: &[u8]) -> Result<(), Error> {
        let addr = self.addr_of(name).await?;
        self.send_to(addr, msg).await
    }

    /// Send a user message to `addr` in a single packet.
    pub(crate) async fn send_to(&self, addr: SocketAddr, msg: &[u8]) -> Result<(), Error> {
        self.send_raw(addr, proto::user_frame(msg)).await
    }

    /// Stop every background task and release the transport, without telling anyone.
    pub(crate) async fn shutdown(&self) {
        if self.is_stopped() {
            return;
        }

        info!("{} is shutting down", self.cfg.name);

        // NOTE: can't fail; we hold a receiver.
        let _ = self.shutdown.send(true);
        self.queue().reset();
        self.transport.shutdown().await;
    }

    /// Signal shutdown without waiting for the transport to be released.
    pub(crate) fn signal_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::Network;

    fn config(name: &str) -> Config {
        Config {
            name: name.into(),
            compression: false,
            ..Config::lan()
        }
    }

    async fn start(net: &Network, cfg: Config) -> Arc<Cluster> {
        let (t, incoming) = net.bind("10.0.0.1:0".parse().unwrap()).await.unwrap();
        Cluster::start(cfg, Delegates::default(), Arc::new(t), incoming)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn starts_alive_and_alone() {
        let net = Network::default();
        let c = start(&net, config("a")).await;

        let local = c.local_node().await;
        assert_eq!("a", local.name());
        assert_eq!(MemberState::Alive, local.state());
        assert_eq!(c.local_addr(), local.addr());
        assert_eq!(1, c.num_members().await);

        c.shutdown().await;
        assert!(c.is_stopped());
    }

    #[tokio::test]
    async fn invalid_configs_are_rejected() {
        let net = Network::default();
        let (t, incoming) = net.bind("10.0.0.1:0".parse().unwrap()).await.unwrap();

        let r = Cluster::start(config(""), Delegates::default(), Arc::new(t), incoming).await;
        assert!(matches!(r, Err(Error::Config(ConfigError::EmptyName))));
    }

    #[tokio::test]
    async fn frames_survive_sealing() {
        let net = Network::default();

        let cfg = Config {
            compression: true,
            keys: vec![vec![7; 16]],
            ..config("a")
        };
        let c = start(&net, cfg).await;

        let frame = Message::User(Bytes::from_static(b"hello")).encode();
        let sealed = c.seal(frame.clone()).unwrap();
        assert_eq!(MessageType::Encrypt, proto::peek_type(&sealed).unwrap());

        let opened = c.open(sealed).unwrap();
        let frames: Vec<_> = proto::unwrap_frames(opened).into_iter().collect();
        assert_eq!(1, frames.len());
        assert_eq!(&frame, frames[0].as_ref().unwrap());

        // plaintext is refused while verifying incoming traffic
        assert!(matches!(c.open(frame), Err(Error::Unencrypted)));
    }

    #[tokio::test]
    async fn ack_handlers_release_their_seq_no() {
        let net = Network::default();
        let c = start(&net, config("a")).await;

        let seq_no = {
            let mut h = c.register_ack();
            c.notify_ack(h.seq_no, AckEvent::Nack);
            c.notify_ack(h.seq_no, AckEvent::Ack {
                payload: Bytes::from_static(b"p"),
                at: Instant::now(),
            });

            let (payload, _) = h.ack().await.unwrap();
            assert_eq!(&b"p"[..], payload);
            h.seq_no
        };

        assert!(!c.acks().contains_key(&seq_no));
    }
}
