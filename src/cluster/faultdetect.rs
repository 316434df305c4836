// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Distributed fault detection.
use super::{
    member::MemberState,
    proto::{self, Ack, DecodeError, IndirectPing, Message, Nack, Ping, Suspect},
    state::{Effects, NodeState, Timer},
    AckEvent, Cluster, Error,
};
use bytes::Bytes;
use futures::future::pending;
use log::{debug, info, warn};
use rand::{thread_rng, Rng};
use std::{
    net::SocketAddr,
    sync::{atomic::Ordering, Arc, Weak},
};
use tokio::{
    select,
    time::{self, Instant},
};
use tracing::{info_span, Instrument};

impl Cluster {
    /// Probe one node every probe interval until the cluster is brought down.
    pub(crate) async fn probe_loop(self: Arc<Self>) {
        // stagger the first probe, so nodes started together don't probe in lockstep
        let interval = self.cfg.probe_interval;
        let jitter = interval.mul_f64(thread_rng().gen::<f64>());
        time::sleep(jitter).await;

        loop {
            let start = Instant::now();

            let target = self.state.write().await.next_probe_target();
            if let Some(target) = target {
                self.probe_node(target).await;
            }

            time::sleep_until(start + interval).await;
        }
    }

    fn ping_for(&self, seq_no: u32, target: &NodeState) -> Ping {
        Ping {
            seq_no,
            node: target.name.clone(),
            source_addr: Some(self.addr.into()),
            source_node: self.cfg.name.clone(),
        }
    }

    /// Probe `target` directly, then indirectly through other peers, suspecting it if
    /// nobody hears back before the (awareness scaled) probe interval elapses.
    async fn probe_node(self: &Arc<Self>, target: NodeState) {
        let timeout = self.awareness.scale_timeout(self.cfg.probe_timeout);
        let interval = self.awareness.scale_timeout(self.cfg.probe_interval);

        let start = Instant::now();
        let deadline = start + interval;

        let mut acks = self.register_ack();
        let mut frames = vec![Message::Ping(self.ping_for(acks.seq_no, &target)).encode()];

        // a suspect node may not know it's suspected; tell it, so it can refute
        if target.state == MemberState::Suspect {
            let s = Suspect {
                incarnation: target.incarnation,
                node: target.name.clone(),
                from: self.cfg.name.clone(),
            };
            frames.push(Message::Suspect(s).encode());
        }

        if let Err(e) = self.send_frames(target.addr, frames).await {
            warn!("failed to send ping to {}: {}", target.name, e);
        }

        if let Ok(Some((payload, at))) = time::timeout(timeout, acks.ack()).await {
            self.awareness.apply_delta(-1);

            let rtt = at.saturating_duration_since(start);
            (self.delegates).notify_ping_complete(&target.member(), rtt, &payload);
            return;
        }

        debug!("direct probe of {} timed out, trying indirect probes", target.name);

        let peers = {
            let state = self.state.read().await;
            state.k_random(self.cfg.indirect_checks, |n| {
                n.name != target.name && n.state == MemberState::Alive
            })
        };

        let ind = IndirectPing {
            seq_no: acks.seq_no,
            target: Some(target.addr.into()),
            node: target.name.clone(),
            nack: true,
            source_addr: Some(self.addr.into()),
            source_node: self.cfg.name.clone(),
        };

        let mut expected_nacks: usize = 0;
        for peer in peers.iter() {
            match self.send_msg(peer.addr, Message::IndirectPing(ind.clone())).await {
                Ok(()) => expected_nacks += 1,
                Err(e) => warn!("failed to send indirect ping via {}: {}", peer.name, e),
            }
        }

        let fallback = async {
            if self.cfg.disable_tcp_pings || !self.tcp_ping(&target, deadline).await {
                pending::<()>().await;
            }
        };
        tokio::pin!(fallback);

        let expired = time::sleep_until(deadline);
        tokio::pin!(expired);

        let mut nacks: usize = 0;

        loop {
            select! {
                ev = acks.next() => match ev {
                    Some(AckEvent::Ack { .. }) => return,
                    Some(AckEvent::Nack) => nacks += 1,
                    None => break,
                },

                _ = &mut fallback => {
                    warn!(
                        "was able to reach {} over a stream but not with packets, \
                         network may be misconfigured",
                        target.name,
                    );
                    return;
                }

                _ = &mut expired => break,
            }
        }

        // missing nacks suggest the problem is on our end
        let delta = match expected_nacks {
            0 => 1,
            n => n.saturating_sub(nacks),
        };
        self.awareness.apply_delta(delta as i32);

        info!("suspecting {}, probe failed ({} of {} nacks)", target.name, nacks, expected_nacks);

        let s = Suspect {
            incarnation: target.incarnation,
            node: target.name.clone(),
            from: self.cfg.name.clone(),
        };

        let mut state = self.state.write().await;
        let mut fx = Effects::default();
        state.suspect(&s, &mut fx);
        self.apply(&state, fx);
    }

    /// Ping `target` over a stream. Returns true if it acked before `deadline`.
    async fn tcp_ping(&self, target: &NodeState, deadline: Instant) -> bool {
        let ping = async {
            let timeout = deadline.saturating_duration_since(Instant::now());
            let mut conn = self.transport.open_stream(target.addr, timeout).await?;

            let seq_no = self.seq_no.fetch_add(1, Ordering::Relaxed);
            let ping = Message::Ping(self.ping_for(seq_no, target));
            self.write_frame(&mut conn, ping.encode()).await?;

            match Message::decode(self.read_frame(&mut conn).await?)? {
                Message::Ack(a) if a.seq_no == seq_no => Ok(()),
                Message::Ack(a) => Err(Error::Protocol(format!(
                    "got ack for seq_no {}, expected {}",
                    a.seq_no, seq_no
                ))),
                Message::Err(e) => Err(Error::Remote(e.error)),
                msg => Err(DecodeError::Unexpected(msg.kind()).into()),
            }
        };

        match time::timeout_at(deadline, ping).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("stream ping of {} failed: {}", target.name, e);
                false
            }
            Err(_) => false,
        }
    }

    /// Probe a node on behalf of a peer, relaying the ack (or a nack, if requested).
    pub(crate) async fn relay_indirect(self: Arc<Self>, ind: IndirectPing, from: SocketAddr) {
        let origin = proto::socket_addr(&ind.source_addr).unwrap_or(from);

        let target = match proto::socket_addr(&ind.target) {
            Ok(addr) => addr,
            Err(e) => return warn!("ignoring indirect ping from {}: {}", origin, e),
        };

        let mut acks = self.register_ack();

        let ping = Ping {
            seq_no: acks.seq_no,
            node: ind.node.clone(),
            source_addr: Some(self.addr.into()),
            source_node: self.cfg.name.clone(),
        };

        if let Err(e) = self.send_msg(target, Message::Ping(ping)).await {
            warn!("failed to relay ping to {}: {}", ind.node, e);
        }

        let timeout = self.awareness.scale_timeout(self.cfg.probe_timeout);

        let reply = match time::timeout(timeout, acks.ack()).await {
            Ok(Some(_)) => Message::Ack(Ack {
                seq_no: ind.seq_no,
                payload: Bytes::new(),
            }),

            _ if ind.nack => Message::Nack(Nack { seq_no: ind.seq_no }),

            _ => return,
        };

        drop(acks);

        if let Err(e) = self.send_msg(origin, reply).await {
            warn!("failed to reply to indirect ping from {}: {}", origin, e);
        }
    }

    /// Start a task that declares a suspect node dead once its suspicion expires.
    pub(crate) fn start_suspicion_timer(self: &Arc<Self>, t: Timer) {
        let span = info_span!("gossamer", node = %self.cfg.name, task = "suspicion");
        let task = expire_suspicion(Arc::downgrade(self), t);

        tokio::spawn(task.instrument(span));
    }
}

/// Wait out a suspicion, following its deadline as confirmations arrive. Exits early if
/// the suspicion is dropped (refuted or superseded) or the cluster is gone.
async fn expire_suspicion(cluster: Weak<Cluster>, t: Timer) {
    let Timer {
        name,
        incarnation,
        mut deadline,
    } = t;

    loop {
        let at = *deadline.borrow();

        select! {
            _ = time::sleep_until(at) => break,
            r = deadline.changed() => if r.is_err() {
                return;
            },
        }
    }

    let cluster = match cluster.upgrade() {
        Some(cluster) => cluster,
        None => return,
    };

    let mut state = cluster.state.write().await;
    let mut fx = Effects::default();
    state.expire_suspicion(&name, incarnation, &mut fx);
    cluster.apply(&state, fx);
}
