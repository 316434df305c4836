// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! The membership table, and the state machine that drives it.
//!
//! Claims about a node are ordered by `(incarnation, state)`, where states at equal
//! incarnations are ordered `Alive < Suspect < Dead < Left`. A claim is only accepted if
//! it is strictly greater than what we already know, which makes applying claims
//! commutative and idempotent: any two tables that see the same claims end up in the same
//! place, regardless of order or duplication.
//!
//! The exceptions are claims about the local node, which are refuted rather than applied,
//! and reclaims, where a name that has been dead for long enough is taken over by a new
//! address.
//!
//! Nothing in here does any io. Every operation records its side effects (broadcasts to
//! queue, events to publish, timers to start) in an [Effects], which the caller applies.
use super::{
    config::{self, Config, META_MAX_SIZE, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN},
    member::{Member, MemberEvent, MemberState},
    proto::{self, Message},
    suspicion::Suspicion,
};
use crate::{collections::Broadcast, delegate::Delegates};
use bytes::Bytes;
use fnv::FnvHashMap;
use log::{debug, error, info, warn};
use rand::{seq::SliceRandom, thread_rng, Rng};
use std::{
    convert::{TryFrom, TryInto},
    net::SocketAddr,
    sync::Arc,
};
use tokio::{
    sync::{oneshot, watch},
    time::Instant,
};

/// The local view of a single node.
#[derive(Clone, Debug)]
pub(crate) struct NodeState {
    pub(crate) name: String,
    pub(crate) addr: SocketAddr,
    pub(crate) meta: Bytes,
    pub(crate) vsn: [u8; 6],
    pub(crate) incarnation: u32,
    pub(crate) state: MemberState,
    pub(crate) state_change: Instant,
}

impl NodeState {
    pub(crate) fn member(&self) -> Member {
        Member {
            name: self.name.clone(),
            addr: self.addr,
            meta: self.meta.clone(),
            state: self.state,
            incarnation: self.incarnation,
            vsn: self.vsn,
        }
    }

    fn claim(&self) -> (u32, MemberState) {
        (self.incarnation, self.state)
    }

    pub(crate) fn push_state(&self) -> proto::PushNodeState {
        proto::PushNodeState {
            name: self.name.clone(),
            addr: Some(self.addr.into()),
            meta: self.meta.clone(),
            incarnation: self.incarnation,
            state: self.state.into(),
            vsn: self.vsn.to_vec(),
        }
    }
}

/// A suspicion timer that needs to be started.
#[derive(Debug)]
pub(crate) struct Timer {
    pub(crate) name: String,
    pub(crate) incarnation: u32,
    pub(crate) deadline: watch::Receiver<Instant>,
}

/// Side effects of a state transition.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub(crate) broadcasts: Vec<Broadcast>,
    pub(crate) events: Vec<MemberEvent>,
    pub(crate) timers: Vec<Timer>,
    pub(crate) awareness: i32,
}

impl Effects {
    fn broadcast(&mut self, name: &str, msg: Message, notify: Option<oneshot::Sender<()>>) {
        let b = Broadcast::new(Some(name.to_owned()), msg.encode());

        self.broadcasts.push(match notify {
            Some(tx) => b.with_notify(tx),
            None => b,
        });
    }

    /// Fire `tx` once the most recently recorded broadcast is no longer queued. If there
    /// is no such broadcast, `tx` is dropped.
    pub(crate) fn notify_last(&mut self, tx: oneshot::Sender<()>) {
        if let Some(b) = self.broadcasts.pop() {
            self.broadcasts.push(b.with_notify(tx));
        }
    }
}

/// Returns true if a node advertising `theirs` can talk to a node advertising `ours`.
fn compatible(ours: &[u8; 6], theirs: &[u8; 6]) -> bool {
    let within = |v, lo, hi| lo <= v && v <= hi;

    within(ours[2], theirs[0], theirs[1])
        && within(theirs[2], PROTOCOL_VERSION_MIN, PROTOCOL_VERSION_MAX)
        && within(ours[5], theirs[3], theirs[4])
        && within(theirs[5], ours[3], ours[4])
}

#[derive(Debug)]
pub(crate) struct State {
    cfg: Arc<Config>,
    delegates: Delegates,
    local: String,
    addr: SocketAddr,
    vsn: [u8; 6],
    nodes: FnvHashMap<String, NodeState>,
    order: Vec<String>,
    probe_index: usize,
    suspicions: FnvHashMap<String, Suspicion>,
    leaving: bool,
}

impl State {
    /// Create an empty table for a local node named by `cfg`, advertising `addr`. The
    /// local node is added by [set_alive](Self::set_alive).
    pub(crate) fn new(cfg: Arc<Config>, delegates: Delegates, addr: SocketAddr) -> Self {
        Self {
            local: cfg.name.clone(),
            vsn: cfg.vsn(),
            cfg,
            delegates,
            addr,
            nodes: FnvHashMap::default(),
            order: vec![],
            probe_index: 0,
            suspicions: FnvHashMap::default(),
            leaving: false,
        }
    }

    pub(crate) fn local_node(&self) -> Option<&NodeState> {
        self.nodes.get(&self.local)
    }

    /// Returns the local node as a member. Before the local node is announced, this is
    /// a placeholder at incarnation 0.
    pub(crate) fn local_member(&self) -> Member {
        match self.local_node() {
            Some(n) => n.member(),
            None => Member {
                name: self.local.clone(),
                addr: self.addr,
                meta: Bytes::new(),
                state: MemberState::Alive,
                incarnation: 0,
                vsn: self.vsn,
            },
        }
    }

    pub(crate) fn local_incarnation(&self) -> u32 {
        self.local_node().map(|n| n.incarnation).unwrap_or(0)
    }

    pub(crate) fn is_leaving(&self) -> bool {
        self.leaving
    }

    pub(crate) fn get(&self, name: &str) -> Option<&NodeState> {
        self.nodes.get(name)
    }

    /// Returns the number of nodes in the table, including tombstones.
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns every alive node, sorted by name.
    pub(crate) fn members(&self) -> Vec<Member> {
        let mut members: Vec<_> = (self.nodes.values())
            .filter(|n| n.state == MemberState::Alive)
            .map(NodeState::member)
            .collect();

        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    /// Returns the number of alive nodes.
    pub(crate) fn num_alive(&self) -> usize {
        (self.nodes.values())
            .filter(|n| n.state == MemberState::Alive)
            .count()
    }

    /// Returns true if any node other than ourselves is alive.
    pub(crate) fn has_live_peers(&self) -> bool {
        (self.nodes.values()).any(|n| n.name != self.local && n.state == MemberState::Alive)
    }

    /// Returns the full table, as sent during push/pull.
    pub(crate) fn push_states(&self) -> Vec<proto::PushNodeState> {
        self.nodes.values().map(NodeState::push_state).collect()
    }

    /// Returns up to `k` random nodes other than ourselves that satisfy `filter`.
    pub(crate) fn k_random<F>(&self, k: usize, filter: F) -> Vec<NodeState>
    where F: Fn(&NodeState) -> bool {
        let candidates: Vec<&NodeState> = (self.nodes.values())
            .filter(|n| n.name != self.local && filter(n))
            .collect();

        (candidates.choose_multiple(&mut thread_rng(), k))
            .map(|n| NodeState::clone(n))
            .collect()
    }

    /// Returns true if `n` is a tombstone that has outlived the tombstone ttl.
    pub(crate) fn is_expired(&self, n: &NodeState) -> bool {
        n.state.is_tombstone() && n.state_change.elapsed() >= self.cfg.tombstone_timeout
    }

    /// Returns the next node to probe, walking the table round-robin. The walk is
    /// reshuffled (and expired tombstones reaped) every time it wraps.
    pub(crate) fn next_probe_target(&mut self) -> Option<NodeState> {
        let mut checked = 0;

        loop {
            guard!(checked <= 2 * self.order.len());

            if self.probe_index >= self.order.len() {
                self.reset_probe_order();
                checked += 1;
                continue;
            }

            let name = &self.order[self.probe_index];
            self.probe_index += 1;

            match self.nodes.get(name) {
                Some(n) if n.name != self.local && !n.state.is_tombstone() => {
                    return Some(n.clone());
                }

                _ => checked += 1,
            }
        }
    }

    fn reset_probe_order(&mut self) {
        let reaped: Vec<String> = (self.nodes.values())
            .filter(|n| n.name != self.local && self.is_expired(n))
            .map(|n| n.name.clone())
            .collect();

        for name in reaped {
            debug!("reaping tombstone for {}", name);
            self.nodes.remove(&name);
        }

        let nodes = &self.nodes;
        self.order.retain(|name| nodes.contains_key(name));
        self.order.shuffle(&mut thread_rng());
        self.probe_index = 0;
    }

    fn insert(&mut self, n: NodeState) {
        let name = n.name.clone();
        self.nodes.insert(name.clone(), n);

        // insert at a random position, so new nodes are probed at a random time
        self.order.push(name);
        let last = self.order.len() - 1;
        let i = thread_rng().gen_range(0..=last);
        self.order.swap(i, last);
    }

    /// Bump our incarnation past `accused`, and broadcast that we're alive.
    fn refute(&mut self, accused: u32, fx: &mut Effects) {
        let local = match self.nodes.get_mut(&self.local) {
            Some(n) => n,
            None => return,
        };

        local.incarnation = local.incarnation.max(accused).wrapping_add(1);
        fx.awareness += 1;

        let msg = Message::Alive(proto::Alive {
            incarnation: local.incarnation,
            node: local.name.clone(),
            addr: Some(local.addr.into()),
            meta: local.meta.clone(),
            vsn: local.vsn.to_vec(),
        });

        fx.broadcast(&self.local, msg, None);
    }

    /// Announce the local node as alive with `meta`, at a fresh incarnation.
    pub(crate) fn set_alive(&mut self, meta: Bytes, fx: &mut Effects) {
        let incarnation = match self.local_node() {
            Some(n) => n.incarnation.wrapping_add(1),
            None => 1,
        };

        let a = proto::Alive {
            incarnation,
            node: self.local.clone(),
            addr: Some(self.addr.into()),
            meta,
            vsn: self.vsn.to_vec(),
        };

        self.alive(&a, true, fx);
    }

    /// Apply an alive claim. `bootstrap` is set for claims the local node makes about
    /// itself.
    pub(crate) fn alive(&mut self, a: &proto::Alive, bootstrap: bool, fx: &mut Effects) {
        let is_local = a.node == self.local;

        if is_local && self.leaving {
            return;
        }

        let addr = match proto::socket_addr(&a.addr) {
            Ok(addr) => addr,
            Err(e) => return warn!("ignoring alive message for {}: {}", a.node, e),
        };

        let vsn: [u8; 6] = match a.vsn.as_slice().try_into() {
            Ok(vsn) => vsn,
            Err(_) => return warn!("ignoring alive message for {}: bad version", a.node),
        };

        if a.meta.len() > META_MAX_SIZE {
            return warn!("ignoring alive message for {}: metadata too large", a.node);
        }

        if !bootstrap && !compatible(&self.vsn, &vsn) {
            return warn!("ignoring alive message for {}: incompatible version", a.node);
        }

        let claimed = Member {
            name: a.node.clone(),
            addr,
            meta: a.meta.clone(),
            state: MemberState::Alive,
            incarnation: a.incarnation,
            vsn,
        };

        if !is_local {
            if let Err(veto) = self.delegates.notify_alive(&claimed) {
                return warn!("ignoring alive message for {}: {}", a.node, veto);
            }
        }

        match self.nodes.get(&a.node) {
            None => {}

            Some(n) if n.addr != addr => {
                let expired = n.state_change.elapsed() >= self.cfg.tombstone_timeout;

                match n.state {
                    MemberState::Dead | MemberState::Left if expired => {}

                    _ => {
                        error!(
                            "conflicting address for {}: {} claims {} (state: {:?})",
                            a.node, addr, n.addr, n.state,
                        );
                        return self.delegates.notify_conflict(&n.member(), &claimed);
                    }
                }

                info!("updating address for {}: {} -> {}", a.node, n.addr, addr);
            }

            Some(n) => {
                if is_local && a.incarnation < n.incarnation {
                    return;
                }
                if !is_local && a.incarnation <= n.incarnation {
                    return;
                }
            }
        }

        self.suspicions.remove(&a.node);

        if is_local && !bootstrap {
            // NOTE: our own claims echo back to us; only refute ones that say otherwise.
            if let Some(n) = self.nodes.get(&a.node) {
                if a.incarnation == n.incarnation && a.meta == n.meta && vsn == n.vsn {
                    return;
                }
            }

            warn!("refuting alive message for {} at {}", a.node, addr);
            return self.refute(a.incarnation, fx);
        }

        let now = Instant::now();
        let (old, prev) = match self.nodes.get_mut(&a.node) {
            Some(n) => {
                let old = (n.state, n.addr, n.meta.clone());
                n.addr = addr;
                n.meta = a.meta.clone();
                n.vsn = vsn;
                n.incarnation = a.incarnation;
                if n.state != MemberState::Alive {
                    n.state = MemberState::Alive;
                    n.state_change = now;
                }
                (Some(old), n.member())
            }

            None => {
                #[rustfmt::skip]
                let n = NodeState {
                    name: a.node.clone(), addr, meta: a.meta.clone(), vsn,
                    incarnation: a.incarnation, state: MemberState::Alive, state_change: now,
                };
                let m = n.member();
                self.insert(n);
                (None, m)
            }
        };

        fx.broadcast(&a.node, Message::Alive(a.clone()), None);

        match old {
            None => {
                debug!("discovered {} at {}", a.node, addr);
                fx.events.push(MemberEvent::Joined(prev));
            }

            Some((state, _, _)) if state.is_tombstone() => {
                info!("{} is alive again at {}", a.node, addr);
                fx.events.push(MemberEvent::Joined(prev));
            }

            Some((_, old_addr, old_meta)) if old_addr != addr || old_meta != a.meta => {
                fx.events.push(MemberEvent::Updated(prev));
            }

            Some(_) => {}
        }
    }

    /// Apply a suspect claim.
    pub(crate) fn suspect(&mut self, s: &proto::Suspect, fx: &mut Effects) {
        let n = match self.nodes.get_mut(&s.node) {
            Some(n) => n,
            None => return,
        };

        let claim = (s.incarnation, MemberState::Suspect);

        if n.name == self.local {
            if !self.leaving && claim > n.claim() {
                warn!("refuting suspect message from {} (inc: {})", s.from, s.incarnation);
                self.refute(s.incarnation, fx);
            }
            return;
        }

        // only a refutation or a reclaim brings a tombstone back
        if n.state.is_tombstone() || claim < n.claim() {
            return;
        }

        if claim == n.claim() {
            if let Some(sus) = self.suspicions.get_mut(&s.node) {
                if sus.confirm(&s.from) {
                    debug!("{} confirmed suspicion of {}", s.from, s.node);
                    fx.broadcast(&s.node, Message::Suspect(s.clone()), None);
                }
            }
            return;
        }

        n.incarnation = s.incarnation;
        n.state = MemberState::Suspect;
        n.state_change = Instant::now();

        info!("suspecting {} (inc: {}, from: {})", s.node, s.incarnation, s.from);
        fx.broadcast(&s.node, Message::Suspect(s.clone()), None);

        let cfg = &self.cfg;
        let num = self.nodes.len();

        // the expected number of independent confirmations
        let mut k = cfg.suspicion_mult.saturating_sub(2);
        if num < k as usize + 2 {
            k = 0;
        }

        let min = config::suspicion_timeout(cfg.suspicion_mult, num, cfg.probe_interval);
        let max = min * cfg.suspicion_max_timeout_mult;

        let (sus, deadline) = Suspicion::new(&s.from, s.incarnation, k, min, max);
        self.suspicions.insert(s.node.clone(), sus);

        fx.timers.push(Timer {
            name: s.node.clone(),
            incarnation: s.incarnation,
            deadline,
        });
    }

    /// Apply a dead claim, or a leave if `d.from == d.node`. `notify` fires once the
    /// resulting broadcast is no longer queued.
    pub(crate) fn dead(
        &mut self,
        d: &proto::Dead,
        notify: Option<oneshot::Sender<()>>,
        fx: &mut Effects,
    ) {
        let n = match self.nodes.get_mut(&d.node) {
            Some(n) => n,
            None => return,
        };

        let state = if d.from == d.node {
            MemberState::Left
        } else {
            MemberState::Dead
        };
        let claim = (d.incarnation, state);

        if n.name == self.local && !self.leaving {
            if claim > n.claim() {
                warn!("refuting dead message from {} (inc: {})", d.from, d.incarnation);
                self.refute(d.incarnation, fx);
            }
            return;
        }

        if n.state == MemberState::Left || claim <= n.claim() {
            return;
        }

        let was = n.state;
        n.incarnation = d.incarnation;
        n.state = state;
        n.state_change = Instant::now();
        let member = n.member();

        self.suspicions.remove(&d.node);

        match state {
            MemberState::Left => info!("{} left the cluster", d.node),
            _ => info!("{} is dead (from: {})", d.node, d.from),
        }

        fx.broadcast(&d.node, Message::Dead(d.clone()), notify);

        if !was.is_tombstone() {
            fx.events.push(MemberEvent::Left(member));
        }
    }

    /// Handle the expiry of a suspicion timer started at `incarnation`. Does nothing if
    /// the suspicion was refuted or superseded in the meantime.
    pub(crate) fn expire_suspicion(&mut self, name: &str, incarnation: u32, fx: &mut Effects) {
        let confirmations = match self.suspicions.get(name) {
            Some(s) if s.incarnation == incarnation => s.confirmations(),
            _ => return,
        };

        match self.nodes.get(name) {
            Some(n) if n.claim() == (incarnation, MemberState::Suspect) => {}
            _ => return,
        }

        info!(
            "marking {} as failed, suspect timeout reached ({} peer confirmations)",
            name, confirmations,
        );

        let d = proto::Dead {
            incarnation,
            node: name.to_owned(),
            from: self.local.clone(),
        };

        self.dead(&d, None, fx);
    }

    /// Start leaving the cluster. Returns false if we were already leaving.
    pub(crate) fn leave(&mut self, notify: oneshot::Sender<()>, fx: &mut Effects) -> bool {
        if self.leaving {
            return false;
        }
        self.leaving = true;

        let d = proto::Dead {
            incarnation: self.local_incarnation(),
            node: self.local.clone(),
            from: self.local.clone(),
        };

        self.dead(&d, Some(notify), fx);
        true
    }

    /// Check that every node in the local and remote views can talk to every other.
    pub(crate) fn verify_protocol(&self, remote: &[proto::PushNodeState]) -> Result<(), String> {
        let mut versions: Vec<(&str, [u8; 6])> = Vec::with_capacity(remote.len() + self.len());

        for r in remote {
            if r.member_state().map(MemberState::is_tombstone).unwrap_or(false) {
                continue;
            }
            let vsn = <[u8; 6]>::try_from(r.vsn.as_slice())
                .map_err(|_| format!("{} advertised a malformed version", r.name))?;
            versions.push((r.name.as_str(), vsn));
        }

        (self.nodes.values())
            .filter(|n| !n.state.is_tombstone())
            .for_each(|n| versions.push((n.name.as_str(), n.vsn)));

        let lo = |i: usize| versions.iter().map(|(_, v)| v[i]).max().unwrap_or(0);
        let hi = |i: usize| versions.iter().map(|(_, v)| v[i]).min().unwrap_or(u8::MAX);

        let (pmin, pmax) = (lo(0), hi(1));
        let (dmin, dmax) = (lo(3), hi(4));

        for (name, v) in versions.iter() {
            if v[2] < pmin || v[2] > pmax {
                return Err(format!(
                    "{} protocol version ({}) is incompatible: [{}, {}]",
                    name, v[2], pmin, pmax
                ));
            }
            if v[5] < dmin || v[5] > dmax {
                return Err(format!(
                    "{} delegate version ({}) is incompatible: [{}, {}]",
                    name, v[5], dmin, dmax
                ));
            }
        }

        Ok(())
    }

    /// Merge a remote view received during push/pull. Remote dead nodes are merely
    /// suspected, giving them a chance to refute.
    pub(crate) fn merge_remote(&mut self, remote: &[proto::PushNodeState], fx: &mut Effects) {
        for r in remote {
            let state = match r.member_state() {
                Ok(state) => state,
                Err(e) => {
                    warn!("ignoring remote state for {}: {}", r.name, e);
                    continue;
                }
            };

            match state {
                MemberState::Alive => {
                    let a = proto::Alive {
                        incarnation: r.incarnation,
                        node: r.name.clone(),
                        addr: r.addr.clone(),
                        meta: r.meta.clone(),
                        vsn: r.vsn.clone(),
                    };
                    self.alive(&a, false, fx);
                }

                MemberState::Left => {
                    let d = proto::Dead {
                        incarnation: r.incarnation,
                        node: r.name.clone(),
                        from: r.name.clone(),
                    };
                    self.dead(&d, None, fx);
                }

                MemberState::Dead | MemberState::Suspect => {
                    let s = proto::Suspect {
                        incarnation: r.incarnation,
                        node: r.name.clone(),
                        from: self.local.clone(),
                    };
                    self.suspect(&s, fx);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::delegate::{ConflictObserver, JoinPolicy, Veto};
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;
    use std::{
        collections::BTreeMap,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    const NAMES: &[&str] = &["a", "b", "c", "d"];

    fn addr_of(name: &str) -> SocketAddr {
        let port = 7000 + name.bytes().map(|b| b as u16).sum::<u16>();
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn config(name: &str) -> Config {
        Config {
            name: name.into(),
            ..Config::lan()
        }
    }

    fn table_with(cfg: Config, delegates: Delegates) -> State {
        let addr = addr_of(&cfg.name);
        let mut s = State::new(Arc::new(cfg), delegates, addr);
        s.set_alive(Bytes::new(), &mut Effects::default());
        s
    }

    fn table() -> State {
        table_with(config("self"), Delegates::default())
    }

    fn alive_at(name: &str, incarnation: u32, addr: SocketAddr) -> proto::Alive {
        proto::Alive {
            incarnation,
            node: name.into(),
            addr: Some(addr.into()),
            meta: Bytes::new(),
            vsn: Config::lan().vsn().to_vec(),
        }
    }

    fn alive(name: &str, incarnation: u32) -> proto::Alive {
        alive_at(name, incarnation, addr_of(name))
    }

    fn suspect(name: &str, incarnation: u32, from: &str) -> proto::Suspect {
        proto::Suspect {
            incarnation,
            node: name.into(),
            from: from.into(),
        }
    }

    fn dead(name: &str, incarnation: u32, from: &str) -> proto::Dead {
        proto::Dead {
            incarnation,
            node: name.into(),
            from: from.into(),
        }
    }

    fn snapshot(s: &State) -> BTreeMap<String, (MemberState, u32)> {
        (s.nodes.values())
            .map(|n| (n.name.clone(), (n.state, n.incarnation)))
            .collect()
    }

    fn state_of(s: &State, name: &str) -> (MemberState, u32) {
        let n = s.get(name).unwrap();
        (n.state, n.incarnation)
    }

    #[derive(Clone, Debug)]
    pub enum Op {
        Alive(&'static str, u32),
        Suspect(&'static str, u32, &'static str),
        Dead(&'static str, u32, &'static str),
        Leave(&'static str, u32),
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Self {
            let name = *g.choose(NAMES).unwrap();
            let from = *g.choose(NAMES).unwrap();
            let inc = u32::arbitrary(g) % 6;

            match u8::arbitrary(g) % 4 {
                0 => Op::Alive(name, inc),
                1 => Op::Suspect(name, inc, from),
                2 => Op::Dead(name, inc, from),
                _ => Op::Leave(name, inc),
            }
        }
    }

    fn apply(s: &mut State, op: &Op) -> Effects {
        let mut fx = Effects::default();
        match *op {
            Op::Alive(n, i) => s.alive(&alive(n, i), false, &mut fx),
            Op::Suspect(n, i, f) => s.suspect(&suspect(n, i, f), &mut fx),
            Op::Dead(n, i, f) => s.dead(&dead(n, i, f), None, &mut fx),
            Op::Leave(n, i) => s.dead(&dead(n, i, n), None, &mut fx),
        }
        fx
    }

    fn seeded() -> State {
        let mut s = table();
        for name in NAMES {
            s.alive(&alive(name, 0), false, &mut Effects::default());
        }
        s
    }

    fn converges(ops: Vec<Op>) -> bool {
        let (mut x, mut y) = (seeded(), seeded());

        for op in ops.iter() {
            apply(&mut x, op);
        }

        let mut shuffled: Vec<&Op> = ops.iter().chain(ops.iter()).collect();
        shuffled.shuffle(&mut thread_rng());
        for op in shuffled {
            apply(&mut y, op);
        }

        snapshot(&x) == snapshot(&y)
    }

    // tombstones absorb suspicion and later deaths, so only these subsets commute

    #[quickcheck]
    fn liveness_claims_commute(ops: Vec<Op>) -> bool {
        converges(
            ops.into_iter()
                .filter(|op| matches!(op, Op::Alive(..) | Op::Suspect(..)))
                .collect(),
        )
    }

    #[quickcheck]
    fn death_claims_commute(ops: Vec<Op>) -> bool {
        converges(
            ops.into_iter()
                .filter(|op| match *op {
                    Op::Alive(..) => true,
                    Op::Dead(n, _, from) => n != from,
                    _ => false,
                })
                .collect(),
        )
    }

    fn target(op: &Op) -> &'static str {
        match *op {
            Op::Alive(n, _) | Op::Suspect(n, _, _) | Op::Dead(n, _, _) | Op::Leave(n, _) => n,
        }
    }

    #[quickcheck]
    fn tombstones_yield_only_to_alive(ops: Vec<Op>, last: Op) -> bool {
        let mut s = seeded();
        for op in ops.iter() {
            apply(&mut s, op);
        }

        let name = target(&last);
        let (was, _) = state_of(&s, name);
        if !was.is_tombstone() || matches!(last, Op::Alive(..)) {
            return true;
        }

        let fx = apply(&mut s, &last);
        let (now, _) = state_of(&s, name);

        let kept = match was {
            MemberState::Left => now == MemberState::Left,
            _ => now.is_tombstone(),
        };
        kept && fx.events.is_empty() && fx.timers.is_empty()
    }

    #[test]
    fn suspicion_does_not_resurrect_the_dead() {
        let mut s = seeded();
        s.dead(&dead("a", 0, "b"), None, &mut Effects::default());

        let mut fx = Effects::default();
        s.suspect(&suspect("a", 1, "b"), &mut fx);
        assert_eq!((MemberState::Dead, 0), state_of(&s, "a"));
        assert!(fx.timers.is_empty());
        assert!(fx.broadcasts.is_empty());
        assert!(!s.suspicions.contains_key("a"));

        let mut fx = Effects::default();
        s.expire_suspicion("a", 1, &mut fx);
        assert_eq!((MemberState::Dead, 0), state_of(&s, "a"));
        assert!(fx.events.is_empty());

        // a refutation still does
        let mut fx = Effects::default();
        s.alive(&alive("a", 1), false, &mut fx);
        assert_eq!((MemberState::Alive, 1), state_of(&s, "a"));
        assert!(matches!(&fx.events[..], [MemberEvent::Joined(_)]));
    }

    #[test]
    fn departures_are_not_overwritten_by_deaths() {
        let mut s = seeded();
        s.dead(&dead("a", 0, "a"), None, &mut Effects::default());

        let mut fx = Effects::default();
        s.dead(&dead("a", 4, "b"), None, &mut fx);
        s.suspect(&suspect("a", 4, "b"), &mut fx);

        assert_eq!((MemberState::Left, 0), state_of(&s, "a"));
        assert!(fx.broadcasts.is_empty());
        assert!(fx.events.is_empty());
    }

    #[quickcheck]
    fn stale_alive_claims_change_nothing(ops: Vec<Op>, name: u8, back: u32) -> bool {
        let mut s = seeded();
        for op in ops.iter() {
            apply(&mut s, op);
        }

        let name = NAMES[name as usize % NAMES.len()];
        let before = snapshot(&s);
        let inc = before[name].1.saturating_sub(back % 3);

        let fx = apply(&mut s, &Op::Alive(name, inc));
        snapshot(&s) == before && fx.broadcasts.is_empty() && fx.events.is_empty()
    }

    #[quickcheck]
    fn accepted_changes_broadcast_once(ops: Vec<Op>) -> bool {
        let mut s = seeded();

        ops.iter().all(|op| {
            let before = snapshot(&s);
            let fx = apply(&mut s, op);

            let changed = snapshot(&s) != before;
            let confirmation = matches!(op, Op::Suspect(..)) && !changed;

            match (changed, fx.broadcasts.len()) {
                (true, 1) | (false, 0) => true,
                (false, 1) => confirmation,
                _ => false,
            }
        })
    }

    #[tokio::test]
    async fn alive_cancels_suspicion() {
        let mut s = seeded();
        s.alive(&alive("a", 1), false, &mut Effects::default());

        let mut fx = Effects::default();
        s.suspect(&suspect("a", 1, "b"), &mut fx);
        assert_eq!((MemberState::Suspect, 1), state_of(&s, "a"));
        assert_eq!(1, fx.timers.len());

        let mut timer = fx.timers.pop().unwrap();

        // equal incarnation doesn't refute
        s.alive(&alive("a", 1), false, &mut Effects::default());
        assert_eq!((MemberState::Suspect, 1), state_of(&s, "a"));

        s.alive(&alive("a", 2), false, &mut Effects::default());
        assert_eq!((MemberState::Alive, 2), state_of(&s, "a"));
        assert!(timer.deadline.changed().await.is_err());

        // a stale expiry is a no-op
        s.expire_suspicion("a", 1, &mut Effects::default());
        assert_eq!((MemberState::Alive, 2), state_of(&s, "a"));
    }

    #[test]
    fn expired_suspicion_declares_death() {
        let mut s = seeded();
        s.suspect(&suspect("a", 0, "b"), &mut Effects::default());

        let mut fx = Effects::default();
        s.expire_suspicion("a", 0, &mut fx);

        assert_eq!((MemberState::Dead, 0), state_of(&s, "a"));
        assert_eq!(1, fx.broadcasts.len());
        assert!(matches!(&fx.events[..], [MemberEvent::Left(m)] if m.name() == "a"));
        assert!(s.members().iter().all(|m| m.name() != "a"));
    }

    #[test]
    fn suspicion_is_confirmed_by_distinct_peers() {
        let mut s = seeded();
        s.suspect(&suspect("a", 0, "b"), &mut Effects::default());

        let mut fx = Effects::default();
        s.suspect(&suspect("a", 0, "b"), &mut fx);
        assert!(fx.broadcasts.is_empty());

        let before = s.suspicions["a"].deadline();
        s.suspect(&suspect("a", 0, "c"), &mut fx);
        assert_eq!(1, fx.broadcasts.len());
        assert!(s.suspicions["a"].deadline() < before);
    }

    #[test]
    fn accusations_against_us_are_refuted() {
        let mut s = seeded();
        let inc = s.local_incarnation();

        let mut fx = Effects::default();
        s.suspect(&suspect("self", inc, "a"), &mut fx);
        assert_eq!(inc + 1, s.local_incarnation());
        assert_eq!(1, fx.awareness);
        assert_eq!(1, fx.broadcasts.len());

        let mut fx = Effects::default();
        s.dead(&dead("self", inc + 5, "a"), None, &mut fx);
        assert_eq!(inc + 6, s.local_incarnation());
        assert_eq!(MemberState::Alive, s.local_node().unwrap().state);

        // stale accusations are ignored
        let mut fx = Effects::default();
        s.suspect(&suspect("self", inc, "a"), &mut fx);
        assert!(fx.broadcasts.is_empty());

        // and so are echoes of our own claims
        let echo = alive_at("self", s.local_incarnation(), addr_of("self"));
        let mut fx = Effects::default();
        s.alive(&echo, false, &mut fx);
        assert!(fx.broadcasts.is_empty());
        assert_eq!(inc + 6, s.local_incarnation());
    }

    #[test]
    fn leaving_marks_us_left() {
        let mut s = seeded();
        let (tx, _rx) = oneshot::channel();

        let mut fx = Effects::default();
        assert!(s.leave(tx, &mut fx));
        assert_eq!(MemberState::Left, s.local_node().unwrap().state);
        assert_eq!(1, fx.broadcasts.len());

        let (tx, _rx) = oneshot::channel();
        assert!(!s.leave(tx, &mut Effects::default()));

        // alive claims about us are ignored from now on
        s.alive(&alive("self", 99), false, &mut Effects::default());
        assert_eq!(MemberState::Left, s.local_node().unwrap().state);
    }

    #[test]
    fn leave_beats_dead_at_equal_incarnation() {
        let mut s = seeded();

        s.dead(&dead("a", 0, "b"), None, &mut Effects::default());
        let mut fx = Effects::default();
        s.dead(&dead("a", 0, "a"), None, &mut fx);

        assert_eq!((MemberState::Left, 0), state_of(&s, "a"));
        assert!(fx.events.is_empty());
    }

    #[derive(Default)]
    struct Conflicts(AtomicUsize);

    impl ConflictObserver for Conflicts {
        fn notify_conflict(&self, existing: &Member, other: &Member) {
            assert_eq!(existing.name(), other.name());
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn live_names_conflict_but_tombstones_are_reclaimed() {
        let conflicts = Arc::new(Conflicts::default());
        let delegates = Delegates {
            conflict: Some(conflicts.clone()),
            ..Delegates::default()
        };

        let cfg = Config {
            tombstone_timeout: Duration::from_secs(3600),
            ..config("self")
        };
        let mut s = table_with(cfg, delegates);
        s.alive(&alive("a", 3), false, &mut Effects::default());

        let elsewhere = SocketAddr::from(([10, 0, 0, 2], 9000));

        // alive elsewhere: conflict
        s.alive(&alive_at("a", 9, elsewhere), false, &mut Effects::default());
        assert_eq!(1, conflicts.0.load(Ordering::SeqCst));
        assert_eq!(addr_of("a"), s.get("a").unwrap().addr);

        // dead, but not for long enough: conflict
        s.dead(&dead("a", 3, "b"), None, &mut Effects::default());
        s.alive(&alive_at("a", 9, elsewhere), false, &mut Effects::default());
        assert_eq!(2, conflicts.0.load(Ordering::SeqCst));

        // left, but not for long enough: conflict
        s.alive(&alive("a", 4), false, &mut Effects::default());
        s.dead(&dead("a", 4, "a"), None, &mut Effects::default());
        assert_eq!((MemberState::Left, 4), state_of(&s, "a"));

        s.alive(&alive_at("a", 9, elsewhere), false, &mut Effects::default());
        assert_eq!(3, conflicts.0.load(Ordering::SeqCst));
        assert_eq!((MemberState::Left, 4), state_of(&s, "a"));
        assert_eq!(addr_of("a"), s.get("a").unwrap().addr);
    }

    #[test]
    fn expired_tombstones_are_reclaimed() {
        let cfg = Config {
            tombstone_timeout: Duration::from_secs(0),
            ..config("self")
        };
        let mut s = table_with(cfg, Delegates::default());
        s.alive(&alive("a", 3), false, &mut Effects::default());
        s.dead(&dead("a", 3, "b"), None, &mut Effects::default());

        let elsewhere = SocketAddr::from(([10, 0, 0, 2], 9000));
        s.alive(&alive_at("a", 1, elsewhere), false, &mut Effects::default());
        assert_eq!((MemberState::Alive, 1), state_of(&s, "a"));
        assert_eq!(elsewhere, s.get("a").unwrap().addr);

        // left: reclaimed whatever the incarnation
        s.dead(&dead("a", 1, "a"), None, &mut Effects::default());
        let mut fx = Effects::default();
        s.alive(&alive_at("a", 0, addr_of("a")), false, &mut fx);

        assert_eq!((MemberState::Alive, 0), state_of(&s, "a"));
        assert_eq!(addr_of("a"), s.get("a").unwrap().addr);
        assert!(matches!(&fx.events[..], [MemberEvent::Joined(m)] if m.addr() == addr_of("a")));
        assert_eq!(1, s.members().iter().filter(|m| m.name() == "a").count());
    }

    struct OnlyA;

    impl JoinPolicy for OnlyA {
        fn notify_alive(&self, peer: &Member) -> Result<(), Veto> {
            if peer.name().starts_with('a') {
                Ok(())
            } else {
                Err(Veto::new("not an a"))
            }
        }
    }

    #[test]
    fn join_policy_vetoes_peers() {
        let delegates = Delegates {
            join: Some(Arc::new(OnlyA)),
            ..Delegates::default()
        };
        let mut s = table_with(config("self"), delegates);

        s.alive(&alive("a", 1), false, &mut Effects::default());
        s.alive(&alive("b", 1), false, &mut Effects::default());

        assert!(s.get("a").is_some());
        assert!(s.get("b").is_none());
    }

    #[test]
    fn incompatible_peers_are_ignored() {
        let mut s = table();

        let mut a = alive("a", 1);
        a.vsn = vec![3, 4, 3, 0, 0, 0];
        s.alive(&a, false, &mut Effects::default());
        assert!(s.get("a").is_none());

        a.vsn = vec![1, 2];
        s.alive(&a, false, &mut Effects::default());
        assert!(s.get("a").is_none());
    }

    #[test]
    fn new_nodes_and_updates_emit_events() {
        let mut s = table();

        let mut fx = Effects::default();
        s.alive(&alive("a", 1), false, &mut fx);
        assert!(matches!(&fx.events[..], [MemberEvent::Joined(_)]));

        let mut a = alive("a", 2);
        a.meta = Bytes::from_static(b"weight=3");
        let mut fx = Effects::default();
        s.alive(&a, false, &mut fx);
        assert!(matches!(&fx.events[..], [MemberEvent::Updated(m)] if m.meta() == "weight=3"));

        let mut fx = Effects::default();
        s.alive(&alive("a", 3), false, &mut fx);
        assert_eq!(1, fx.broadcasts.len());
        assert!(matches!(&fx.events[..], [MemberEvent::Updated(_)]));
    }

    #[test]
    fn probes_skip_self_and_tombstones() {
        let mut s = seeded();
        s.dead(&dead("a", 0, "b"), None, &mut Effects::default());
        s.dead(&dead("b", 0, "b"), None, &mut Effects::default());

        for _ in 0..20 {
            let n = s.next_probe_target().unwrap();
            assert!(n.name == "c" || n.name == "d");
        }
    }

    #[test]
    fn probe_order_visits_everyone_per_round() {
        let mut s = seeded();
        s.next_probe_target();
        s.reset_probe_order();

        let mut seen: Vec<String> = (0..4).map(|_| s.next_probe_target().unwrap().name).collect();
        seen.sort();
        assert_eq!(vec!["a", "b", "c", "d"], seen);
    }

    #[test]
    fn expired_tombstones_are_reaped_on_wrap() {
        let cfg = Config {
            tombstone_timeout: Duration::from_secs(0),
            ..config("self")
        };
        let mut s = table_with(cfg, Delegates::default());
        s.alive(&alive("a", 1), false, &mut Effects::default());
        s.alive(&alive("b", 1), false, &mut Effects::default());
        s.dead(&dead("a", 1, "b"), None, &mut Effects::default());

        assert_eq!("b", s.next_probe_target().unwrap().name);
        assert_eq!("b", s.next_probe_target().unwrap().name);
        assert!(s.get("a").is_none());
        assert!(s.get("self").is_some());
    }

    #[test]
    fn empty_tables_have_no_probe_targets() {
        let mut s = table();
        assert!(s.next_probe_target().is_none());
    }

    #[test]
    fn remote_dead_nodes_are_only_suspected() {
        let mut s = seeded();

        let mut remote = seeded();
        remote.alive(&alive("a", 1), false, &mut Effects::default());
        remote.dead(&dead("a", 1, "b"), None, &mut Effects::default());
        remote.dead(&dead("b", 0, "b"), None, &mut Effects::default());
        remote.alive(&alive("e", 1), false, &mut Effects::default());

        let mut fx = Effects::default();
        s.merge_remote(&remote.push_states(), &mut fx);

        assert_eq!((MemberState::Suspect, 1), state_of(&s, "a"));
        assert_eq!((MemberState::Left, 0), state_of(&s, "b"));
        assert_eq!((MemberState::Alive, 1), state_of(&s, "e"));
        assert_eq!(1, fx.timers.len());
    }

    #[test]
    fn protocol_verification() {
        let s = seeded();
        let mut remote = seeded().push_states();
        assert!(s.verify_protocol(&remote).is_ok());

        remote[0].vsn = vec![1, 1, 1, 0, 0, 0];
        assert!(s.verify_protocol(&remote).is_err());

        remote[0].vsn = vec![1];
        assert!(s.verify_protocol(&remote).is_err());
    }
}
