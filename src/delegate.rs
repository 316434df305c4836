// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Hooks for applications that ride on top of the membership protocol.
//!
//! Each capability is a separate trait, and each is optional. Every method has a default
//! implementation that does nothing (or accepts), so a swarm with no delegates installed
//! behaves exactly like one with empty implementations of all of them.
use crate::cluster::Member;
use bytes::Bytes;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;

/// A delegate's refusal of a peer or a merge.
#[derive(Clone, Debug, Error)]
#[error("{}", .0)]
pub struct Veto(pub String);

impl Veto {
    /// Create a veto with the provided reason.
    pub fn new<S: Into<String>>(reason: S) -> Self {
        Self(reason.into())
    }
}

/// Supplies the local node's metadata.
pub trait NodeMetaProvider: Send + Sync {
    /// Returns metadata for the local node, which must fit within `limit` bytes.
    ///
    /// Called at startup, and again whenever [update_node](crate::Swarm::update_node) is
    /// called.
    fn node_meta(&self, limit: usize) -> Bytes {
        let _ = limit;
        Bytes::new()
    }
}

/// Receives user messages.
pub trait MessageObserver: Send + Sync {
    /// Called for every user message received, whether it arrived via gossip, a best effort
    /// packet, or a reliable stream. Must not block.
    fn notify_msg(&self, msg: Bytes) {
        let _ = msg;
    }
}

/// Supplies user broadcasts to piggy-back on gossip.
pub trait BroadcastSource: Send + Sync {
    /// Returns messages to gossip. Each message costs its length plus `overhead` bytes, and
    /// the total cost must not exceed `limit`.
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Bytes> {
        let _ = (overhead, limit);
        vec![]
    }
}

/// Exchanges opaque application state during anti-entropy.
pub trait StateExchanger: Send + Sync {
    /// Returns the local state to send to a peer. `join` is true if the exchange is part of
    /// a join.
    fn local_state(&self, join: bool) -> Bytes {
        let _ = join;
        Bytes::new()
    }

    /// Merge state received from a peer.
    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        let _ = (buf, join);
    }
}

/// Observes name conflicts.
pub trait ConflictObserver: Send + Sync {
    /// Called when `other` claims the name of `existing` from a different address.
    fn notify_conflict(&self, existing: &Member, other: &Member) {
        let _ = (existing, other);
    }
}

/// Attaches payloads to acks, and observes completed probes.
pub trait PingObserver: Send + Sync {
    /// Returns a payload to attach to acks sent in response to probes.
    fn ack_payload(&self) -> Bytes {
        Bytes::new()
    }

    /// Called when a direct probe of `other` completes, with the round trip time and the
    /// payload the peer attached to its ack.
    fn notify_ping_complete(&self, other: &Member, rtt: Duration, payload: &[u8]) {
        let _ = (other, rtt, payload);
    }
}

/// Decides which peers may be part of the cluster.
pub trait JoinPolicy: Send + Sync {
    /// Called for every alive claim about a remote peer. A veto causes the claim to be
    /// ignored.
    fn notify_alive(&self, peer: &Member) -> Result<(), Veto> {
        let _ = peer;
        Ok(())
    }
}

/// Decides whether to merge with another cluster.
pub trait MergePolicy: Send + Sync {
    /// Called with the remote view before a push/pull exchange is merged. A veto aborts
    /// the exchange, and is reported by [join](crate::Swarm::join) if the exchange was
    /// part of one.
    fn notify_merge(&self, peers: &[Member]) -> Result<(), Veto> {
        let _ = peers;
        Ok(())
    }
}

/// The set of installed delegates.
#[derive(Clone, Default)]
pub(crate) struct Delegates {
    pub(crate) meta: Option<Arc<dyn NodeMetaProvider>>,
    pub(crate) msgs: Option<Arc<dyn MessageObserver>>,
    pub(crate) broadcasts: Option<Arc<dyn BroadcastSource>>,
    pub(crate) state: Option<Arc<dyn StateExchanger>>,
    pub(crate) conflict: Option<Arc<dyn ConflictObserver>>,
    pub(crate) ping: Option<Arc<dyn PingObserver>>,
    pub(crate) join: Option<Arc<dyn JoinPolicy>>,
    pub(crate) merge: Option<Arc<dyn MergePolicy>>,
}

impl fmt::Debug for Delegates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delegates")
            .field("meta", &self.meta.is_some())
            .field("msgs", &self.msgs.is_some())
            .field("broadcasts", &self.broadcasts.is_some())
            .field("state", &self.state.is_some())
            .field("conflict", &self.conflict.is_some())
            .field("ping", &self.ping.is_some())
            .field("join", &self.join.is_some())
            .field("merge", &self.merge.is_some())
            .finish()
    }
}

impl Delegates {
    /// Returns delegate supplied metadata, or `None` if no provider is installed.
    pub(crate) fn node_meta(&self, limit: usize) -> Option<Bytes> {
        self.meta.as_ref().map(|d| d.node_meta(limit))
    }

    pub(crate) fn notify_msg(&self, msg: Bytes) {
        if let Some(d) = &self.msgs {
            d.notify_msg(msg);
        }
    }

    pub(crate) fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Bytes> {
        match &self.broadcasts {
            Some(d) => d.get_broadcasts(overhead, limit),
            None => vec![],
        }
    }

    pub(crate) fn local_state(&self, join: bool) -> Bytes {
        match &self.state {
            Some(d) => d.local_state(join),
            None => Bytes::new(),
        }
    }

    pub(crate) fn merge_remote_state(&self, buf: &[u8], join: bool) {
        if let Some(d) = &self.state {
            d.merge_remote_state(buf, join);
        }
    }

    pub(crate) fn notify_conflict(&self, existing: &Member, other: &Member) {
        if let Some(d) = &self.conflict {
            d.notify_conflict(existing, other);
        }
    }

    pub(crate) fn ack_payload(&self) -> Bytes {
        match &self.ping {
            Some(d) => d.ack_payload(),
            None => Bytes::new(),
        }
    }

    pub(crate) fn notify_ping_complete(&self, other: &Member, rtt: Duration, payload: &[u8]) {
        if let Some(d) = &self.ping {
            d.notify_ping_complete(other, rtt, payload);
        }
    }

    pub(crate) fn notify_alive(&self, peer: &Member) -> Result<(), Veto> {
        match &self.join {
            Some(d) => d.notify_alive(peer),
            None => Ok(()),
        }
    }

    pub(crate) fn notify_merge(&self, peers: &[Member]) -> Result<(), Veto> {
        match &self.merge {
            Some(d) => d.notify_merge(peers),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemberState;

    struct Empty;

    impl NodeMetaProvider for Empty {}
    impl MessageObserver for Empty {}
    impl BroadcastSource for Empty {}
    impl StateExchanger for Empty {}
    impl ConflictObserver for Empty {}
    impl PingObserver for Empty {}
    impl JoinPolicy for Empty {}
    impl MergePolicy for Empty {}

    fn all_empty() -> Delegates {
        let e = Arc::new(Empty);

        Delegates {
            meta: None,
            msgs: Some(e.clone()),
            broadcasts: Some(e.clone()),
            state: Some(e.clone()),
            conflict: Some(e.clone()),
            ping: Some(e.clone()),
            join: Some(e.clone()),
            merge: Some(e),
        }
    }

    fn member() -> Member {
        Member {
            name: "a".into(),
            addr: "127.0.0.1:7946".parse().unwrap(),
            meta: Bytes::new(),
            state: MemberState::Alive,
            incarnation: 1,
            vsn: [1, 2, 2, 0, 0, 0],
        }
    }

    #[test]
    fn defaults_match_empty_impls() {
        let m = member();

        for d in [Delegates::default(), all_empty()].iter() {
            assert!(d.get_broadcasts(2, 1400).is_empty());
            assert!(d.local_state(true).is_empty());
            assert!(d.ack_payload().is_empty());
            assert!(d.notify_alive(&m).is_ok());
            assert!(d.notify_merge(&[m.clone()]).is_ok());

            d.notify_msg(Bytes::from_static(b"x"));
            d.merge_remote_state(b"x", false);
            d.notify_conflict(&m, &m);
            d.notify_ping_complete(&m, Duration::from_millis(1), b"");
        }

        assert_eq!(None, Delegates::default().node_meta(512));
        assert_eq!(Some(Bytes::new()), Delegates {
            meta: Some(Arc::new(Empty)),
            ..Delegates::default()
        }
        .node_meta(512));
    }
}
