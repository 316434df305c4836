// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Anti-entropy, joins, and recovery from isolation.
//!
//! Every so often, a node opens a stream to a random peer and the two exchange their
//! full membership tables. Joining is the same exchange, against a seed.
use super::{
    config,
    member::{Member, MemberState},
    proto::{self, ErrResp, MessageType, PushNodeState, PushPull},
    state::Effects,
    Cluster, Error,
};
use bytes::Bytes;
use log::{info, warn};
use prost::Message as _;
use rand::{thread_rng, Rng};
use std::{
    convert::TryInto,
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
};
use tokio::time;

/// Returns the member described by a remote node record, if it's well formed.
fn remote_member(n: &PushNodeState) -> Option<Member> {
    Some(Member {
        name: n.name.clone(),
        addr: n.socket_addr().ok()?,
        meta: n.meta.clone(),
        state: n.member_state().ok()?,
        incarnation: n.incarnation,
        vsn: n.vsn.as_slice().try_into().ok()?,
    })
}

impl Cluster {
    /// Push/pull with a random peer every (size scaled) push/pull interval until the
    /// cluster is brought down.
    pub(crate) async fn push_pull_loop(self: Arc<Self>) {
        let base = self.cfg.push_pull_interval;
        let jitter = base.mul_f64(thread_rng().gen::<f64>());
        time::sleep(jitter).await;

        loop {
            let peer = {
                let state = self.state.read().await;
                state.k_random(1, |n| n.state == MemberState::Alive).pop()
            };

            if let Some(peer) = peer {
                if let Err(e) = self.push_pull_node(peer.addr, false).await {
                    warn!("push/pull with {} failed: {}", peer.name, e);
                }
            }

            let n = self.num_nodes.load(Ordering::Relaxed);
            time::sleep(config::push_pull_scale(base, n)).await;
        }
    }

    /// Retry the configured seeds whenever we find ourselves without live peers.
    pub(crate) async fn rejoin_loop(self: Arc<Self>) {
        if self.cfg.seeds.is_empty() {
            return;
        }

        loop {
            time::sleep(self.cfg.push_pull_interval).await;

            let isolated = {
                let state = self.state.read().await;
                !state.is_leaving() && !state.has_live_peers()
            };

            if !isolated {
                continue;
            }

            match self.join(&self.cfg.seeds).await {
                Ok(n) => info!("rejoined through {} of {} seeds", n, self.cfg.seeds.len()),
                Err(e) => warn!("failed to rejoin: {}", e),
            }
        }
    }

    /// Join a cluster by pushing/pulling with each of `seeds`. Returns how many seeds
    /// were successfully contacted; failing against some of them is not an error.
    pub(crate) async fn join(self: &Arc<Self>, seeds: &[SocketAddr]) -> Result<usize, Error> {
        let mut joined = 0;
        let mut errors = Vec::new();

        for &seed in seeds {
            match self.push_pull_node(seed, true).await {
                Ok(()) => joined += 1,
                Err(e) => {
                    warn!("failed to join {}: {}", seed, e);
                    errors.push((seed, e));
                }
            }
        }

        if joined == 0 && !errors.is_empty() {
            return Err(Error::Join(errors));
        }

        Ok(joined)
    }

    /// Exchange full state with the node at `addr`.
    pub(crate) async fn push_pull_node(
        self: &Arc<Self>,
        addr: SocketAddr,
        join: bool,
    ) -> Result<(), Error> {
        let exchange = async {
            let mut conn = self.transport.open_stream(addr, self.cfg.tcp_timeout).await?;

            let local = self.local_push_pull(join).await;
            self.write_frame(&mut conn, local).await?;

            let frame = self.read_frame(&mut conn).await?;
            match proto::peek_type(&frame)? {
                MessageType::PushPull => {}
                MessageType::Err => {
                    let e = ErrResp::decode(frame.slice(1..)).map_err(proto::DecodeError::from)?;
                    return Err(Error::Remote(e.error));
                }
                kind => return Err(proto::DecodeError::Unexpected(kind).into()),
            }

            let mut remote = proto::decode_push_pull(frame)?;
            // NOTE: the remote echoes our flag, but we're the authority on whether this
            // exchange is a join.
            remote.join = join;
            self.merge_push_pull(remote).await
        };

        time::timeout(self.cfg.tcp_timeout, exchange)
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Encode the local view, along with any delegate state.
    pub(crate) async fn local_push_pull(&self, join: bool) -> Bytes {
        let nodes = self.state.read().await.push_states();
        let user = self.delegates.local_state(join);

        proto::encode_push_pull(join, &nodes, &user)
    }

    /// Merge a remote view into ours, if versions line up and the merge policy agrees.
    pub(crate) async fn merge_push_pull(self: &Arc<Self>, remote: PushPull) -> Result<(), Error> {
        let PushPull {
            join,
            nodes,
            user_state,
        } = remote;

        self.state.read().await.verify_protocol(&nodes).map_err(Error::Protocol)?;

        if self.delegates.merge.is_some() {
            let peers: Vec<Member> = nodes.iter().filter_map(remote_member).collect();
            if let Err(veto) = self.delegates.notify_merge(&peers) {
                warn!("merge with {} peers vetoed: {}", peers.len(), veto);
                return Err(veto.into());
            }
        }

        {
            let mut state = self.state.write().await;
            let mut fx = Effects::default();
            state.merge_remote(&nodes, &mut fx);
            self.apply(&state, fx);
        }

        if !user_state.is_empty() {
            self.delegates.merge_remote_state(&user_state, join);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_records_are_not_members() {
        let good = PushNodeState {
            name: "a".into(),
            addr: Some("10.0.0.1:7946".parse::<SocketAddr>().unwrap().into()),
            meta: Bytes::from_static(b"m"),
            incarnation: 3,
            state: MemberState::Suspect.into(),
            vsn: vec![1, 2, 2, 0, 0, 0],
        };

        let m = remote_member(&good).unwrap();
        assert_eq!("a", m.name());
        assert_eq!(MemberState::Suspect, m.state());
        assert_eq!(3, m.incarnation());
        assert_eq!((1, 2), m.protocol_range());

        let bad = [
            PushNodeState {
                addr: None,
                ..good.clone()
            },
            PushNodeState {
                state: 9,
                ..good.clone()
            },
            PushNodeState {
                vsn: vec![1, 2],
                ..good
            },
        ];

        assert!(bad.iter().all(|n| remote_member(n).is_none()));
    }
}
