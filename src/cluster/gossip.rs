// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Epidemic dissemination of queued broadcasts.
use super::{
    config,
    member::MemberState,
    proto::{self, COMPOUND_HEADER_OVERHEAD, COMPOUND_OVERHEAD},
    Cluster,
};
use bytes::Bytes;
use log::warn;
use std::sync::{atomic::Ordering, Arc};
use tokio::time::{self, MissedTickBehavior};

impl Cluster {
    /// Gossip to a few random nodes every gossip interval until the cluster is brought
    /// down.
    pub(crate) async fn gossip_loop(self: Arc<Self>) {
        let mut tick = time::interval(self.cfg.gossip_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            self.gossip().await;
        }
    }

    async fn gossip(&self) {
        let targets = {
            let state = self.state.read().await;

            // recently dead nodes still hear from us, so they can learn of (and refute)
            // their own death.
            state.k_random(self.cfg.gossip_nodes, |n| match n.state {
                MemberState::Alive | MemberState::Suspect => true,
                MemberState::Dead => !state.is_expired(n),
                MemberState::Left => false,
            })
        };

        let limit = self.packet_budget().saturating_sub(COMPOUND_HEADER_OVERHEAD);

        for target in targets {
            let mut msgs = self.get_broadcasts(COMPOUND_OVERHEAD, limit);

            let frame = match msgs.len() {
                0 => return,
                1 => msgs.remove(0),
                _ => proto::make_compound(&msgs),
            };

            if let Err(e) = self.send_raw(target.addr, frame).await {
                warn!("failed to gossip to {}: {}", target.name, e);
            }
        }
    }

    /// Returns queued broadcasts (and then any user broadcasts) that fit in `limit`
    /// bytes, where every message costs an extra `overhead` bytes.
    pub(crate) fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Bytes> {
        let n = self.num_nodes.load(Ordering::Relaxed);
        let retransmits = config::retransmit_limit(self.cfg.retransmit_mult, n);

        let mut msgs = self.queue().get_broadcasts(overhead, limit, retransmits);

        let used: usize = msgs.iter().map(|m| m.len() + overhead).sum();
        let mut avail = limit.saturating_sub(used);

        // user messages also carry a type tag
        let user_overhead = overhead + 1;
        if avail <= user_overhead {
            return msgs;
        }

        for raw in self.delegates.get_broadcasts(user_overhead, avail) {
            let cost = raw.len() + user_overhead;
            if cost > avail {
                warn!("dropping user broadcast of {} bytes, over budget", raw.len());
                continue;
            }

            avail -= cost;
            msgs.push(proto::user_frame(&raw));
        }

        msgs
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        collections::Broadcast,
        delegate::BroadcastSource,
        simulation::Network,
        transport::Transport,
        Mesh,
    };
    use bytes::Bytes;

    struct Chatty;

    impl BroadcastSource for Chatty {
        fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Bytes> {
            assert!(overhead >= 3);
            vec![Bytes::from(vec![1; limit / 2]), Bytes::from(vec![2; limit])]
        }
    }

    #[tokio::test]
    async fn broadcasts_fill_the_budget_in_order() {
        let net = Network::default();
        let (t, incoming) = net.bind("10.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = t.local_addr();

        let swarm = Mesh::low_latency()
            .name("a")
            .broadcast_source(Chatty)
            .create_with(t, incoming)
            .await
            .unwrap();

        let c = &swarm.cluster;
        c.queue().reset();
        c.queue().push(Broadcast::new(None, Bytes::from_static(b"queued")));

        let msgs = c.get_broadcasts(2, 100);
        let used: usize = msgs.iter().map(|m| m.len() + 2).sum();

        assert_eq!(&b"queued"[..], msgs[0]);
        assert_eq!(2, msgs.len());
        assert!(used <= 100);
        assert_eq!(addr, swarm.local_addr());
    }
}
