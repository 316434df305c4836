// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Shared code referred to by multiple test modules.
#![allow(dead_code)]

use bytes::Bytes;
use gossamer::{delegate::MessageObserver, simulation::Network, Mesh, Swarm};
use log::LevelFilter;
use simplelog::{Config, TestLogger};
use std::{future::Future, net::SocketAddr, time::Duration};
use tokio::{sync::mpsc, time};

/// How long a property may take to hold before a test gives up on it.
pub const PATIENCE: Duration = Duration::from_secs(10);

pub fn init_logger() {
    let _ = TestLogger::init(LevelFilter::Debug, Config::default());
}

/// A mesh with every timer turned down, so clusters converge (and detect failures) in
/// well under a second.
pub fn fast_mesh(name: &str) -> Mesh {
    Mesh::low_latency()
        .name(name)
        .probe_interval(Duration::from_millis(100))
        .probe_timeout(Duration::from_millis(50))
        .gossip_interval(Duration::from_millis(20))
        .push_pull_interval(Duration::from_millis(500))
        .suspicion_mult(2)
        .tcp_timeout(Duration::from_millis(250))
        .tombstone_timeout(Duration::from_millis(500))
}

/// Start `mesh` on a fresh address in `net`.
pub async fn start_in(net: &Network, mesh: Mesh) -> Swarm {
    let (t, incoming) = net.bind("10.0.0.1:0".parse().unwrap()).await.unwrap();
    mesh.create_with(t, incoming).await.unwrap()
}

/// Start a swarm of `names` in `net`, with every node seeded by the first.
pub async fn start_swarm(net: &Network, names: &[&str]) -> Vec<Swarm> {
    let mut swarms: Vec<Swarm> = Vec::new();

    for name in names {
        let mesh = match swarms.first() {
            Some(seed) => fast_mesh(name).seed(seed.local_addr()),
            None => fast_mesh(name),
        };

        swarms.push(start_in(net, mesh).await);
    }

    swarms
}

/// Poll `check` until it returns true, or [PATIENCE] elapses.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let poll = async {
        while !check().await {
            time::sleep(Duration::from_millis(20)).await;
        }
    };

    time::timeout(PATIENCE, poll).await.is_ok()
}

/// Returns true once every swarm sees exactly `n` live members.
pub async fn converged(swarms: &[&Swarm], n: usize) -> bool {
    eventually(move || async move {
        for s in swarms {
            if s.num_members().await != n {
                return false;
            }
        }
        true
    })
    .await
}

/// Returns the names of the live members `s` knows of.
pub async fn names(s: &Swarm) -> Vec<String> {
    s.members().await.iter().map(|m| m.name().to_owned()).collect()
}

/// A [MessageObserver] that forwards every message into a channel.
pub struct Inbox(pub mpsc::UnboundedSender<Bytes>);

impl MessageObserver for Inbox {
    fn notify_msg(&self, msg: Bytes) {
        let _ = self.0.send(msg);
    }
}

pub fn inbox() -> (Inbox, mpsc::UnboundedReceiver<Bytes>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Inbox(tx), rx)
}

/// An address nothing is bound to.
pub fn nowhere() -> SocketAddr {
    "10.9.9.9:1".parse().unwrap()
}
