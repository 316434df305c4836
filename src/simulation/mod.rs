// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Fault-simulated networks for testing the membership protocol in a single process.
use crate::transport::{Conn, Incoming, Packet, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::{hash_map::Entry, HashMap, HashSet},
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::duplex,
    sync::{mpsc, Mutex},
    time::{self, Instant},
};

/// Buffer size of simulated streams.
const STREAM_BUFFER: usize = 64 * 1024;

/// First port handed out when binding to port 0.
const EPHEMERAL_START: u16 = 40000;

/// A simulated network.
///
/// Clones refer to the same network.
#[derive(Clone, Default)]
pub struct Network {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    endpoints: HashMap<SocketAddr, Endpoint>,
    blocked: HashSet<SocketAddr>,
}

#[derive(Clone)]
struct Endpoint {
    packets: mpsc::Sender<Packet>,
    streams: mpsc::Sender<(Conn, SocketAddr)>,
}

impl Inner {
    fn is_blocked(&self, src: SocketAddr, dst: SocketAddr) -> bool {
        self.blocked.contains(&src) || self.blocked.contains(&dst)
    }

    fn ephemeral(&self, addr: SocketAddr) -> io::Result<SocketAddr> {
        (EPHEMERAL_START..=u16::MAX)
            .map(|port| SocketAddr::new(addr.ip(), port))
            .find(|a| !self.endpoints.contains_key(a))
            .ok_or_else(|| ErrorKind::AddrNotAvailable.into())
    }
}

impl Network {
    /// Drop all traffic to and from `addr`, and refuse new streams.
    pub async fn block(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock().await;
        inner.blocked.insert(addr);
    }

    /// Allow traffic to and from `addr` again.
    pub async fn allow(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock().await;
        inner.blocked.remove(&addr);
    }

    /// Bind a transport to `addr`. If the port is 0, a free port is picked.
    pub async fn bind(&self, addr: SocketAddr) -> io::Result<(SimTransport, Incoming)> {
        let mut inner = self.inner.lock().await;

        let addr = match addr.port() {
            0 => inner.ephemeral(addr)?,
            _ => addr,
        };

        let (packets, streams, incoming) = Incoming::channel();

        match inner.endpoints.entry(addr) {
            Entry::Vacant(v) => v.insert(Endpoint { packets, streams }),
            Entry::Occupied(_) => return Err(ErrorKind::AddrInUse.into()),
        };

        let net = self.clone();
        Ok((SimTransport { addr, net }, incoming))
    }
}

/// A [Transport] bound to a simulated [Network].
pub struct SimTransport {
    addr: SocketAddr,
    net: Network,
}

impl SimTransport {
    async fn endpoint(&self, dst: SocketAddr) -> Option<Endpoint> {
        let inner = self.net.inner.lock().await;

        if inner.is_blocked(self.addr, dst) {
            return None;
        }

        inner.endpoints.get(&dst).cloned()
    }
}

#[async_trait]
impl Transport for SimTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send_packet(&self, addr: SocketAddr, buf: &[u8]) -> io::Result<()> {
        if let Some(e) = self.endpoint(addr).await {
            let p = Packet {
                buf: Bytes::copy_from_slice(buf),
                from: self.addr,
                timestamp: Instant::now(),
            };

            // full queues drop, like a real nic would
            let _ = e.packets.try_send(p);
        }

        Ok(())
    }

    async fn open_stream(&self, addr: SocketAddr, timeout: Duration) -> io::Result<Conn> {
        let refused = || io::Error::from(ErrorKind::ConnectionRefused);

        let e = self.endpoint(addr).await.ok_or_else(refused)?;
        let (local, remote) = duplex(STREAM_BUFFER);

        time::timeout(timeout, e.streams.send((Box::new(remote), self.addr)))
            .await
            .map_err(|_| io::Error::from(ErrorKind::TimedOut))?
            .map_err(|_| refused())?;

        Ok(Box::new(local))
    }

    async fn shutdown(&self) {
        let mut inner = self.net.inner.lock().await;
        inner.endpoints.remove(&self.addr);
    }
}
