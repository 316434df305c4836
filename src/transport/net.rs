// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
use super::{Conn, Incoming, Packet, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    select,
    sync::{mpsc, watch},
    task,
    time::{self, Instant},
};
use tracing::{info_span, Instrument};

/// Largest datagram we accept.
const MAX_PACKET: usize = 65536;

/// How many times to retry binding an ephemeral port pair.
const BIND_ATTEMPTS: usize = 10;

/// A [Transport] over UDP (datagrams) and TCP (streams), bound to the same port.
#[derive(Debug)]
pub struct NetTransport {
    addr: SocketAddr,
    udp: Arc<UdpSocket>,
    stop: watch::Sender<bool>,
}

impl NetTransport {
    /// Bind to `addr`. If the port is 0, an ephemeral port that is free for both UDP and TCP
    /// is picked.
    pub async fn bind(addr: SocketAddr) -> io::Result<(Self, Incoming)> {
        let (tcp, udp) = bind_pair(addr).await?;
        let addr = tcp.local_addr()?;
        let udp = Arc::new(udp);

        let (stop, stopped) = watch::channel(false);
        let (packets, streams, incoming) = Incoming::channel();

        let span = info_span!("transport", %addr);

        let task = recv_packets(Arc::clone(&udp), packets, stopped.clone());
        task::spawn(task.instrument(span.clone()));

        let task = accept_streams(tcp, streams, stopped);
        task::spawn(task.instrument(span));

        debug!("bound udp and tcp to {}", addr);

        Ok((Self { addr, udp, stop }, incoming))
    }
}

async fn bind_pair(addr: SocketAddr) -> io::Result<(TcpListener, UdpSocket)> {
    let attempts = if addr.port() == 0 { BIND_ATTEMPTS } else { 1 };
    let mut last = None;

    for _ in 0..attempts {
        let tcp = TcpListener::bind(addr).await?;
        let bound = tcp.local_addr()?;

        match UdpSocket::bind(bound).await {
            Ok(udp) => return Ok((tcp, udp)),
            Err(e) => last = Some(e),
        }
    }

    Err(last.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "no free port")))
}

async fn recv_packets(
    udp: Arc<UdpSocket>,
    tx: mpsc::Sender<Packet>,
    mut stopped: watch::Receiver<bool>,
) {
    let mut buf = vec![0; MAX_PACKET];

    loop {
        let (n, from) = select! {
            r = udp.recv_from(&mut buf) => match r {
                Ok(r) => r,
                Err(e) => {
                    warn!("failed to receive packet: {}", e);
                    continue;
                }
            },

            _ = stopped.changed() => break,
        };

        let p = Packet {
            buf: Bytes::copy_from_slice(&buf[..n]),
            from,
            timestamp: Instant::now(),
        };

        if tx.send(p).await.is_err() {
            break;
        }
    }
}

async fn accept_streams(
    tcp: TcpListener,
    tx: mpsc::Sender<(Conn, SocketAddr)>,
    mut stopped: watch::Receiver<bool>,
) {
    loop {
        let (conn, from) = select! {
            r = tcp.accept() => match r {
                Ok(r) => r,
                Err(e) => {
                    warn!("failed to accept stream: {}", e);
                    // NOTE: usually fd exhaustion; don't spin.
                    time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },

            _ = stopped.changed() => break,
        };

        if let Err(e) = conn.set_nodelay(true) {
            debug!("failed to set nodelay on stream from {}: {}", from, e);
        }

        if tx.send((Box::new(conn), from)).await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl Transport for NetTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send_packet(&self, addr: SocketAddr, buf: &[u8]) -> io::Result<()> {
        self.udp.send_to(buf, addr).await.map(|_| ())
    }

    async fn open_stream(&self, addr: SocketAddr, timeout: Duration) -> io::Result<Conn> {
        let conn = time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;

        conn.set_nodelay(true)?;
        Ok(Box::new(conn))
    }

    async fn shutdown(&self) {
        let _ = self.stop.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn datagrams_and_streams_share_a_port() {
        let any = "127.0.0.1:0".parse().unwrap();
        let (a, mut a_in) = NetTransport::bind(any).await.unwrap();
        let (b, mut b_in) = NetTransport::bind(any).await.unwrap();

        a.send_packet(b.local_addr(), b"ping").await.unwrap();
        let p = b_in.packets.recv().await.unwrap();
        assert_eq!(&b"ping"[..], p.buf);
        assert_eq!(a.local_addr(), p.from);

        let mut conn = b.open_stream(a.local_addr(), Duration::from_secs(1)).await.unwrap();
        conn.write_all(b"stream").await.unwrap();

        let (mut accepted, _) = a_in.streams.recv().await.unwrap();
        let mut buf = [0; 6];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(b"stream", &buf);

        a.shutdown().await;
        assert!(a_in.packets.recv().await.is_none());
    }
}
