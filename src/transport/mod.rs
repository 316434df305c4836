// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Network bindings.
//!
//! The membership protocol needs two things from the network: unreliable datagrams for
//! probes and gossip, and reliable streams for push/pull and reliable user messages. A
//! [Transport] provides the sending half of both, and hands inbound traffic to the engine
//! through an [Incoming].
mod net;

pub use net::NetTransport;

use async_trait::async_trait;
use bytes::Bytes;
use std::{io, net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    time::Instant,
};

/// Capacity of the channels that carry inbound traffic to the engine.
pub const INCOMING_DEPTH: usize = 256;

/// A reliable, bidirectional byte stream.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

/// A type-erased [Connection].
pub type Conn = Box<dyn Connection>;

/// A datagram received from a peer.
#[derive(Clone, Debug)]
pub struct Packet {
    /// The raw contents of the datagram.
    pub buf: Bytes,
    /// The address the datagram was received from.
    pub from: SocketAddr,
    /// When the datagram was received.
    pub timestamp: Instant,
}

/// Inbound traffic, as delivered by a [Transport].
pub struct Incoming {
    /// Received datagrams.
    pub packets: mpsc::Receiver<Packet>,
    /// Accepted streams, along with the address of the remote end.
    pub streams: mpsc::Receiver<(Conn, SocketAddr)>,
}

impl Incoming {
    /// Create a set of inbound channels, returning the senders a transport should feed.
    pub fn channel() -> (mpsc::Sender<Packet>, mpsc::Sender<(Conn, SocketAddr)>, Self) {
        let (ptx, packets) = mpsc::channel(INCOMING_DEPTH);
        let (stx, streams) = mpsc::channel(INCOMING_DEPTH);

        (ptx, stx, Self { packets, streams })
    }
}

/// A network binding.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Returns the address this transport is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// Send a datagram to `addr`. Delivery is best effort.
    async fn send_packet(&self, addr: SocketAddr, buf: &[u8]) -> io::Result<()>;

    /// Open a reliable stream to `addr`, failing if it can't be established within
    /// `timeout`.
    async fn open_stream(&self, addr: SocketAddr, timeout: Duration) -> io::Result<Conn>;

    /// Stop receiving traffic, and release any bound sockets.
    async fn shutdown(&self);
}
