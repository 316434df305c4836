// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Members, membership events, and subscriptions to them.
use bytes::Bytes;
use futures::stream::{unfold, Stream};
use log::warn;
use std::{convert::TryFrom, net::SocketAddr, result};
use thiserror::Error;
use tokio::sync::broadcast::{error::RecvError, Receiver};

/// An error returned by [recv](Subscription::recv) if the subscription source was dropped.
///
/// If this error is received, the local node can be assumed to have stopped executing.
#[derive(Copy, Clone, Debug, Error)]
#[error("closed")]
pub struct Closed;

/// The liveness state of a member.
///
/// When two claims about a member carry the same incarnation, the one with the later
/// variant wins: `Alive < Suspect < Dead < Left`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemberState {
    /// Responding to probes.
    Alive,
    /// Failed a probe, and may be declared dead unless it refutes.
    Suspect,
    /// Declared dead after a suspicion period expired.
    Dead,
    /// Left the cluster voluntarily.
    Left,
}

impl MemberState {
    /// Returns true if the member is dead or has left.
    pub fn is_tombstone(self) -> bool {
        matches!(self, MemberState::Dead | MemberState::Left)
    }
}

impl TryFrom<u32> for MemberState {
    type Error = u32;

    fn try_from(v: u32) -> Result<Self, u32> {
        match v {
            0 => Ok(MemberState::Alive),
            1 => Ok(MemberState::Suspect),
            2 => Ok(MemberState::Dead),
            3 => Ok(MemberState::Left),
            v => Err(v),
        }
    }
}

impl From<MemberState> for u32 {
    fn from(s: MemberState) -> Self {
        s as u32
    }
}

/// A snapshot of a single member of the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub(crate) name: String,
    pub(crate) addr: SocketAddr,
    pub(crate) meta: Bytes,
    pub(crate) state: MemberState,
    pub(crate) incarnation: u32,
    pub(crate) vsn: [u8; 6],
}

impl Member {
    /// Returns the member's unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the member's advertised address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the member's metadata, as supplied by its [NodeMetaProvider][crate::delegate::NodeMetaProvider].
    pub fn meta(&self) -> &Bytes {
        &self.meta
    }

    /// Returns the member's state when this snapshot was taken.
    pub fn state(&self) -> MemberState {
        self.state
    }

    /// Returns the member's incarnation.
    pub fn incarnation(&self) -> u32 {
        self.incarnation
    }

    /// Returns the range of protocol versions the member understands, as `(min, max)`.
    pub fn protocol_range(&self) -> (u8, u8) {
        (self.vsn[0], self.vsn[1])
    }

    /// Returns the protocol version the member speaks.
    pub fn protocol_version(&self) -> u8 {
        self.vsn[2]
    }

    /// Returns the range of delegate versions the member understands, as `(min, max)`.
    pub fn delegate_range(&self) -> (u8, u8) {
        (self.vsn[3], self.vsn[4])
    }

    /// Returns the delegate version the member speaks.
    pub fn delegate_version(&self) -> u8 {
        self.vsn[5]
    }
}

/// A change to the membership of the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemberEvent {
    /// A member was discovered, or came back after being dead.
    Joined(Member),
    /// A member's metadata or address changed.
    Updated(Member),
    /// A member died or left.
    Left(Member),
}

impl MemberEvent {
    /// Returns the member this event is about.
    pub fn member(&self) -> &Member {
        match self {
            MemberEvent::Joined(m) | MemberEvent::Updated(m) | MemberEvent::Left(m) => m,
        }
    }
}

/// A subscription to membership events.
pub struct Subscription {
    rx: Receiver<MemberEvent>,
}

impl Subscription {
    pub(crate) fn new(rx: Receiver<MemberEvent>) -> Self {
        Self { rx }
    }

    /// Resolves when the next membership event occurs, or the subscription ends.
    ///
    /// Subscribers that fall too far behind skip the events they missed.
    pub async fn recv(&mut self) -> result::Result<MemberEvent, Closed> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(event),

                Err(RecvError::Closed) => return Err(Closed),

                Err(RecvError::Lagged(n)) => warn!("subscriber lagged, skipped {} events", n),
            }
        }
    }

    /// Convert this subscription into a [Stream] of membership events.
    pub fn into_stream(self) -> impl Stream<Item = MemberEvent> {
        unfold(self, |mut s| async { Some((s.recv().await.ok()?, s)) })
    }

    /// Borrow this subscription as a [Stream] of membership events.
    pub fn as_stream(&mut self) -> impl Stream<Item = MemberEvent> + '_ {
        unfold(self, |s| async { Some((s.recv().await.ok()?, s)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::sync::broadcast;

    #[test]
    fn precedence_orders_claims() {
        use MemberState::*;

        assert!(Alive < Suspect && Suspect < Dead && Dead < Left);
        assert!(!Suspect.is_tombstone());
        assert!(Dead.is_tombstone() && Left.is_tombstone());

        for s in [Alive, Suspect, Dead, Left].iter().copied() {
            assert_eq!(Ok(s), MemberState::try_from(u32::from(s)));
        }
        assert_eq!(Err(4), MemberState::try_from(4));
    }

    fn member(name: &str) -> Member {
        Member {
            name: name.into(),
            addr: "127.0.0.1:7946".parse().unwrap(),
            meta: Bytes::new(),
            state: MemberState::Alive,
            incarnation: 0,
            vsn: [1, 2, 2, 0, 0, 0],
        }
    }

    #[tokio::test]
    async fn lagging_subscribers_skip_ahead() {
        let (tx, rx) = broadcast::channel(2);
        let mut sub = Subscription::new(rx);

        for n in 0..4 {
            tx.send(MemberEvent::Joined(member(&n.to_string()))).unwrap();
        }

        let e = sub.recv().await.unwrap();
        assert_eq!("2", e.member().name());

        drop(tx);
        let rest: Vec<_> = sub.into_stream().collect().await;
        assert_eq!(1, rest.len());
        assert_eq!("3", rest[0].member().name());
    }
}
