// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! A crate for weakly consistent cluster membership and failure detection.
//!
//! # Overview
//! `gossamer` provides an implementation of distributed membership based on [SWIM], with
//! the [Lifeguard] extensions. Nodes find each other by joining through a seed, learn of
//! the rest of the cluster through gossip, and periodically probe random peers to detect
//! failures.
//!
//! Unlike protocols that agree on each view change (like [rapid]), membership here is
//! eventually consistent: every node converges on the same view, but may briefly
//! disagree with its peers while updates spread.
//!
//! # Failure Detection
//! A node that misses a direct probe is probed indirectly through a few peers, and
//! suspected if those fail too. Suspected nodes are given time to refute the suspicion
//! before they're declared dead; independent confirmations from other peers shorten that
//! time. A node that finds itself unhealthy (missing acks, being accused) slows its own
//! probing down, so it doesn't wrongly accuse others.
//!
//! # Extension
//! Applications can ride on the protocol through [delegates](delegate): attaching
//! metadata to the local node, piggybacking broadcasts on gossip, exchanging state
//! during syncs, and vetoing joins or merges.
//!
//! # References
//! * [SWIM: Scalable Weakly-consistent Infection-style Process Group Membership][SWIM]
//! * [Lifeguard: Local Health Awareness for More Accurate Failure Detection][Lifeguard]
//!
//! [SWIM]: https://www.cs.cornell.edu/projects/Quicksilver/public_pdfs/SWIM.pdf
//! [Lifeguard]: https://arxiv.org/abs/1707.00788
//! [rapid]: https://arxiv.org/abs/1803.03620
#![warn(rust_2018_idioms, missing_docs)]
#![doc(
    issue_tracker_base_url = "https://github.com/nytopop/gossamer/issues/",
    html_root_url = "https://docs.rs/gossamer/0.1.0",
    test(
        no_crate_inject,
        attr(
            deny(rust_2018_idioms, unused_imports, unused_mut),
            allow(unused_variables)
        )
    )
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

#[cfg(test)]
#[test]
fn test_html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}

#[macro_use]
mod macros;

mod cluster;
mod collections;
mod overlay;

pub mod delegate;
pub mod simulation;
pub mod transport;

#[doc(inline)]
pub use cluster::{
    Closed, ConfigError, DecodeError, Error, Keyring, KeyringError, Member, MemberEvent,
    MemberState, Subscription, META_MAX_SIZE, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN,
};
#[doc(inline)]
pub use overlay::{Mesh, Swarm};
