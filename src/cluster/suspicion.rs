// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Suspicion timers.
//!
//! A suspicion starts out with a long timeout, which shrinks logarithmically towards a
//! floor as independent peers confirm it. The more peers that agree a node is down, the
//! sooner it gets declared dead.
use std::{collections::HashSet, time::Duration};
use tokio::{sync::watch, time::Instant};

/// Returns how long a suspicion with `n` of `k` expected confirmations lasts in total.
pub(crate) fn suspicion_time(n: u32, k: u32, min: Duration, max: Duration) -> Duration {
    if k == 0 {
        return min;
    }

    let frac = ((n as f64) + 1.0).ln() / ((k as f64) + 1.0).ln();
    let raw = max.as_secs_f64() - frac * (max.as_secs_f64() - min.as_secs_f64());
    let timeout = Duration::from_millis((1000.0 * raw).max(0.0).floor() as u64);

    timeout.max(min)
}

/// A pending suspicion about a single node.
///
/// The expiry deadline is published through a watch channel; dropping the suspicion
/// closes the channel, which cancels the timer that waits on it.
#[derive(Debug)]
pub(crate) struct Suspicion {
    pub(crate) incarnation: u32,
    confirmations: HashSet<String>,
    k: u32,
    min: Duration,
    max: Duration,
    start: Instant,
    expires: Instant,
    deadline: watch::Sender<Instant>,
}

impl Suspicion {
    /// Start a suspicion raised by `from`, expecting `k` confirmations from other peers.
    pub(crate) fn new(
        from: &str,
        incarnation: u32,
        k: u32,
        min: Duration,
        max: Duration,
    ) -> (Self, watch::Receiver<Instant>) {
        let max = if k == 0 { min } else { max };
        let start = Instant::now();
        let expires = start + max;
        let (deadline, rx) = watch::channel(expires);

        let mut confirmations = HashSet::new();
        confirmations.insert(from.to_owned());

        #[rustfmt::skip]
        let s = Self { incarnation, confirmations, k, min, max, start, expires, deadline };
        (s, rx)
    }

    /// Returns the number of independent confirmations received, excluding the peer that
    /// raised the suspicion.
    pub(crate) fn confirmations(&self) -> u32 {
        self.confirmations.len() as u32 - 1
    }

    /// Returns when the suspicion expires.
    pub(crate) fn deadline(&self) -> Instant {
        self.expires
    }

    /// Record a confirmation from `from`. Returns true if it was new information, in which
    /// case the deadline may have moved closer.
    pub(crate) fn confirm(&mut self, from: &str) -> bool {
        if self.confirmations() >= self.k || self.confirmations.contains(from) {
            return false;
        }
        self.confirmations.insert(from.to_owned());

        let total = suspicion_time(self.confirmations(), self.k, self.min, self.max);
        self.expires = self.start + total;
        // NOTE: fails only if the timer already fired, which is handled at expiry.
        let _ = self.deadline.send(self.expires);

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn no_expected_confirmations_means_floor() {
        let (min, max) = (Duration::from_secs(2), Duration::from_secs(30));
        assert_eq!(min, suspicion_time(0, 0, min, max));

        let (s, rx) = Suspicion::new("a", 0, 0, min, max);
        assert_eq!(*rx.borrow(), s.start + min);
    }

    #[test]
    fn known_values() {
        let (min, max) = (Duration::from_secs(2), Duration::from_secs(30));

        assert_eq!(max, suspicion_time(0, 3, min, max));
        assert_eq!(Duration::from_millis(16_000), suspicion_time(1, 3, min, max));
        assert_eq!(Duration::from_millis(7_810), suspicion_time(2, 3, min, max));
        assert_eq!(min, suspicion_time(3, 3, min, max));
        assert_eq!(min, suspicion_time(4, 3, min, max));
    }

    #[quickcheck]
    fn confirmations_never_extend_the_deadline(k: u8, min_ms: u16, extra_ms: u16) -> bool {
        let k = (k % 16) as u32;
        let min = Duration::from_millis(min_ms as u64);
        let max = min + Duration::from_millis(extra_ms as u64);

        (1..=k).all(|n| {
            let prev = suspicion_time(n - 1, k, min, max);
            let next = suspicion_time(n, k, min, max);
            next <= prev && next >= min
        })
    }

    #[tokio::test]
    async fn confirmations_accelerate_the_deadline() {
        let (min, max) = (Duration::from_secs(2), Duration::from_secs(30));
        let (mut s, rx) = Suspicion::new("a", 7, 3, min, max);

        let mut last = *rx.borrow();
        assert_eq!(s.start + max, last);

        // duplicates and the original accuser don't count
        assert!(!s.confirm("a"));
        assert!(s.confirm("b"));
        assert!(!s.confirm("b"));
        assert!(*rx.borrow() < last);
        last = *rx.borrow();

        assert!(s.confirm("c"));
        assert!(s.confirm("d"));
        assert!(*rx.borrow() < last);
        assert_eq!(s.start + min, s.deadline());

        // saturated at k
        assert!(!s.confirm("e"));
        assert_eq!(3, s.confirmations());
    }

    #[tokio::test]
    async fn dropping_cancels() {
        let (min, max) = (Duration::from_secs(2), Duration::from_secs(30));
        let (s, mut rx) = Suspicion::new("a", 0, 3, min, max);

        drop(s);
        assert!(rx.changed().await.is_err());
    }
}
