// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Local health awareness.
//!
//! A node that is itself struggling (overloaded, dropping packets) tends to accuse healthy
//! peers of failing. Tracking how often our own probes go unanswered lets us slow down
//! and extend timeouts before we start making false accusations.
use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

#[derive(Debug)]
pub(crate) struct Awareness {
    max: u32,
    score: AtomicU32,
}

impl Awareness {
    /// Create an awareness tracker whose score lives in `[0, max)`.
    pub(crate) fn new(max: u32) -> Self {
        Self {
            max: max.max(1),
            score: AtomicU32::new(0),
        }
    }

    /// Adjust the score by `delta`, clamping it to `[0, max)`.
    pub(crate) fn apply_delta(&self, delta: i32) {
        let hi = (self.max - 1) as i64;

        let _ = (self.score).fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            Some((s as i64 + delta as i64).max(0).min(hi) as u32)
        });
    }

    /// Returns the current score. 0 is healthy.
    pub(crate) fn score(&self) -> u32 {
        self.score.load(Ordering::Acquire)
    }

    /// Scale `timeout` by the current score.
    pub(crate) fn scale_timeout(&self, timeout: Duration) -> Duration {
        timeout * (self.score() + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn scales_timeouts() {
        let a = Awareness::new(8);
        let t = Duration::from_millis(100);
        assert_eq!(t, a.scale_timeout(t));

        a.apply_delta(2);
        assert_eq!(2, a.score());
        assert_eq!(t * 3, a.scale_timeout(t));

        a.apply_delta(-1);
        assert_eq!(t * 2, a.scale_timeout(t));
    }

    #[quickcheck]
    fn score_stays_in_bounds(max: u8, deltas: Vec<i8>) -> bool {
        let a = Awareness::new(max as u32);

        deltas.into_iter().all(|d| {
            a.apply_delta(d as i32);
            a.score() < (max as u32).max(1)
        })
    }
}
