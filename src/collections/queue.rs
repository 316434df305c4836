// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
use bytes::Bytes;
use fnv::FnvHashMap;
use std::{cmp::Reverse, collections::BTreeMap};
use tokio::sync::oneshot;

/// A message queued for dissemination.
#[derive(Debug)]
pub struct Broadcast {
    name: Option<String>,
    msg: Bytes,
    notify: Option<oneshot::Sender<()>>,
}

impl Broadcast {
    /// Create a broadcast. If `name` is set, queueing this broadcast invalidates any
    /// queued broadcast with the same name.
    pub fn new(name: Option<String>, msg: Bytes) -> Self {
        Self {
            name,
            msg,
            notify: None,
        }
    }

    /// Fire `tx` once this broadcast is no longer queued, either because it was sent
    /// enough times or because it was invalidated.
    pub fn with_notify(mut self, tx: oneshot::Sender<()>) -> Self {
        self.notify = Some(tx);
        self
    }

    fn finish(mut self) {
        if let Some(tx) = self.notify.take() {
            let _ = tx.send(());
        }
    }
}

/// (transmits, newest first)
type Key = (usize, Reverse<u64>);

/// A queue of broadcasts that are retransmitted a limited number of times.
///
/// Broadcasts that have been transmitted the fewest times are handed out first, and among
/// those, the newest first.
#[derive(Debug, Default)]
pub struct TransmitQueue {
    items: BTreeMap<Key, Broadcast>,
    by_name: FnvHashMap<String, Key>,
    next_id: u64,
}

impl TransmitQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of queued broadcasts.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if no broadcasts are queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Queue a broadcast, invalidating any older broadcast with the same name.
    pub fn push(&mut self, b: Broadcast) {
        let key = (0, Reverse(self.next_id));
        self.next_id += 1;

        if let Some(name) = b.name.clone() {
            if let Some(old) = self.by_name.insert(name, key) {
                if let Some(old) = self.items.remove(&old) {
                    old.finish();
                }
            }
        }

        self.items.insert(key, b);
    }

    /// Returns as many broadcasts as fit in `limit` bytes, where each broadcast also costs
    /// `overhead` bytes. Broadcasts that have now been sent `retransmit_limit` times are
    /// removed.
    pub fn get_broadcasts(
        &mut self,
        overhead: usize,
        limit: usize,
        retransmit_limit: usize,
    ) -> Vec<Bytes> {
        let mut used = 0;
        let mut sent = Vec::new();

        for (key, b) in self.items.iter() {
            if limit - used < overhead {
                break;
            }

            let cost = overhead + b.msg.len();
            if used + cost > limit {
                continue;
            }

            used += cost;
            sent.push(*key);
        }

        let mut out = Vec::with_capacity(sent.len());

        for key in sent {
            let b = match self.items.remove(&key) {
                Some(b) => b,
                None => continue,
            };
            out.push(b.msg.clone());

            let transmits = key.0 + 1;
            if transmits >= retransmit_limit.max(1) {
                if let Some(name) = &b.name {
                    self.by_name.remove(name);
                }
                b.finish();
                continue;
            }

            let next = (transmits, key.1);
            if let Some(name) = &b.name {
                self.by_name.insert(name.clone(), next);
            }
            self.items.insert(next, b);
        }

        out
    }

    /// Drop the most-transmitted broadcasts until at most `max` remain.
    pub fn prune(&mut self, max: usize) {
        while self.items.len() > max {
            let key = match self.items.keys().next_back() {
                Some(key) => *key,
                None => break,
            };

            if let Some(b) = self.items.remove(&key) {
                if let Some(name) = &b.name {
                    self.by_name.remove(name);
                }
                b.finish();
            }
        }
    }

    /// Drop every queued broadcast.
    pub fn reset(&mut self) {
        self.by_name.clear();
        for (_, b) in std::mem::take(&mut self.items) {
            b.finish();
        }
    }
}
