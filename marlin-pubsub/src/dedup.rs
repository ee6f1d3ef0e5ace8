#![forbid(unsafe_code)]

//! Bounded de-duplication of `(message_id, channel)` pairs with FIFO
//! eviction and time-based expiry.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

pub const DEFAULT_CAPACITY: usize = 4096;
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

pub struct DedupCache {
    set: HashSet<(u64, u16)>,
    queue: VecDeque<((u64, u16), Instant)>,
    capacity: usize,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            set: HashSet::with_capacity(capacity),
            queue: VecDeque::with_capacity(capacity),
            capacity,
            ttl,
        }
    }

    /// Record the pair. `true` if it was not already present.
    pub fn insert(&mut self, now: Instant, message_id: u64, channel: u16) -> bool {
        self.expire(now);
        let key = (message_id, channel);
        if !self.set.insert(key) {
            return false;
        }
        if self.queue.len() >= self.capacity {
            if let Some((old, _)) = self.queue.pop_front() {
                self.set.remove(&old);
            }
        }
        self.queue.push_back((key, now));
        true
    }

    pub fn contains(&mut self, now: Instant, message_id: u64, channel: u16) -> bool {
        self.expire(now);
        self.set.contains(&(message_id, channel))
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(key, at)) = self.queue.front() {
            if now.duration_since(at) >= self.ttl {
                self.queue.pop_front();
                self.set.remove(&key);
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}
