//! Bounded, retransmit-prioritized broadcast queue piggybacked on probe
//! traffic (spec §4.1, §5 back-pressure: "oldest entries are dropped with a
//! counter").

use serde::{Deserialize, Serialize};
use std::collections::BinaryHeap;
use std::cmp::Ordering;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Broadcast {
    pub payload: Vec<u8>,
    pub retransmits_remaining: u32,
}

impl Ord for Broadcast {
    fn cmp(&self, other: &Self) -> Ordering {
        self.retransmits_remaining.cmp(&other.retransmits_remaining)
    }
}

impl PartialOrd for Broadcast {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct BroadcastQueue {
    queue: BinaryHeap<Broadcast>,
    capacity: usize,
    dropped: u64,
}

impl BroadcastQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: BinaryHeap::new(),
            capacity,
            dropped: 0,
        }
    }

    /// Queue a broadcast for piggybacking, given a transmit budget (spec
    /// §4.1: `retransmit_mult * log(N)`).
    pub fn push(&mut self, payload: Vec<u8>, retransmit_budget: u32) {
        if self.queue.len() >= self.capacity {
            // Evict the broadcast with the fewest remaining retransmits --
            // it has already propagated the most.
            if let Some(min) = self
                .queue
                .iter()
                .min_by_key(|b| b.retransmits_remaining)
                .cloned()
            {
                self.queue.retain(|b| b != &min);
                self.dropped += 1;
            }
        }
        self.queue.push(Broadcast {
            payload,
            retransmits_remaining: retransmit_budget,
        });
    }

    /// Drain up to `n` broadcasts for piggybacking on the next outgoing
    /// packet, decrementing their retransmit budget and dropping any that
    /// have exhausted it.
    pub fn drain_for_piggyback(&mut self, n: usize) -> Vec<Broadcast> {
        let mut out = Vec::new();
        let mut leftover = Vec::new();
        while out.len() < n {
            let Some(mut b) = self.queue.pop() else {
                break;
            };
            out.push(b.clone());
            if b.retransmits_remaining > 1 {
                b.retransmits_remaining -= 1;
                leftover.push(b);
            }
        }
        for b in leftover {
            self.queue.push(b);
        }
        out
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_highest_priority_first() {
        let mut q = BroadcastQueue::new(10);
        q.push(b"low".to_vec(), 1);
        q.push(b"high".to_vec(), 5);
        let drained = q.drain_for_piggyback(1);
        assert_eq!(drained[0].payload, b"high");
    }

    #[test]
    fn drops_oldest_when_over_capacity() {
        let mut q = BroadcastQueue::new(1);
        q.push(b"a".to_vec(), 1);
        q.push(b"b".to_vec(), 1);
        assert_eq!(q.dropped_count(), 1);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn exhausted_retransmits_are_removed() {
        let mut q = BroadcastQueue::new(10);
        q.push(b"once".to_vec(), 1);
        let first = q.drain_for_piggyback(5);
        assert_eq!(first.len(), 1);
        assert!(q.is_empty());
    }
}
