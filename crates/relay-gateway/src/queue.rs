//! Per-connection bounded outbound queue.

use std::collections::VecDeque;

/// Bounded FIFO that evicts its oldest item on overflow.
#[derive(Debug)]
pub struct OutboundQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
    evicted: u64,
}

impl<T> OutboundQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            evicted: 0,
        }
    }

    /// Append an item, returning the evicted oldest item if the queue was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.evicted += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Oldest item, if any.
    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    /// Remove and return the oldest item.
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of retained items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items evicted over the queue's lifetime.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Remove every queued item, oldest first.
    pub fn take_all(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }

    /// Drop every queued item, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }
}
