use std::collections::VecDeque;

/// Fixed-capacity recency buffer.
///
/// Pushing into a full buffer overwrites the oldest entry. Reads return
/// owned copies in chronological order (oldest first), so later pushes are
/// never observed through a previously taken snapshot.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    /// Creates an empty buffer. A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Inserts a value, returning the entry it displaced once full.
    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted = if self.slots.len() == self.capacity {
            self.slots.pop_front()
        } else {
            None
        };
        self.slots.push_back(value);
        evicted
    }

    /// All held values, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.slots.iter().cloned().collect()
    }

    /// The most recent `min(n, len)` values, oldest first.
    pub fn tail(&self, n: usize) -> Vec<T> {
        let skip = self.slots.len().saturating_sub(n);
        self.slots.iter().skip(skip).cloned().collect()
    }

    /// Most recently pushed value.
    pub fn last(&self) -> Option<&T> {
        self.slots.back()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
