//! Write batching with a single batch in flight.
//!
//! Items submitted while a batch is being written accumulate into the next
//! batch, in submission order. A batch never exceeds the configured size;
//! overflow waits for a later batch instead of opening a second write.

use std::collections::VecDeque;

/// Accumulates to-be-written items and hands them out one batch at a time.
///
/// Generic over the item type so the owner decides what a batch entry
/// carries (the eventsourced core assigns sequence numbers only when a
/// batch is handed out).
#[derive(Debug)]
pub struct WriteBatcher<T> {
    max_batch_size: usize,
    pending: VecDeque<T>,
    in_flight: bool,
}

impl<T> WriteBatcher<T> {
    /// Create a batcher. A `max_batch_size` of 0 is treated as 1.
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            pending: VecDeque::new(),
            in_flight: false,
        }
    }

    /// Queue `item` behind everything already pending.
    pub fn push(&mut self, item: T) {
        self.pending.push_back(item);
    }

    /// Whether a batch has been handed out and not yet acknowledged.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Number of items waiting for a batch.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Hand out the next batch if nothing is in flight.
    ///
    /// Returns `None` when a batch is already in flight or nothing is
    /// pending. Otherwise returns up to `max_batch_size` items in
    /// submission order and marks a batch in flight.
    pub fn take_ready(&mut self) -> Option<Vec<T>> {
        if self.in_flight || self.pending.is_empty() {
            return None;
        }
        let n = self.pending.len().min(self.max_batch_size);
        let batch: Vec<T> = self.pending.drain(..n).collect();
        self.in_flight = true;
        Some(batch)
    }

    /// Record that the in-flight batch was acknowledged (success or
    /// failure) and hand out the next one, if any is pending.
    pub fn acknowledge(&mut self) -> Option<Vec<T>> {
        self.in_flight = false;
        self.take_ready()
    }

    /// Drop everything pending and forget any in-flight batch.
    pub fn clear(&mut self) -> Vec<T> {
        self.in_flight = false;
        self.pending.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_batcher_hands_out_everything_pending() {
        let mut batcher = WriteBatcher::new(10);
        batcher.push(1);
        batcher.push(2);
        assert_eq!(batcher.take_ready(), Some(vec![1, 2]));
        assert!(batcher.is_in_flight());
    }

    #[test]
    fn nothing_pending_means_no_batch() {
        let mut batcher = WriteBatcher::<u32>::new(10);
        assert_eq!(batcher.take_ready(), None);
        assert!(!batcher.is_in_flight());
    }

    #[test]
    fn items_during_flight_coalesce_into_one_next_batch() {
        let mut batcher = WriteBatcher::new(10);
        batcher.push("a");
        assert_eq!(batcher.take_ready(), Some(vec!["a"]));

        for item in ["b", "c", "d"] {
            batcher.push(item);
            assert_eq!(batcher.take_ready(), None, "one batch in flight at most");
        }

        assert_eq!(batcher.acknowledge(), Some(vec!["b", "c", "d"]));
        assert!(batcher.is_in_flight());
        assert_eq!(batcher.acknowledge(), None);
        assert!(!batcher.is_in_flight());
    }

    #[test]
    fn batches_never_exceed_cap() {
        let mut batcher = WriteBatcher::new(3);
        for i in 0..8 {
            batcher.push(i);
        }
        let mut batches = Vec::new();
        let mut next = batcher.take_ready();
        while let Some(batch) = next {
            batches.push(batch);
            next = batcher.acknowledge();
        }
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7]]);
        assert!(!batcher.is_in_flight());
    }

    #[test]
    fn zero_cap_is_treated_as_one() {
        let mut batcher = WriteBatcher::new(0);
        batcher.push('x');
        batcher.push('y');
        assert_eq!(batcher.take_ready(), Some(vec!['x']));
        assert_eq!(batcher.pending_len(), 1);
    }

    #[test]
    fn clear_returns_pending_and_resets_flight() {
        let mut batcher = WriteBatcher::new(1);
        batcher.push(1);
        batcher.push(2);
        batcher.take_ready();
        assert_eq!(batcher.clear(), vec![2]);
        assert!(!batcher.is_in_flight());
    }
}
