//! Lock-free media queues linking filter ports
//!
//! Each input port owns one bounded queue. The upstream filter pushes into it
//! during its own `process`, the owning filter pops from it, and the node
//! flushes whatever is left once `process` returns.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::filter::media::MediaUnit;

/// Bounded queue of media units for one input port
pub struct MediaQueue {
    queue: ArrayQueue<MediaUnit>,
    overflow_count: AtomicUsize,
    flushed_count: AtomicUsize,
}

impl MediaQueue {
    /// Create a new queue with the specified capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            overflow_count: AtomicUsize::new(0),
            flushed_count: AtomicUsize::new(0),
        }
    }

    /// Push a unit.
    /// Returns false (and drops the unit) if the queue is full
    pub fn push(&self, unit: MediaUnit) -> bool {
        match self.queue.push(unit) {
            Ok(()) => true,
            Err(_) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop the oldest unit
    pub fn pop(&self) -> Option<MediaUnit> {
        self.queue.pop()
    }

    /// Pop everything and keep only the most recent unit
    pub fn take_last(&self) -> Option<MediaUnit> {
        let mut last = None;
        while let Some(unit) = self.queue.pop() {
            if last.replace(unit).is_some() {
                self.flushed_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        last
    }

    /// Discard all pending units, returning how many were dropped
    pub fn flush(&self) -> usize {
        let mut dropped = 0;
        while self.queue.pop().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            self.flushed_count.fetch_add(dropped, Ordering::Relaxed);
        }
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Units dropped because the queue was full
    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Units discarded unconsumed at the end of a tick
    pub fn flushed_count(&self) -> usize {
        self.flushed_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a media queue
pub type SharedQueue = Arc<MediaQueue>;

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn unit(ts: u32) -> MediaUnit {
        MediaUnit::encoded(Bytes::new(), 0, ts, false)
    }

    #[test]
    fn test_queue_basic() {
        let queue = MediaQueue::new(2);
        assert!(queue.push(unit(0)));
        assert!(queue.push(unit(1)));
        assert!(!queue.push(unit(2)));
        assert_eq!(queue.overflow_count(), 1);

        assert_eq!(queue.pop().unwrap().timestamp, 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_take_last() {
        let queue = MediaQueue::new(8);
        for ts in 0..5 {
            queue.push(unit(ts));
        }
        assert_eq!(queue.take_last().unwrap().timestamp, 4);
        assert!(queue.is_empty());
        assert_eq!(queue.flushed_count(), 4);
    }

    #[test]
    fn test_flush() {
        let queue = MediaQueue::new(8);
        queue.push(unit(0));
        queue.push(unit(1));
        assert_eq!(queue.flush(), 2);
        assert_eq!(queue.flush(), 0);
        assert!(queue.is_empty());
    }
}
