//! Concurrent priority queue that holds each distinct value at most once.
//!
//! Used as the allocator's free list: returning the same slot twice must not
//! let it be handed out twice, so the membership check and the insert happen
//! under one lock.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Set-like min-queue guarded by a single mutex.
///
/// `offer` is atomic with respect to the containment check: two concurrent
/// `offer(v)` calls never both succeed.
#[derive(Debug)]
pub struct UniqueMinQueue<T> {
    items: Mutex<BTreeSet<T>>,
}

impl<T: Ord> Default for UniqueMinQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord> UniqueMinQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(BTreeSet::new()),
        }
    }

    // BTreeSet operations cannot leave the set half-updated, so a poisoned
    // lock still guards a consistent set.
    fn items(&self) -> MutexGuard<'_, BTreeSet<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts `value` unless it is already present.
    ///
    /// Returns `true` if the queue changed.
    pub fn offer(&self, value: T) -> bool {
        self.items().insert(value)
    }

    /// Same as [`offer`](Self::offer). The queue is unbounded, so this never
    /// waits and the timeout is ignored.
    pub fn offer_timeout(&self, value: T, _timeout: Duration) -> bool {
        self.offer(value)
    }

    /// Same as [`offer`](Self::offer), discarding the result. Never blocks.
    pub fn put(&self, value: T) {
        self.offer(value);
    }

    /// Removes and returns the smallest value.
    pub fn poll(&self) -> Option<T> {
        self.items().pop_first()
    }

    pub fn contains(&self, value: &T) -> bool {
        self.items().contains(value)
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }
}

impl<T: Ord + Clone> UniqueMinQueue<T> {
    /// Smallest value without removing it.
    pub fn peek(&self) -> Option<T> {
        self.items().first().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn polls_in_ascending_order() {
        let queue = UniqueMinQueue::new();
        for v in [19, 1, 7, 3] {
            assert!(queue.offer(v));
        }

        assert_eq!(queue.peek(), Some(1));
        assert_eq!(queue.poll(), Some(1));
        assert_eq!(queue.poll(), Some(3));
        assert_eq!(queue.poll(), Some(7));
        assert_eq!(queue.poll(), Some(19));
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn duplicate_offer_is_rejected() {
        let queue = UniqueMinQueue::new();
        assert!(queue.offer(5));
        assert!(!queue.offer(5));
        assert_eq!(queue.len(), 1);

        queue.put(5);
        assert!(!queue.offer_timeout(5, Duration::from_secs(60)));
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(&5));
    }

    #[test]
    fn value_can_be_reinserted_after_poll() {
        let queue = UniqueMinQueue::new();
        queue.put(2);
        assert_eq!(queue.poll(), Some(2));
        assert!(queue.is_empty());
        assert!(queue.offer(2));
    }

    #[test]
    fn concurrent_offers_of_one_value_succeed_once() {
        const THREADS: usize = 16;

        for _ in 0..50 {
            let queue = UniqueMinQueue::new();
            let barrier = Barrier::new(THREADS);
            let successes = AtomicUsize::new(0);

            std::thread::scope(|s| {
                for _ in 0..THREADS {
                    s.spawn(|| {
                        barrier.wait();
                        if queue.offer(42) {
                            successes.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                }
            });

            assert_eq!(successes.load(Ordering::Relaxed), 1);
            assert_eq!(queue.len(), 1);
        }
    }
}
