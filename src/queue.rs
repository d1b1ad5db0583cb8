//! Bounded, interruptible FIFO shared between threads.
//!
//! Producers never block: a full queue rejects the item and returns `false`,
//! which is the backpressure signal. Consumers block in [`InterruptibleQueue::dequeue`]
//! until an item arrives or [`InterruptibleQueue::signal_termination`] is called;
//! after termination the remaining items are still handed out, and `None` is
//! returned only once the queue is empty.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Default capacity used by the server request queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1500;

struct QueueState<T> {
    items: VecDeque<T>,
    running: bool,
}

/// Thread-safe bounded FIFO with a sentinel-free shutdown signal.
pub struct InterruptibleQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> InterruptibleQueue<T> {
    /// Create a queue that holds at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState { items: VecDeque::new(), running: true }),
            available: Condvar::new(),
            capacity,
        }
    }

    // A panicking holder cannot leave the deque half-updated, so a poisoned
    // lock is still usable.
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an item. Returns `false` and drops the item when the queue is full.
    pub fn enqueue(&self, item: T) -> bool {
        let mut state = self.lock();
        if state.items.len() >= self.capacity {
            return false;
        }
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
        true
    }

    /// Remove the oldest item, blocking until one is available.
    ///
    /// Returns `None` only after termination was signalled and the queue is drained.
    pub fn dequeue(&self) -> Option<T> {
        let mut state = self.lock();
        while state.running && state.items.is_empty() {
            state = self.available.wait(state).unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        state.items.pop_front()
    }

    /// Remove up to `n` of the oldest items without blocking.
    pub fn drain_front(&self, n: usize) -> Vec<T> {
        let mut state = self.lock();
        let count = n.min(state.items.len());
        state.items.drain(..count).collect()
    }

    /// Wake every blocked consumer. Idempotent.
    pub fn signal_termination(&self) {
        let mut state = self.lock();
        if !state.running {
            return;
        }
        state.running = false;
        drop(state);
        self.available.notify_all();
    }

    /// Whether termination has been signalled.
    pub fn is_terminated(&self) -> bool {
        !self.lock().running
    }

    /// Current depth.
    pub fn size(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Discard all queued items.
    pub fn clear(&self) {
        self.lock().items.clear();
    }
}

impl<T> Default for InterruptibleQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl<T> std::fmt::Debug for InterruptibleQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("InterruptibleQueue")
            .field("len", &state.items.len())
            .field("capacity", &self.capacity)
            .field("running", &state.running)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let queue = InterruptibleQueue::new(8);
        for i in 0..5 {
            assert!(queue.enqueue(i));
        }
        let out: Vec<_> = (0..5).filter_map(|_| queue.dequeue()).collect();
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn full_queue_rejects_without_changing_size() {
        let queue = InterruptibleQueue::new(3);
        assert!(queue.enqueue("a"));
        assert!(queue.enqueue("b"));
        assert!(queue.enqueue("c"));
        assert_eq!(queue.size(), 3);

        assert!(!queue.enqueue("d"));
        assert_eq!(queue.size(), 3);
        assert_eq!(queue.dequeue(), Some("a"));
    }

    #[test]
    fn termination_drains_before_none() {
        let queue = InterruptibleQueue::new(4);
        queue.enqueue(1);
        queue.enqueue(2);
        queue.signal_termination();

        assert_eq!(queue.dequeue(), Some(1));
        assert_eq!(queue.dequeue(), Some(2));
        assert_eq!(queue.dequeue(), None);
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn termination_is_idempotent() {
        let queue: InterruptibleQueue<u8> = InterruptibleQueue::new(1);
        queue.signal_termination();
        queue.signal_termination();
        assert!(queue.is_terminated());
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn blocked_consumers_wake_on_termination() {
        let queue: Arc<InterruptibleQueue<u32>> = Arc::new(InterruptibleQueue::new(4));
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.dequeue())
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        queue.signal_termination();

        for consumer in consumers {
            assert_eq!(consumer.join().expect("consumer panicked"), None);
        }
    }

    #[test]
    fn blocked_consumer_receives_item() {
        let queue = Arc::new(InterruptibleQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.dequeue())
        };

        thread::sleep(Duration::from_millis(20));
        assert!(queue.enqueue(42));
        assert_eq!(consumer.join().expect("consumer panicked"), Some(42));
    }

    #[test]
    fn drain_front_takes_oldest() {
        let queue = InterruptibleQueue::new(10);
        for i in 0..6 {
            queue.enqueue(i);
        }
        assert_eq!(queue.drain_front(4), vec![0, 1, 2, 3]);
        assert_eq!(queue.drain_front(10), vec![4, 5]);
        assert!(queue.drain_front(3).is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn clear_empties_queue() {
        let queue = InterruptibleQueue::new(4);
        queue.enqueue('x');
        queue.enqueue('y');
        queue.clear();
        assert_eq!(queue.size(), 0);
        assert!(queue.enqueue('z'));
    }
}
