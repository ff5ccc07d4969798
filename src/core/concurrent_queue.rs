//! Thread-safe task queue with an outstanding-work counter.
//!
//! Producers push items and consumers pop them; every pushed item must later
//! be balanced by exactly one [`ConcurrentTaskQueue::notify_of_completion`],
//! otherwise [`ConcurrentTaskQueue::wait_drain`] never returns.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

struct QueueState<T> {
    items: VecDeque<T>,
    outstanding: usize,
    disposed: bool,
}

/// Unbounded MPMC queue guarded by a mutex and two condition variables.
pub struct ConcurrentTaskQueue<T> {
    state: Mutex<QueueState<T>>,
    /// Signalled when an item is pushed or the queue is disposed.
    available: Condvar,
    /// Signalled when `outstanding` drops to zero or the queue is disposed.
    drained: Condvar,
}

impl<T> ConcurrentTaskQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                outstanding: 0,
                disposed: false,
            }),
            available: Condvar::new(),
            drained: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        // A panicking task never holds this lock, so poisoning carries no
        // broken invariant worth propagating.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take ownership of `item`, count it as outstanding and wake one waiter.
    pub fn push(&self, item: T) {
        let mut state = self.lock();
        state.items.push_back(item);
        state.outstanding += 1;
        drop(state);
        self.available.notify_one();
    }

    /// Pop the front item without blocking. Does not touch the outstanding
    /// counter.
    pub fn pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Atomically take every queued item.
    pub fn pop_all(&self) -> VecDeque<T> {
        std::mem::take(&mut self.lock().items)
    }

    /// Block until an item is available. Returns `None` once the queue has
    /// been disposed.
    pub fn wait_pop(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if state.disposed {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Mark one previously pushed item as finished.
    pub fn notify_of_completion(&self) {
        let mut state = self.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        let drained = state.outstanding == 0;
        drop(state);
        if drained {
            self.drained.notify_all();
        }
    }

    /// Block until every pushed item has been completed, or the queue is
    /// disposed.
    pub fn wait_drain(&self) {
        let mut state = self.lock();
        while state.outstanding > 0 && !state.disposed {
            state = self
                .drained
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Wake every waiter; subsequent `wait_pop` calls return `None`.
    pub fn dispose(&self) {
        self.lock().disposed = true;
        self.available.notify_all();
        self.drained.notify_all();
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }
}

impl<T> Default for ConcurrentTaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_push_pop_fifo() {
        let queue = ConcurrentTaskQueue::new();
        for i in 0..5 {
            queue.push(i);
        }
        assert_eq!(queue.len(), 5);
        for i in 0..5 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert!(queue.pop().is_none());
        // pop never decrements the outstanding counter
        assert_eq!(queue.outstanding(), 5);
    }

    #[test]
    fn test_pop_all_drains_atomically() {
        let queue = ConcurrentTaskQueue::new();
        queue.push("a");
        queue.push("b");
        let drained: Vec<_> = queue.pop_all().into_iter().collect();
        assert_eq!(drained, vec!["a", "b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_wait_pop_returns_none_after_dispose() {
        let queue = Arc::new(ConcurrentTaskQueue::<u32>::new());
        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.wait_pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.dispose();
        assert_eq!(waiter.join().unwrap(), None);
        assert!(queue.is_disposed());
    }

    #[test]
    fn test_wait_pop_wakes_on_push() {
        let queue = Arc::new(ConcurrentTaskQueue::new());
        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.wait_pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.push(7);
        assert_eq!(waiter.join().unwrap(), Some(7));
    }

    #[test]
    fn test_wait_drain_requires_every_completion() {
        let queue = Arc::new(ConcurrentTaskQueue::new());
        let completed = Arc::new(AtomicUsize::new(0));
        for i in 0..4 {
            queue.push(i);
        }

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let queue = queue.clone();
                let completed = completed.clone();
                thread::spawn(move || {
                    while let Some(item) = queue.pop() {
                        thread::sleep(Duration::from_millis(5 * item as u64));
                        completed.fetch_add(1, Ordering::SeqCst);
                        queue.notify_of_completion();
                    }
                })
            })
            .collect();

        queue.wait_drain();
        assert_eq!(completed.load(Ordering::SeqCst), 4);
        assert_eq!(queue.outstanding(), 0);
        for worker in workers {
            worker.join().unwrap();
        }
    }
}
