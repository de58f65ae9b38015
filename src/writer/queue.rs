//! Work queues feeding the background writer threads.
//!
//! Two strategies with one contract: `push` fails only when the queue is
//! truly full (the caller then applies the write itself, never dropping
//! it), draining can be awaited, and shutdown hands every remaining item
//! to the worker before it exits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::Result;

struct QueueState<T> {
    items: VecDeque<T>,
    /// Items popped but not yet applied by the worker.
    in_flight: usize,
    shutdown: bool,
}

/// Bounded FIFO guarded by a mutex and condition variables. Producers and
/// the worker block instead of spinning.
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
    not_empty: Condvar,
    drained: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                in_flight: 0,
                shutdown: false,
            }),
            capacity,
            not_empty: Condvar::new(),
            drained: Condvar::new(),
        }
    }

    /// Returns false only when the queue is full or shut down.
    pub fn push(&self, item: T) -> Result<bool> {
        let mut state = self.state.lock()?;
        if state.shutdown || state.items.len() >= self.capacity {
            return Ok(false);
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        Ok(true)
    }

    /// Worker side: block until an item arrives or shutdown empties the
    /// queue. `None` means exit.
    pub fn pop_blocking(&self) -> Result<Option<T>> {
        let mut state = self.state.lock()?;
        loop {
            if let Some(item) = state.items.pop_front() {
                state.in_flight += 1;
                return Ok(Some(item));
            }
            if state.shutdown {
                return Ok(None);
            }
            state = self.not_empty.wait(state)?;
        }
    }

    /// Worker side: the popped item has been applied. Returns true when
    /// this was the clear point, i.e. nothing queued and nothing in
    /// flight.
    pub fn mark_applied(&self) -> Result<bool> {
        let mut state = self.state.lock()?;
        state.in_flight -= 1;
        let empty = state.items.is_empty() && state.in_flight == 0;
        if empty {
            self.drained.notify_all();
        }
        Ok(empty)
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock().expect("queue lock poisoned");
        state.items.is_empty() && state.in_flight == 0
    }

    /// Block until the worker has applied everything queued so far.
    pub fn wait_drained(&self, timeout: Duration) -> Result<bool> {
        let state = self.state.lock()?;
        let (state, _) = self.drained.wait_timeout_while(state, timeout, |s| {
            !(s.items.is_empty() && s.in_flight == 0)
        })?;
        Ok(state.items.is_empty() && state.in_flight == 0)
    }

    /// Stop accepting work and wake the worker; queued items still get
    /// applied before the worker exits.
    pub fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        state.shutdown = true;
        self.not_empty.notify_all();
        Ok(())
    }
}

/// Bounded ring with atomic cursors. The single consumer pops without a
/// lock; producers are serialized by a push-side lock rather than relying
/// on an unverified multi-producer assumption.
pub struct WorkRing<T> {
    slots: Box<[std::cell::UnsafeCell<Option<T>>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
    push_lock: Mutex<()>,
    shutdown: AtomicBool,
    pushed: AtomicU64,
    applied: AtomicU64,
}

// The consumer is unique and producers serialize on push_lock; a slot is
// written only while unreachable from the consumer (tail not yet
// published) and read only after publication.
unsafe impl<T: Send> Sync for WorkRing<T> {}
unsafe impl<T: Send> Send for WorkRing<T> {}

impl<T> WorkRing<T> {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || std::cell::UnsafeCell::new(None));
        Self {
            slots: slots.into_boxed_slice(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            push_lock: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            pushed: AtomicU64::new(0),
            applied: AtomicU64::new(0),
        }
    }

    /// Returns false only when the ring is full or shut down.
    pub fn push(&self, item: T) -> Result<bool> {
        let _guard = self.push_lock.lock()?;
        if self.shutdown.load(Ordering::Acquire) {
            return Ok(false);
        }
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail - head >= self.slots.len() {
            return Ok(false);
        }
        unsafe { *self.slots[tail % self.slots.len()].get() = Some(item) };
        self.tail.store(tail + 1, Ordering::Release);
        self.pushed.fetch_add(1, Ordering::Release);
        Ok(true)
    }

    /// Consumer side only.
    pub fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let item = unsafe { (*self.slots[head % self.slots.len()].get()).take() };
        self.head.store(head + 1, Ordering::Release);
        item
    }

    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail - head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.pushed.load(Ordering::Acquire) == self.applied.load(Ordering::Acquire)
    }

    /// Consumer side: the popped item has been applied.
    pub fn mark_applied(&self) {
        self.applied.fetch_add(1, Ordering::Release);
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_bounded_queue_fifo() {
        let q = BoundedQueue::new(4);
        assert!(q.push(1).expect("push failed"));
        assert!(q.push(2).expect("push failed"));

        assert_eq!(q.pop_blocking().expect("pop failed"), Some(1));
        assert!(!q.mark_applied().expect("mark failed"));
        assert_eq!(q.pop_blocking().expect("pop failed"), Some(2));
        assert!(q.mark_applied().expect("mark failed"), "clear point expected");
    }

    #[test]
    fn test_bounded_queue_full() {
        let q = BoundedQueue::new(2);
        assert!(q.push(1).expect("push failed"));
        assert!(q.push(2).expect("push failed"));
        assert!(!q.push(3).expect("push failed"), "push to full queue must fail");
    }

    #[test]
    fn test_bounded_queue_shutdown_drains() {
        let q = Arc::new(BoundedQueue::new(8));
        q.push(1).expect("push failed");
        q.push(2).expect("push failed");
        q.shutdown().expect("shutdown failed");

        // Remaining items still come out before the exit signal.
        assert_eq!(q.pop_blocking().expect("pop failed"), Some(1));
        q.mark_applied().expect("mark failed");
        assert_eq!(q.pop_blocking().expect("pop failed"), Some(2));
        q.mark_applied().expect("mark failed");
        assert_eq!(q.pop_blocking().expect("pop failed"), None);

        assert!(!q.push(3).expect("push failed"));
    }

    #[test]
    fn test_bounded_queue_wait_drained() {
        let q = Arc::new(BoundedQueue::new(8));
        for i in 0..5 {
            q.push(i).expect("push failed");
        }

        let worker = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                while let Some(_item) = q.pop_blocking().expect("pop failed") {
                    thread::sleep(Duration::from_millis(1));
                    q.mark_applied().expect("mark failed");
                }
            })
        };

        assert!(q
            .wait_drained(Duration::from_secs(5))
            .expect("wait failed"));
        q.shutdown().expect("shutdown failed");
        worker.join().expect("worker panicked");
    }

    #[test]
    fn test_ring_push_pop() {
        let ring = WorkRing::new(4);
        assert!(ring.push(10).expect("push failed"));
        assert!(ring.push(20).expect("push failed"));
        assert_eq!(ring.len(), 2);

        assert_eq!(ring.pop(), Some(10));
        ring.mark_applied();
        assert_eq!(ring.pop(), Some(20));
        ring.mark_applied();
        assert_eq!(ring.pop(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_ring_full() {
        let ring = WorkRing::new(2);
        assert!(ring.push(1).expect("push failed"));
        assert!(ring.push(2).expect("push failed"));
        assert!(!ring.push(3).expect("push failed"));

        ring.pop();
        ring.mark_applied();
        assert!(ring.push(3).expect("push failed"));
    }

    #[test]
    fn test_ring_concurrent_producers() {
        let ring = Arc::new(WorkRing::new(1024));
        let mut handles = Vec::new();
        for t in 0..4 {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    while !ring.push(t * 1000 + i).expect("push failed") {
                        thread::yield_now();
                    }
                }
            }));
        }

        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut seen = 0;
                while seen < 400 {
                    match ring.pop() {
                        Some(_) => {
                            ring.mark_applied();
                            seen += 1;
                        }
                        None => thread::sleep(Duration::from_micros(50)),
                    }
                }
                seen
            })
        };

        for handle in handles {
            handle.join().expect("producer panicked");
        }
        assert_eq!(consumer.join().expect("consumer panicked"), 400);
        assert!(ring.is_empty());
    }
}
