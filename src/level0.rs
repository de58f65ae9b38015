//! Bounded FIFO of frozen partitions awaiting conversion into on-disk
//! sorted files.
//!
//! Occupancy is the principal write-admission signal: writers consult
//! [`Level0Queue::near_capacity`] to tighten acceptance and stall in
//! [`Level0Queue::wait_not_full`] when the queue is full. The bound is a
//! steady-state invariant; a forced drain at shutdown may push past it
//! transiently.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::Result;
use crate::partition::Partition;
use std::sync::Arc;

pub struct Level0Queue {
    queue: Mutex<VecDeque<Arc<Partition>>>,
    capacity: usize,
    drained: Condvar,
}

impl Level0Queue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            drained: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn occupancy(&self) -> usize {
        self.queue.lock().expect("level0 lock poisoned").len()
    }

    pub fn is_full(&self) -> bool {
        self.occupancy() >= self.capacity
    }

    /// How far past the bound the queue currently is; scales the caller's
    /// stall interval.
    pub fn overflow_depth(&self) -> usize {
        let len = self.occupancy();
        len.saturating_sub(self.capacity - 1)
    }

    pub fn near_capacity(&self, ratio: f64) -> bool {
        self.occupancy() as f64 >= self.capacity as f64 * ratio
    }

    /// Append a frozen partition. Admission control checks the bound
    /// before freezing; pushes themselves never block so a forced
    /// shutdown drain can always hand its partitions over.
    pub fn push(&self, partition: Arc<Partition>) -> Result<()> {
        debug_assert!(partition.is_frozen());
        let mut queue = self.queue.lock()?;
        queue.push_back(partition);
        Ok(())
    }

    /// Oldest queued partition, left in place. Promotion removes it only
    /// after the flush engine reports success.
    pub fn peek_oldest(&self) -> Option<Arc<Partition>> {
        self.queue
            .lock()
            .expect("level0 lock poisoned")
            .front()
            .cloned()
    }

    /// Drop the queue's reference to `id`. Returns false if it was
    /// already removed (idempotent promotion).
    pub fn remove(&self, id: u64) -> bool {
        let mut queue = self.queue.lock().expect("level0 lock poisoned");
        let before = queue.len();
        queue.retain(|p| p.id() != id);
        let removed = queue.len() < before;
        if removed {
            self.drained.notify_all();
        }
        removed
    }

    pub fn contains(&self, id: u64) -> bool {
        self.queue
            .lock()
            .expect("level0 lock poisoned")
            .iter()
            .any(|p| p.id() == id)
    }

    /// Queued partitions, oldest first. Readers scan these between the
    /// mutable partitions and the on-disk levels.
    pub fn members(&self) -> Vec<Arc<Partition>> {
        self.queue
            .lock()
            .expect("level0 lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Block up to `timeout` for occupancy to fall below the bound.
    /// Returns whether there is room now.
    pub fn wait_not_full(&self, timeout: Duration) -> Result<bool> {
        let queue = self.queue.lock()?;
        if queue.len() < self.capacity {
            return Ok(true);
        }
        let (queue, _timed_out) = self
            .drained
            .wait_timeout_while(queue, timeout, |q| q.len() >= self.capacity)?;
        Ok(queue.len() < self.capacity)
    }
}

impl std::fmt::Debug for Level0Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Level0Queue")
            .field("occupancy", &self.occupancy())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::thread;

    fn frozen_partition(id: u64) -> Arc<Partition> {
        let config = EngineConfig::default()
            .partition_capacity_bytes(16 * 1024)
            .hash_bucket_count(16)
            .arena_block_size(8 * 1024);
        let p = Partition::with_config(id, Vec::new(), None, &config);
        p.freeze().expect("freeze failed");
        Arc::new(p)
    }

    #[test]
    fn test_fifo_order() {
        let q = Level0Queue::new(4);
        q.push(frozen_partition(1)).expect("push failed");
        q.push(frozen_partition(2)).expect("push failed");

        assert_eq!(q.occupancy(), 2);
        assert_eq!(q.peek_oldest().expect("empty").id(), 1);
        assert!(q.remove(1));
        assert_eq!(q.peek_oldest().expect("empty").id(), 2);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let q = Level0Queue::new(4);
        q.push(frozen_partition(1)).expect("push failed");
        assert!(q.remove(1));
        assert!(!q.remove(1));
        assert_eq!(q.occupancy(), 0);
    }

    #[test]
    fn test_capacity_signals() {
        let q = Level0Queue::new(4);
        for id in 0..3 {
            q.push(frozen_partition(id)).expect("push failed");
        }
        assert!(!q.is_full());
        assert!(q.near_capacity(0.75));
        assert!(!q.near_capacity(1.0));

        q.push(frozen_partition(3)).expect("push failed");
        assert!(q.is_full());
        assert_eq!(q.overflow_depth(), 1);
    }

    #[test]
    fn test_wait_not_full_times_out() {
        let q = Level0Queue::new(1);
        q.push(frozen_partition(1)).expect("push failed");
        let room = q
            .wait_not_full(Duration::from_millis(20))
            .expect("wait failed");
        assert!(!room);
    }

    #[test]
    fn test_wait_not_full_wakes_on_remove() {
        let q = Arc::new(Level0Queue::new(1));
        q.push(frozen_partition(1)).expect("push failed");

        let waiter = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.wait_not_full(Duration::from_secs(5)).expect("wait failed"))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(q.remove(1));
        assert!(waiter.join().expect("waiter panicked"));
    }
}
