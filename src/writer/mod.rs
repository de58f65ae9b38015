//! Sharded background writers.
//!
//! Keys hash onto `shard_count` shards; each shard owns a durable log, a
//! pending-key index, a bounded work queue, and one worker thread. A
//! buffered write is logged and indexed before it is acknowledged, so the
//! submitting client reads its own write immediately while the worker
//! applies it to the partition behind the scenes. Same-key writes land on
//! the same shard, which preserves their order end to end.

pub mod queue;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, WriteMode};
use crate::error::{Error, Result};
use crate::log::Log;
use crate::partition::Partition;
use queue::{BoundedQueue, WorkRing};

/// Maps a key to its writer shard. The default keys off the edge bytes;
/// swapping in a different heuristic only requires this trait.
pub trait ShardHash: Send + Sync {
    fn shard(&self, key: &[u8], shard_count: usize) -> usize;
}

/// Mixes the first two and last two key bytes. Cheap, and edge bytes
/// discriminate well for both prefixed and suffixed key schemes.
pub struct EdgeByteHash;

impl ShardHash for EdgeByteHash {
    fn shard(&self, key: &[u8], shard_count: usize) -> usize {
        if shard_count <= 1 || key.is_empty() {
            return 0;
        }
        let mut h: usize = 0;
        let picks = [
            key[0],
            key[key.len().min(2) - 1],
            key[key.len() - 1],
            key[key.len().saturating_sub(2)],
        ];
        for b in picks {
            h = h.wrapping_mul(131).wrapping_add(b as usize);
        }
        h % shard_count
    }
}

/// First error from a background thread, held until the caller observes
/// it. Later errors are logged but do not overwrite the first.
pub struct BackgroundError {
    set: AtomicBool,
    message: Mutex<Option<String>>,
}

impl BackgroundError {
    pub fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
            message: Mutex::new(None),
        }
    }

    pub fn record(&self, err: &Error) {
        error!(error = %err, "background write failed");
        let mut slot = self.message.lock().expect("error slot poisoned");
        if slot.is_none() {
            slot.replace(err.to_string());
            self.set.store(true, Ordering::Release);
        }
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<()> {
        if !self.is_set() {
            return Ok(());
        }
        let slot = self.message.lock().expect("error slot poisoned");
        Err(Error::InvalidState(format!(
            "background writer halted: {}",
            slot.as_deref().unwrap_or("unknown error")
        )))
    }
}

impl Default for BackgroundError {
    fn default() -> Self {
        Self::new()
    }
}

/// The admission side of the engine, as seen by the workers. Capacity
/// thresholds and level-0 backpressure are enforced here, so the
/// background apply path obeys the same policy as a synchronous write.
pub trait WriteSink: Send + Sync {
    /// Full write path: route the key afresh, make room as needed, apply.
    fn apply(&self, key: &[u8], value: Option<&[u8]>) -> Result<()>;

    /// Whether `partition` may take another record right now.
    fn admit(&self, partition: &Partition) -> bool;

    /// Freeze or split the partition routing `key` once it has filled.
    fn make_room(&self, key: &[u8]) -> Result<()>;
}

/// One buffered write: the partition resolved at submit time plus the
/// record itself.
pub struct WorkItem {
    pub partition: Arc<Partition>,
    pub key: Bytes,
    pub value: Option<Bytes>,
}

/// Ring variant carries only the log offset; the worker re-reads the
/// record bytes from the shard log at apply time.
pub struct RingItem {
    pub partition: Arc<Partition>,
    pub offset: u64,
}

enum ShardQueue {
    Buffered(Arc<BoundedQueue<WorkItem>>),
    Ring(Arc<WorkRing<RingItem>>),
}

struct Shard {
    id: usize,
    log: Arc<Log>,
    pending: Arc<SkipMap<Vec<u8>, Option<Bytes>>>,
    queue: ShardQueue,
    // Serializes producers on this shard and excludes them from clear
    // points. Held across append+push+index so those three stay one
    // unit, and at every log reset so a reset never races a submit
    // that already appended but has not pushed yet.
    submit_lock: Mutex<()>,
}

pub fn shard_log_path(dir: &Path, shard: usize) -> PathBuf {
    dir.join(format!("shard-{:03}.log", shard))
}

pub struct WriterPool {
    shards: Vec<Arc<Shard>>,
    hasher: Arc<dyn ShardHash>,
    workers: Vec<JoinHandle<()>>,
    error: Arc<BackgroundError>,
}

impl WriterPool {
    /// Build the shards, replay any records left in their logs from a
    /// previous run, then spawn the workers.
    pub fn start(
        config: &EngineConfig,
        sink: Arc<dyn WriteSink>,
        error: Arc<BackgroundError>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;

        let mut shards = Vec::with_capacity(config.shard_count);
        for id in 0..config.shard_count {
            let log = Arc::new(Log::open(shard_log_path(&config.dir, id))?);
            replay_shard_log(&log, &*sink, config.paranoid_checks)?;
            let queue = match config.write_mode {
                WriteMode::Ring => ShardQueue::Ring(Arc::new(WorkRing::new(config.queue_capacity))),
                _ => ShardQueue::Buffered(Arc::new(BoundedQueue::new(config.queue_capacity))),
            };
            shards.push(Arc::new(Shard {
                id,
                log,
                pending: Arc::new(SkipMap::new()),
                queue,
                submit_lock: Mutex::new(()),
            }));
        }

        let mut workers = Vec::with_capacity(shards.len());
        for shard in &shards {
            let shard = Arc::clone(shard);
            let sink = Arc::clone(&sink);
            let error = Arc::clone(&error);
            let handle = thread::Builder::new()
                .name(format!("writer-{}", shard.id))
                .spawn(move || match &shard.queue {
                    ShardQueue::Buffered(_) => run_buffered(&shard, &*sink, &error),
                    ShardQueue::Ring(_) => run_ring(&shard, &*sink, &error),
                })?;
            workers.push(handle);
        }

        info!(shards = shards.len(), "writer pool started");
        Ok(Self {
            shards,
            hasher: Arc::new(EdgeByteHash),
            workers,
            error,
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_of(&self, key: &[u8]) -> usize {
        self.hasher.shard(key, self.shards.len())
    }

    /// Hand a write to its shard. The record hits the shard log before
    /// anything else, so an acknowledged write survives the queue.
    /// Returns false when the shard queue is full; the caller must then
    /// apply the write itself rather than drop it.
    pub fn submit(
        &self,
        partition: Arc<Partition>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool> {
        self.error.check()?;
        let shard = &self.shards[self.shard_of(key)];
        let _guard = shard.submit_lock.lock()?;
        let offset = shard.log.append(key, value)?;

        let accepted = match &shard.queue {
            ShardQueue::Buffered(queue) => {
                let accepted = queue.push(WorkItem {
                    partition,
                    key: Bytes::copy_from_slice(key),
                    value: value.map(Bytes::copy_from_slice),
                })?;
                if accepted {
                    // Indexed after the push: a pending entry that outlives
                    // its clear point carries the same value the partition
                    // already holds, which readers cannot distinguish.
                    shard
                        .pending
                        .insert(key.to_vec(), value.map(Bytes::copy_from_slice));
                }
                accepted
            }
            ShardQueue::Ring(ring) => ring.push(RingItem { partition, offset })?,
        };

        if !accepted {
            debug!(shard = shard.id, "shard queue full, caller applies inline");
        }
        Ok(accepted)
    }

    /// Pending-index probe. `Some(None)` is a buffered tombstone.
    pub fn pending_get(&self, key: &[u8]) -> Option<Option<Bytes>> {
        let shard = &self.shards[self.shard_of(key)];
        shard
            .pending
            .get(key)
            .map(|entry| entry.value().clone())
    }

    pub fn queued(&self) -> usize {
        self.shards
            .iter()
            .map(|s| match &s.queue {
                ShardQueue::Buffered(q) => q.len(),
                ShardQueue::Ring(r) => r.len(),
            })
            .sum()
    }

    /// Block until every shard queue has been applied.
    pub fn drain(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        for shard in &self.shards {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match &shard.queue {
                ShardQueue::Buffered(queue) => {
                    if !queue.wait_drained(remaining)? {
                        return Ok(false);
                    }
                }
                ShardQueue::Ring(ring) => {
                    while !ring.is_empty() {
                        if Instant::now() >= deadline {
                            return Ok(false);
                        }
                        thread::sleep(Duration::from_micros(100));
                    }
                }
            }
        }
        Ok(true)
    }

    /// Drain every queue, then reset the shard logs and pending indexes.
    pub fn drain_and_clear(&self, timeout: Duration) -> Result<bool> {
        if !self.drain(timeout)? {
            return Ok(false);
        }
        for shard in &self.shards {
            let _guard = shard.submit_lock.lock()?;
            // A submit may have slipped in after the drain; its record is
            // in the log and must survive the reset.
            let empty = match &shard.queue {
                ShardQueue::Buffered(q) => q.is_empty(),
                ShardQueue::Ring(r) => r.is_empty(),
            };
            if empty {
                shard.log.reset()?;
                while shard.pending.pop_front().is_some() {}
            }
        }
        Ok(true)
    }

    /// Stop the workers. Queued writes are applied, never discarded.
    pub fn shutdown(&mut self) -> Result<()> {
        for shard in &self.shards {
            match &shard.queue {
                ShardQueue::Buffered(queue) => queue.shutdown()?,
                ShardQueue::Ring(ring) => ring.shutdown(),
            }
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("writer thread panicked during shutdown");
            }
        }
        // Everything queued is applied now; the logs have served their
        // purpose.
        for shard in &self.shards {
            let _guard = shard.submit_lock.lock()?;
            shard.log.reset()?;
            while shard.pending.pop_front().is_some() {}
        }
        info!("writer pool stopped");
        Ok(())
    }
}

impl Drop for WriterPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            if let Err(e) = self.shutdown() {
                error!(error = %e, "writer pool shutdown failed");
            }
        }
    }
}

/// Records left in a shard log belong to writes acknowledged but not yet
/// applied when the process stopped. Re-apply them in log order.
fn replay_shard_log(log: &Log, sink: &dyn WriteSink, paranoid: bool) -> Result<()> {
    let mut replayed = 0usize;
    for entry in log.replay()? {
        match entry {
            Ok((key, value)) => {
                sink.apply(&key, value.as_deref())?;
                replayed += 1;
            }
            Err(e @ Error::Corruption(_)) => {
                if paranoid {
                    return Err(e);
                }
                warn!(log = ?log.path(), error = %e, "dropping corrupt log tail");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    if replayed > 0 {
        info!(log = ?log.path(), records = replayed, "replayed shard log");
    }
    log.reset()?;
    Ok(())
}

fn apply_item(
    partition: &Partition,
    key: &[u8],
    value: Option<&[u8]>,
    sink: &dyn WriteSink,
    error: &BackgroundError,
) {
    // The partition reference is a routing hint from submit time; the
    // admission policy still decides whether it may take the record.
    if !sink.admit(partition) {
        if let Err(e) = sink.apply(key, value) {
            error.record(&e);
        }
        return;
    }
    match partition.add(key, value) {
        Ok(()) => {
            // This record may have crossed the freeze threshold; freeze
            // now rather than on the next write.
            if partition.full() {
                if let Err(e) = sink.make_room(key) {
                    error.record(&e);
                }
            }
        }
        // The partition froze or split since the admit check.
        Err(Error::Frozen) | Err(Error::ResourceExhausted(_)) => {
            if let Err(e) = sink.apply(key, value) {
                error.record(&e);
            }
        }
        Err(e) => error.record(&e),
    }
}

fn run_buffered(shard: &Shard, sink: &dyn WriteSink, error: &BackgroundError) {
    let queue = match &shard.queue {
        ShardQueue::Buffered(q) => q,
        ShardQueue::Ring(_) => unreachable!("buffered worker on ring shard"),
    };
    loop {
        let item = match queue.pop_blocking() {
            Ok(Some(item)) => item,
            Ok(None) => return,
            Err(e) => {
                error.record(&e);
                return;
            }
        };
        apply_item(&item.partition, &item.key, item.value.as_deref(), sink, error);
        match queue.mark_applied() {
            // Clear point: every logged record is applied, so the log and
            // the pending index restart empty. Taken under the submit
            // lock, and only if nothing arrived since the last pop; a
            // concurrent submit would otherwise lose its logged record.
            Ok(true) => {
                let guard = match shard.submit_lock.lock() {
                    Ok(guard) => guard,
                    Err(_) => {
                        error.record(&Error::MutexPoisoned);
                        return;
                    }
                };
                if queue.is_empty() {
                    if let Err(e) = shard.log.reset() {
                        error.record(&e);
                    }
                    while shard.pending.pop_front().is_some() {}
                }
                drop(guard);
            }
            Ok(false) => {}
            Err(e) => {
                error.record(&e);
                return;
            }
        }
    }
}

fn run_ring(shard: &Shard, sink: &dyn WriteSink, error: &BackgroundError) {
    let ring = match &shard.queue {
        ShardQueue::Ring(r) => r,
        ShardQueue::Buffered(_) => unreachable!("ring worker on buffered shard"),
    };
    loop {
        match ring.pop() {
            Some(item) => {
                match shard.log.read_at(item.offset) {
                    Ok(((key, value), _)) => {
                        apply_item(&item.partition, &key, value.as_deref(), sink, error)
                    }
                    Err(e) => error.record(&e),
                }
                ring.mark_applied();
            }
            None => {
                if ring.is_shutdown() {
                    return;
                }
                thread::sleep(Duration::from_micros(100));
            }
        }
    }
}
