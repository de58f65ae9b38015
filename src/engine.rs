//! Write-buffer engine: routes records onto key-range partitions, freezes
//! and splits them as they fill, queues frozen partitions for the flush
//! engine, and stalls writers when the queue backs up.
//!
//! Admission decisions and structural changes (freeze, split, replace,
//! unregister) all happen under the trie index's write lock; reads route
//! under the read lock and never block on structure changes in progress.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{EngineConfig, WriteMode};
use crate::error::{Error, Result};
use crate::flush::{FlushEngine, FlushOutcome};
use crate::index::TrieIndex;
use crate::level0::Level0Queue;
use crate::partition::{Lookup, Partition};
use crate::writer::{BackgroundError, WriteSink, WriterPool};

pub struct Engine {
    shared: Arc<Shared>,
    pool: Option<WriterPool>,
}

struct Shared {
    config: EngineConfig,
    index: RwLock<TrieIndex>,
    level0: Level0Queue,
    next_id: AtomicU64,
    error: Arc<BackgroundError>,
}

impl Engine {
    /// Open with defaults rooted at `dir`.
    pub fn open(dir: impl Into<std::path::PathBuf>) -> Result<Self> {
        Self::open_with_config(EngineConfig::new(dir))
    }

    pub fn open_with_config(config: EngineConfig) -> Result<Self> {
        let error = Arc::new(BackgroundError::new());
        let level0 = Level0Queue::new(config.level0_capacity);

        // Partition 0 handles the full key range until the first split.
        let root = Arc::new(Partition::with_config(0, Vec::new(), None, &config));
        let shared = Arc::new(Shared {
            index: RwLock::new(TrieIndex::new(root)),
            level0,
            next_id: AtomicU64::new(1),
            error: Arc::clone(&error),
            config,
        });

        let pool = match shared.config.write_mode {
            WriteMode::Sync => None,
            WriteMode::Buffered | WriteMode::Ring => {
                let sink: Arc<dyn WriteSink> = Arc::clone(&shared) as Arc<dyn WriteSink>;
                Some(WriterPool::start(&shared.config, sink, error)?)
            }
        };

        info!(mode = ?shared.config.write_mode, "engine opened");
        Ok(Self { shared, pool })
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(key, Some(value))
    }

    /// Deletions are tombstones; they occupy space until the flush engine
    /// merges them against the on-disk levels.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.write(key, None)
    }

    fn write(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidInput("key must not be empty".to_string()));
        }
        self.shared.error.check()?;
        match &self.pool {
            None => self.shared.apply_sync(key, value),
            Some(pool) => {
                let partition = self.shared.index.read()?.route(key);
                if pool.submit(partition, key, value)? {
                    Ok(())
                } else {
                    // Shard queue full; apply on this thread instead of
                    // dropping the write.
                    self.shared.apply_sync(key, value)
                }
            }
        }
    }

    /// Point lookup. Checks the pending-key indexes first, then the
    /// routed partition, then frozen partitions awaiting flush, newest
    /// first. `None` covers both tombstoned and never-written keys.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(pool) = &self.pool {
            if let Some(pending) = pool.pending_get(key) {
                return Ok(pending.map(|v| v.to_vec()));
            }
        }

        let routed = self.shared.index.read()?.route(key);
        match routed.get(key) {
            Lookup::Found(value) => return Ok(Some(value)),
            Lookup::Tombstone => return Ok(None),
            Lookup::Absent => {}
        }

        // A frozen partition may hold keys outside its narrowed bounds
        // when it was split after the writes landed, so every member gets
        // probed.
        for member in self.shared.level0.members().iter().rev() {
            if member.id() == routed.id() {
                continue;
            }
            match member.get(key) {
                Lookup::Found(value) => return Ok(Some(value)),
                Lookup::Tombstone => return Ok(None),
                Lookup::Absent => {}
            }
        }
        Ok(None)
    }

    /// Partition currently owning `key`.
    pub fn route(&self, key: &[u8]) -> Result<Arc<Partition>> {
        Ok(self.shared.index.read()?.route(key))
    }

    /// Whether the mutable-partition budget allows registering another
    /// boundary. A split past the budget rotates the full range instead
    /// of adding one.
    pub fn has_room_for_new_partition(&self) -> Result<bool> {
        Ok(self.shared.index.read()?.len() < self.shared.config.max_partitions)
    }

    /// Freeze the fullest mutable partition into the level-0 queue.
    /// Declines when the queue is already at its bound.
    pub fn pop(&self) -> Result<bool> {
        if self.shared.level0.is_full() {
            return Ok(false);
        }
        self.shared.freeze_fullest()
    }

    /// Like [`Engine::pop`] but ignores the level-0 bound; the transient
    /// overflow is tolerated so a shutdown drain can always make progress.
    pub fn force_pop(&self) -> Result<bool> {
        self.shared.freeze_fullest()
    }

    /// Hand the oldest frozen partition to the flush engine. The
    /// partition leaves the queue and the index only after the flush
    /// succeeds, so a crashed flush retries with nothing lost.
    pub fn promote_oldest(&self, flush: &dyn FlushEngine) -> Result<Option<FlushOutcome>> {
        self.shared.error.check()?;
        let partition = match self.shared.level0.peek_oldest() {
            Some(p) => p,
            None => return Ok(None),
        };

        let outcome = flush.flush(&mut partition.flush_iter())?;
        info!(
            partition = partition.id(),
            file = outcome.file_id,
            bytes = outcome.byte_size,
            "promoted partition"
        );

        {
            let mut index = self.shared.index.write()?;
            // A root re-home can leave a partition registered at a boundary
            // other than its own left bound, so the registration is found
            // by id.
            let registration = index
                .iter()
                .find(|(_, p)| p.id() == partition.id())
                .map(|(bound, _)| bound);
            if let Some(bound) = registration {
                if index.len() == 1 {
                    // The index always keeps a handler for the full range.
                    let fresh = self.shared.fresh_partition(Vec::new(), None);
                    index.insert(&bound, fresh);
                } else {
                    index.remove(&bound)?;
                }
            }
        }
        self.shared.level0.remove(partition.id());
        Ok(Some(outcome))
    }

    /// Freeze everything mutable and promote until the level-0 queue is
    /// empty. Returns the number of partitions flushed.
    pub fn flush_all(&self, flush: &dyn FlushEngine) -> Result<usize> {
        if let Some(pool) = &self.pool {
            pool.drain_and_clear(Duration::from_secs(30))?;
        }
        while self.force_pop()? {}
        let mut flushed = 0;
        while self.promote_oldest(flush)?.is_some() {
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Block until the shard queues are applied.
    pub fn drain(&self, timeout: Duration) -> Result<bool> {
        match &self.pool {
            Some(pool) => pool.drain_and_clear(timeout),
            None => Ok(true),
        }
    }

    pub fn shutdown(&mut self) -> Result<()> {
        if let Some(mut pool) = self.pool.take() {
            pool.shutdown()?;
        }
        info!("engine closed");
        Ok(())
    }

    /// Live arena bytes across mutable and queued partitions.
    pub fn storage_usage(&self) -> Result<usize> {
        let mut seen = HashSet::new();
        let mut total = 0;
        for p in self.shared.index.read()?.partitions() {
            if seen.insert(p.id()) {
                total += p.storage_usage();
            }
        }
        for p in self.shared.level0.members() {
            if seen.insert(p.id()) {
                total += p.storage_usage();
            }
        }
        Ok(total)
    }

    /// Partitions currently registered in the routing index.
    pub fn partition_count(&self) -> Result<usize> {
        Ok(self.shared.index.read()?.len())
    }

    pub fn level0_occupancy(&self) -> usize {
        self.shared.level0.occupancy()
    }

    pub fn queued_writes(&self) -> usize {
        self.pool.as_ref().map_or(0, WriterPool::queued)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // WriterPool's own Drop drains; nothing more to tear down.
        self.pool.take();
    }
}

impl WriteSink for Shared {
    fn apply(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        self.apply_sync(key, value)
    }

    fn admit(&self, partition: &Partition) -> bool {
        Shared::admit(self, partition)
    }

    fn make_room(&self, key: &[u8]) -> Result<()> {
        Shared::make_room(self, key)
    }
}

impl Shared {
    fn next_partition_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn fresh_partition(&self, left: Vec<u8>, right: Option<Vec<u8>>) -> Arc<Partition> {
        Arc::new(Partition::with_config(
            self.next_partition_id(),
            left,
            right,
            &self.config,
        ))
    }

    /// Whether `partition` may take another record right now. Admission
    /// tightens to the near-full threshold while the level-0 queue is
    /// close to its bound.
    fn admit(&self, partition: &Partition) -> bool {
        if partition.is_frozen() || partition.full() {
            return false;
        }
        if self.level0.near_capacity(self.config.near_full_ratio)
            && partition.nearly_full(self.config.near_full_ratio)
        {
            return false;
        }
        true
    }

    /// Synchronous write path, also the workers' fallback for stale
    /// partition references. Retries until a routed partition accepts the
    /// record.
    fn apply_sync(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        loop {
            self.error.check()?;
            let partition = self.index.read()?.route(key);
            if !self.admit(&partition) {
                self.make_room(key)?;
                continue;
            }
            match partition.add(key, value) {
                Ok(()) => {
                    // This record may have pushed the partition over its
                    // threshold; it freezes right away rather than on the
                    // next write.
                    if partition.full() {
                        self.make_room(key)?;
                    }
                    return Ok(());
                }
                Err(Error::Frozen) => continue,
                Err(Error::ResourceExhausted(_)) => self.make_room(key)?,
                Err(e) => return Err(e),
            }
        }
    }

    /// Ensure the partition routing `key` can accept writes: replace a
    /// frozen handler, or freeze-and-split a full one. Stalls first if
    /// the level-0 queue has no room for another frozen partition.
    fn make_room(&self, key: &[u8]) -> Result<()> {
        self.stall_while_backlogged()?;

        let mut index = self.index.write()?;
        let current = index.route(key);
        if self.admit(&current) {
            // Another writer already made room.
            return Ok(());
        }

        if current.is_frozen() {
            let bound = index.left_boundary(key);
            let fresh = self.fresh_partition(bound.clone(), current.right_bound());
            debug!(
                old = current.id(),
                new = fresh.id(),
                "replacing frozen range handler"
            );
            index.insert(&bound, fresh);
            if !self.level0.contains(current.id()) {
                self.level0.push(current)?;
            }
            return Ok(());
        }

        self.split_partition(&mut index, current)
    }

    /// Freeze `current` and register a new empty partition for the upper
    /// half of its range, boundary picked from a key sample. Falls back
    /// to replacing the whole range when no usable boundary exists.
    fn split_partition(&self, index: &mut TrieIndex, current: Arc<Partition>) -> Result<()> {
        current.freeze()?;

        let mut samples = current.sample_keys(self.config.split_sample_size);
        samples.sort();
        samples.dedup();
        // A boundary at the partition's own start would leave the old
        // range empty.
        samples.retain(|k| k.as_slice() > current.left_bound());
        // At the partition budget, rotate the range instead of adding a
        // boundary.
        if index.len() >= self.config.max_partitions {
            samples.clear();
        }

        match samples.get(samples.len() / 2).cloned() {
            Some(boundary) => {
                let fresh = self.fresh_partition(boundary.clone(), current.right_bound());
                info!(
                    old = current.id(),
                    new = fresh.id(),
                    entries = current.entry_count(),
                    "split partition"
                );
                current.set_right_bound(boundary.clone());
                index.insert(&boundary, fresh);
            }
            None => {
                let bound = current.left_bound().to_vec();
                let fresh = self.fresh_partition(bound.clone(), current.right_bound());
                debug!(old = current.id(), new = fresh.id(), "rotated partition");
                index.insert(&bound, fresh);
            }
        }
        self.level0.push(current)
    }

    /// Freeze the fullest mutable partition into the level-0 queue.
    fn freeze_fullest(&self) -> Result<bool> {
        let mut index = self.index.write()?;
        let candidate = index
            .partitions()
            .into_iter()
            .filter(|p| !p.is_frozen() && p.entry_count() > 0)
            .max_by_key(|p| p.written_bytes());
        match candidate {
            Some(candidate) => {
                self.split_partition(&mut index, candidate)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Escalating stall while the level-0 queue sits at its bound: the
    /// interval doubles with overflow depth up to the configured cap.
    fn stall_while_backlogged(&self) -> Result<()> {
        let mut stalled = false;
        while self.level0.is_full() {
            self.error.check()?;
            let depth = self.level0.overflow_depth() as u32;
            let shift = depth.saturating_sub(1).min(16);
            let wait = self
                .config
                .backoff_base
                .saturating_mul(1u32 << shift)
                .min(self.config.backoff_max);
            if !stalled {
                warn!(
                    occupancy = self.level0.occupancy(),
                    "level-0 queue full, stalling writes"
                );
                stalled = true;
            }
            if self.level0.wait_not_full(wait)? {
                break;
            }
        }
        Ok(())
    }
}
