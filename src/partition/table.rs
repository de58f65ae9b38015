//! Hash-indexed table over a partition's arena.
//!
//! A chained hash table whose entries live as contiguous records in the
//! partition's [`Arena`]. Values sit in separate records so an update can
//! swap the entry's value pointer with one atomic word store; the old
//! region is retired, not reused, until freeze, since a reader that loaded
//! the pointer before the swap may still be reading from it. Within a
//! partition last-write-wins by physical arrival order into the chain, not
//! by any external sequence number.
//!
//! # Entry Record
//!
//! ```text
//! +-----------------+ 0
//! | next: Address   | 8
//! | value: Address  | 16   (atomic word, swapped on update)
//! | key_len: u32    | 20
//! | pad: u32        | 24   (ENTRY_HEADER)
//! | key bytes       |
//! +-----------------+
//! ```
//!
//! # Value Record
//!
//! ```text
//! +-----------------+ 0
//! | value_len: u32  | 4
//! | pad: u32        | 8    (VALUE_HEADER)
//! | value bytes     |
//! +-----------------+
//! ```
//!
//! A `value_len` of zero encodes a tombstone.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use rand::Rng;

use crate::arena::{Address, Arena};
use crate::error::{Error, Result};

const ENTRY_NEXT: u64 = 0;
const ENTRY_VALUE: u64 = 8;
const ENTRY_KEY_LEN: u64 = 16;
const ENTRY_HEADER: usize = 24;

const VALUE_LEN: u64 = 0;
const VALUE_HEADER: usize = 8;

/// Outcome of a point lookup. A tombstone is distinct from absence: it
/// shadows older versions in the levels below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Vec<u8>),
    Tombstone,
    Absent,
}

/// Chained hash table with atomic fill accounting and freeze state.
///
/// Readers walk chains through atomic word loads and never block; writers
/// are serialized by an internal lock.
pub struct HashTable {
    arena: Arena,
    buckets: Vec<AtomicU64>,
    write_lock: Mutex<()>,
    written_bytes: AtomicUsize,
    entry_count: AtomicUsize,
    capacity_bytes: usize,
    capacity_entries: usize,
    frozen: AtomicBool,
    // Superseded value records. The arena takes them back at freeze;
    // recycling them earlier could hand a range a reader is still
    // walking to the next writer.
    retired: Mutex<Vec<(Address, usize)>>,
}

impl HashTable {
    pub fn new(
        arena: Arena,
        bucket_count: usize,
        capacity_bytes: usize,
        capacity_entries: usize,
    ) -> Self {
        let mut buckets = Vec::with_capacity(bucket_count);
        buckets.resize_with(bucket_count, || AtomicU64::new(Address::NONE.as_u64()));
        Self {
            arena,
            buckets,
            write_lock: Mutex::new(()),
            written_bytes: AtomicUsize::new(0),
            entry_count: AtomicUsize::new(0),
            capacity_bytes,
            capacity_entries,
            frozen: AtomicBool::new(false),
            retired: Mutex::new(Vec::new()),
        }
    }

    fn bucket_index(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        hasher.write(key);
        (hasher.finish() as usize) % self.buckets.len()
    }

    fn entry_key(&self, entry: Address) -> Vec<u8> {
        let key_len = self.arena.atomic_read_u64(Address::from_u64(
            entry.as_u64() + ENTRY_KEY_LEN,
        )) as u32 as usize;
        self.arena
            .read_vec(Address::from_u64(entry.as_u64() + ENTRY_HEADER as u64), key_len)
    }

    fn entry_next(&self, entry: Address) -> Address {
        Address::from_u64(
            self.arena
                .atomic_read_u64(Address::from_u64(entry.as_u64() + ENTRY_NEXT)),
        )
    }

    fn entry_value_addr(&self, entry: Address) -> Address {
        Address::from_u64(
            self.arena
                .atomic_read_u64(Address::from_u64(entry.as_u64() + ENTRY_VALUE)),
        )
    }

    fn read_value(&self, value_addr: Address) -> Option<Vec<u8>> {
        let len = self
            .arena
            .atomic_read_u64(Address::from_u64(value_addr.as_u64() + VALUE_LEN))
            as u32 as usize;
        if len == 0 {
            return None;
        }
        Some(
            self.arena
                .read_vec(Address::from_u64(value_addr.as_u64() + VALUE_HEADER as u64), len),
        )
    }

    fn write_value(&self, value: Option<&[u8]>) -> Result<Address> {
        let len = value.map_or(0, <[u8]>::len);
        let addr = self.arena.allocate(VALUE_HEADER + len)?;
        if let Some(v) = value {
            self.arena
                .write(Address::from_u64(addr.as_u64() + VALUE_HEADER as u64), v);
        }
        // Length is published last so a concurrent reader following a
        // freshly swapped pointer sees complete bytes.
        self.arena
            .atomic_write_u64(Address::from_u64(addr.as_u64() + VALUE_LEN), len as u64);
        Ok(addr)
    }

    fn find_entry(&self, head: Address, key: &[u8]) -> Option<Address> {
        let mut cursor = head;
        while !cursor.is_none() {
            if self.entry_key(cursor) == key {
                return Some(cursor);
            }
            cursor = self.entry_next(cursor);
        }
        None
    }

    /// Insert or update. An existing entry's value pointer is swapped in
    /// place; a new entry is prepended to its chain.
    pub fn add(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(Error::Frozen);
        }
        let _guard = self.write_lock.lock()?;

        let bucket = &self.buckets[self.bucket_index(key)];
        let head = Address::from_u64(bucket.load(Ordering::Acquire));

        if let Some(entry) = self.find_entry(head, key) {
            let old = self.entry_value_addr(entry);
            let new = self.write_value(value)?;
            self.arena
                .atomic_write_u64(Address::from_u64(entry.as_u64() + ENTRY_VALUE), new.as_u64());

            let old_len = self
                .arena
                .atomic_read_u64(Address::from_u64(old.as_u64() + VALUE_LEN))
                as u32 as usize;
            self.retired.lock()?.push((old, VALUE_HEADER + old_len));
            self.written_bytes
                .fetch_add(VALUE_HEADER + value.map_or(0, <[u8]>::len), Ordering::SeqCst);
            return Ok(());
        }

        let value_addr = self.write_value(value)?;
        let entry = self.arena.allocate(ENTRY_HEADER + key.len())?;
        self.arena
            .write(Address::from_u64(entry.as_u64() + ENTRY_HEADER as u64), key);
        self.arena.atomic_write_u64(
            Address::from_u64(entry.as_u64() + ENTRY_KEY_LEN),
            key.len() as u64,
        );
        self.arena.atomic_write_u64(
            Address::from_u64(entry.as_u64() + ENTRY_VALUE),
            value_addr.as_u64(),
        );
        self.arena
            .atomic_write_u64(Address::from_u64(entry.as_u64() + ENTRY_NEXT), head.as_u64());
        // Publish: readers can only reach the entry after this store.
        bucket.store(entry.as_u64(), Ordering::Release);

        self.written_bytes.fetch_add(
            ENTRY_HEADER + key.len() + VALUE_HEADER + value.map_or(0, <[u8]>::len),
            Ordering::SeqCst,
        );
        self.entry_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Walk the key's chain. Safe to call concurrently with a writer.
    pub fn get(&self, key: &[u8]) -> Lookup {
        let bucket = &self.buckets[self.bucket_index(key)];
        let head = Address::from_u64(bucket.load(Ordering::Acquire));
        match self.find_entry(head, key) {
            Some(entry) => match self.read_value(self.entry_value_addr(entry)) {
                Some(value) => Lookup::Found(value),
                None => Lookup::Tombstone,
            },
            None => Lookup::Absent,
        }
    }

    pub fn written_bytes(&self) -> usize {
        self.written_bytes.load(Ordering::SeqCst)
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count.load(Ordering::SeqCst)
    }

    /// True once either fill threshold is crossed; triggers the
    /// Mutable -> Immutable transition.
    pub fn full(&self) -> bool {
        self.written_bytes() >= self.capacity_bytes || self.entry_count() >= self.capacity_entries
    }

    /// True at `ratio` of either threshold; used by admission control to
    /// shrink the acceptance policy before the partition is actually full.
    pub fn nearly_full(&self, ratio: f64) -> bool {
        self.written_bytes() as f64 >= self.capacity_bytes as f64 * ratio
            || self.entry_count() as f64 >= self.capacity_entries as f64 * ratio
    }

    pub fn freeze(&self) -> Result<()> {
        if self.frozen.swap(true, Ordering::SeqCst) {
            return Err(Error::Frozen);
        }
        // The write lock waits out any add that passed the frozen check
        // before the swap. A frozen table never allocates again, so the
        // retired ranges can go back to the arena: readers chasing a
        // pre-swap pointer find the bytes untouched on the free list.
        let _guard = self.write_lock.lock()?;
        let mut retired = self.retired.lock()?;
        for (addr, size) in retired.drain(..) {
            self.arena.dispose(addr, size);
        }
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Full-table scan into a key-sorted snapshot. Tombstones are kept:
    /// the merge engine needs them to shadow older on-disk versions.
    pub fn sorted_entries(&self) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        let mut entries = Vec::with_capacity(self.entry_count());
        for bucket in &self.buckets {
            let mut cursor = Address::from_u64(bucket.load(Ordering::Acquire));
            while !cursor.is_none() {
                let key = self.entry_key(cursor);
                let value = self.read_value(self.entry_value_addr(cursor));
                entries.push((key, value));
                cursor = self.entry_next(cursor);
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Collect up to `n` keys via a randomized walk over the buckets.
    /// Split-boundary selection wants a rough spread, not uniformity.
    pub fn sample_keys(&self, n: usize) -> Vec<Vec<u8>> {
        let mut keys = Vec::with_capacity(n);
        if self.buckets.is_empty() || n == 0 {
            return keys;
        }
        let start = rand::thread_rng().gen_range(0..self.buckets.len());
        for i in 0..self.buckets.len() {
            let bucket = &self.buckets[(start + i) % self.buckets.len()];
            let mut cursor = Address::from_u64(bucket.load(Ordering::Acquire));
            while !cursor.is_none() && keys.len() < n {
                keys.push(self.entry_key(cursor));
                cursor = self.entry_next(cursor);
            }
            if keys.len() >= n {
                break;
            }
        }
        keys
    }

    /// Live arena bytes backing this table.
    pub fn storage_usage(&self) -> usize {
        self.arena.used_bytes()
    }
}

impl std::fmt::Debug for HashTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTable")
            .field("entries", &self.entry_count())
            .field("written_bytes", &self.written_bytes())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}
