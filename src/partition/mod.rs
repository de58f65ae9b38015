//! Key-range partition: one memtable instance with its own arena-backed
//! hash table.
//!
//! A partition owns the half-open key range `[left_bound, right_bound)`;
//! an empty `left_bound` means unbounded below and a `None` right bound
//! unbounded above. Partitions are shared as `Arc<Partition>`: the trie
//! index holds one reference while the partition is the live handler for
//! its range, the level-0 queue holds one while it awaits flushing, and
//! readers take short-lived ones. The arena is released when the last
//! reference drops.

pub mod table;

use std::sync::RwLock;
use std::time::SystemTime;

use crate::arena::Arena;
use crate::config::EngineConfig;
use crate::error::Result;

pub use table::{HashTable, Lookup};

pub struct Partition {
    id: u64,
    left_bound: Vec<u8>,
    right_bound: RwLock<Option<Vec<u8>>>,
    table: HashTable,
    created_at: SystemTime,
}

impl Partition {
    pub fn new(id: u64, left_bound: Vec<u8>, right_bound: Option<Vec<u8>>, table: HashTable) -> Self {
        Self {
            id,
            left_bound,
            right_bound: RwLock::new(right_bound),
            table,
            created_at: SystemTime::now(),
        }
    }

    /// Build a partition sized from the engine configuration. The arena
    /// budget leaves headroom above the freeze threshold so the threshold
    /// is what triggers freezing, not arena exhaustion.
    pub fn with_config(
        id: u64,
        left_bound: Vec<u8>,
        right_bound: Option<Vec<u8>>,
        config: &EngineConfig,
    ) -> Self {
        let max_blocks = (config.partition_capacity_bytes * 2 / config.arena_block_size).max(2);
        let arena = Arena::new(config.arena_block_size, max_blocks);
        let table = HashTable::new(
            arena,
            config.hash_bucket_count,
            config.partition_capacity_bytes,
            config.partition_capacity_entries,
        );
        Self::new(id, left_bound, right_bound, table)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn left_bound(&self) -> &[u8] {
        &self.left_bound
    }

    pub fn right_bound(&self) -> Option<Vec<u8>> {
        self.right_bound.read().expect("bound lock poisoned").clone()
    }

    /// Narrow the range during a split. The keys at/after `bound` become
    /// another partition's responsibility.
    pub fn set_right_bound(&self, bound: Vec<u8>) {
        *self.right_bound.write().expect("bound lock poisoned") = Some(bound);
    }

    /// Whether `key` falls inside `[left_bound, right_bound)`.
    pub fn owns(&self, key: &[u8]) -> bool {
        if key < self.left_bound.as_slice() {
            return false;
        }
        match &*self.right_bound.read().expect("bound lock poisoned") {
            Some(right) => key < right.as_slice(),
            None => true,
        }
    }

    pub fn add(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        self.table.add(key, value)
    }

    pub fn get(&self, key: &[u8]) -> Lookup {
        self.table.get(key)
    }

    pub fn freeze(&self) -> Result<()> {
        self.table.freeze()
    }

    pub fn is_frozen(&self) -> bool {
        self.table.is_frozen()
    }

    pub fn full(&self) -> bool {
        self.table.full()
    }

    pub fn nearly_full(&self, ratio: f64) -> bool {
        self.table.nearly_full(ratio)
    }

    pub fn written_bytes(&self) -> usize {
        self.table.written_bytes()
    }

    pub fn entry_count(&self) -> usize {
        self.table.entry_count()
    }

    pub fn storage_usage(&self) -> usize {
        self.table.storage_usage()
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn sample_keys(&self, n: usize) -> Vec<Vec<u8>> {
        self.table.sample_keys(n)
    }

    /// Sorted forward iterator handed to the flush engine. Tombstones come
    /// out as empty values, matching the record encoding.
    pub fn flush_iter(&self) -> FlushIter {
        FlushIter {
            entries: self.table.sorted_entries().into_iter(),
        }
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("id", &self.id)
            .field("left_bound", &self.left_bound)
            .field("right_bound", &self.right_bound())
            .field("frozen", &self.is_frozen())
            .field("entries", &self.entry_count())
            .finish()
    }
}

pub struct FlushIter {
    entries: std::vec::IntoIter<(Vec<u8>, Option<Vec<u8>>)>,
}

impl Iterator for FlushIter {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries
            .next()
            .map(|(key, value)| (key, value.unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(left: &[u8], right: Option<&[u8]>) -> Partition {
        let config = EngineConfig::default()
            .partition_capacity_bytes(64 * 1024)
            .hash_bucket_count(64)
            .arena_block_size(16 * 1024);
        Partition::with_config(1, left.to_vec(), right.map(<[u8]>::to_vec), &config)
    }

    #[test]
    fn test_owns_respects_bounds() {
        let p = partition(b"b", Some(b"m"));
        assert!(!p.owns(b"a"));
        assert!(p.owns(b"b"));
        assert!(p.owns(b"ham"));
        assert!(!p.owns(b"m"));
        assert!(!p.owns(b"z"));
    }

    #[test]
    fn test_unbounded_range() {
        let p = partition(b"", None);
        assert!(p.owns(b""));
        assert!(p.owns(b"anything"));
        assert!(p.owns(&[0xff, 0xff]));
    }

    #[test]
    fn test_set_right_bound_narrows() {
        let p = partition(b"", None);
        assert!(p.owns(b"zzz"));
        p.set_right_bound(b"m".to_vec());
        assert!(!p.owns(b"zzz"));
        assert!(p.owns(b"a"));
    }

    #[test]
    fn test_flush_iter_sorted_with_tombstones() {
        let p = partition(b"", None);
        p.add(b"b", Some(b"2")).expect("add failed");
        p.add(b"a", Some(b"1")).expect("add failed");
        p.add(b"c", None).expect("add failed");
        p.freeze().expect("freeze failed");

        let entries: Vec<_> = p.flush_iter().collect();
        assert_eq!(
            entries,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), Vec::new()),
            ]
        );
    }
}
