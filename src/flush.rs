//! Seam to the external flush/merge engine.
//!
//! The on-disk sorted-file format belongs to the merge engine; this crate
//! only hands it a sorted iterator over a frozen partition and acts on the
//! outcome. A partition leaves the level-0 queue and the trie index only
//! after the flush engine reports success.

use crate::error::Result;

/// Result of converting one frozen partition into an on-disk sorted file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushOutcome {
    pub file_id: u64,
    pub byte_size: u64,
    pub smallest_key: Vec<u8>,
    pub largest_key: Vec<u8>,
}

/// External collaborator converting frozen partitions into sorted files.
/// `entries` yields `(key, value)` ascending; tombstones arrive as empty
/// values.
pub trait FlushEngine: Send + Sync {
    fn flush(&self, entries: &mut dyn Iterator<Item = (Vec<u8>, Vec<u8>)>) -> Result<FlushOutcome>;
}

#[cfg(test)]
pub mod testing {
    //! In-memory flush engine used by lifecycle tests.

    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemFlushEngine {
        next_file_id: AtomicU64,
        pub flushed: Mutex<Vec<Vec<(Vec<u8>, Vec<u8>)>>>,
    }

    impl FlushEngine for MemFlushEngine {
        fn flush(
            &self,
            entries: &mut dyn Iterator<Item = (Vec<u8>, Vec<u8>)>,
        ) -> Result<FlushOutcome> {
            let collected: Vec<(Vec<u8>, Vec<u8>)> = entries.collect();
            let smallest_key = collected.first().map(|(k, _)| k.clone()).unwrap_or_default();
            let largest_key = collected.last().map(|(k, _)| k.clone()).unwrap_or_default();
            let byte_size = collected
                .iter()
                .map(|(k, v)| (k.len() + v.len()) as u64)
                .sum();
            let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
            self.flushed.lock().expect("flushed lock poisoned").push(collected);
            Ok(FlushOutcome {
                file_id,
                byte_size,
                smallest_key,
                largest_key,
            })
        }
    }
}
