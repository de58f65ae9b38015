//! Byte-addressable allocation arena backing each partition's hash table.
//!
//! The arena hands out opaque [`Address`] offsets instead of pointers.
//! Memory comes from fixed-size chained blocks; a block is never moved or
//! unmapped once allocated, so every live address stays valid until its
//! owner disposes it. Disposed ranges go to a size-bucketed free list and
//! are reused best-effort, not physically reclaimed.
//!
//! Nothing here requires the backing memory to be non-volatile; the arena
//! is an addressing abstraction over which records are laid out manually.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use crate::error::{Error, Result};

/// All allocations are rounded up to this, so any 8-aligned word inside a
/// record can be read and written atomically.
pub const WORD_ALIGN: usize = 8;

/// Opaque offset into an [`Arena`]. Comparable and copyable; never
/// dereferenced outside the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Address(u64);

impl Address {
    /// Reserved sentinel meaning "none".
    pub const NONE: Address = Address(u64::MAX);

    pub fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(raw: u64) -> Self {
        Address(raw)
    }
}

struct Cursor {
    block: usize,
    offset: usize,
}

/// Chained-block arena with a size-bucketed free list.
pub struct Arena {
    block_size: usize,
    max_blocks: usize,
    // Push-only; a Box<[u8]> never relocates, so raw pointers derived from
    // it stay valid while the arena lives.
    blocks: RwLock<Vec<Box<[u8]>>>,
    cursor: Mutex<Cursor>,
    // size class (power of two) -> disposed addresses of that class
    free: Mutex<BTreeMap<usize, Vec<Address>>>,
    used: AtomicUsize,
}

// A single structural writer mutates record bytes before publishing them
// through atomic word stores; readers only follow published words. Blocks
// themselves are append-only.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub fn new(block_size: usize, max_blocks: usize) -> Self {
        debug_assert!(block_size % WORD_ALIGN == 0);
        Self {
            block_size,
            max_blocks,
            blocks: RwLock::new(Vec::new()),
            cursor: Mutex::new(Cursor { block: 0, offset: 0 }),
            free: Mutex::new(BTreeMap::new()),
            used: AtomicUsize::new(0),
        }
    }

    fn size_class(size: usize) -> usize {
        size.next_power_of_two().max(WORD_ALIGN)
    }

    /// Allocate `size` bytes. Extends the arena with a new chained block on
    /// overflow; failing to extend is `ResourceExhausted`, never silent.
    pub fn allocate(&self, size: usize) -> Result<Address> {
        if size == 0 {
            return Err(Error::InvalidInput("zero-size allocation".to_string()));
        }
        let rounded = Self::size_class(size);
        if rounded > self.block_size {
            return Err(Error::ResourceExhausted(format!(
                "allocation of {} bytes exceeds block size {}",
                size, self.block_size
            )));
        }

        // Best-effort reuse of a previously disposed range of the same class.
        if let Some(addr) = self.free.lock()?.get_mut(&rounded).and_then(Vec::pop) {
            self.used.fetch_add(rounded, Ordering::Relaxed);
            return Ok(addr);
        }

        let mut cursor = self.cursor.lock()?;
        let mut blocks = self.blocks.write()?;
        if blocks.is_empty() || cursor.offset + rounded > self.block_size {
            if blocks.len() >= self.max_blocks {
                return Err(Error::ResourceExhausted(format!(
                    "arena cannot grow past {} blocks",
                    self.max_blocks
                )));
            }
            blocks.push(vec![0u8; self.block_size].into_boxed_slice());
            cursor.block = blocks.len() - 1;
            cursor.offset = 0;
        }

        let addr = Address((cursor.block * self.block_size + cursor.offset) as u64);
        cursor.offset += rounded;
        self.used.fetch_add(rounded, Ordering::Relaxed);
        Ok(addr)
    }

    /// Return a range to the free list for reuse. `size` must be the size
    /// originally passed to `allocate`.
    pub fn dispose(&self, addr: Address, size: usize) {
        debug_assert!(!addr.is_none());
        let rounded = Self::size_class(size);
        if let Ok(mut free) = self.free.lock() {
            free.entry(rounded).or_default().push(addr);
            self.used.fetch_sub(rounded, Ordering::Relaxed);
        }
    }

    fn ptr(&self, addr: Address, len: usize) -> *mut u8 {
        debug_assert!(!addr.is_none());
        let raw = addr.0 as usize;
        let block = raw / self.block_size;
        let offset = raw % self.block_size;
        debug_assert!(offset + len <= self.block_size);
        let blocks = self.blocks.read().expect("arena block table poisoned");
        blocks[block][offset..].as_ptr() as *mut u8
    }

    /// Copy `dest.len()` bytes starting at `addr` into `dest`.
    pub fn read(&self, dest: &mut [u8], addr: Address) {
        let src = self.ptr(addr, dest.len());
        unsafe { std::ptr::copy_nonoverlapping(src, dest.as_mut_ptr(), dest.len()) };
    }

    /// Copy of `len` bytes starting at `addr`.
    pub fn read_vec(&self, addr: Address, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.read(&mut buf, addr);
        buf
    }

    /// Write `src` at `addr`. The caller must not have published the range
    /// to concurrent readers yet, or must be overwriting non-load-bearing
    /// bytes; published word fields go through [`Arena::atomic_write_u64`].
    pub fn write(&self, addr: Address, src: &[u8]) {
        let dst = self.ptr(addr, src.len());
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
    }

    /// Single-word store visible atomically to concurrent readers. Used for
    /// in-place pointer updates that must never be observed half-written.
    pub fn atomic_write_u64(&self, addr: Address, value: u64) {
        debug_assert!(addr.0 % WORD_ALIGN as u64 == 0);
        let ptr = self.ptr(addr, WORD_ALIGN);
        let cell = unsafe { &*(ptr as *const AtomicU64) };
        cell.store(value, Ordering::Release);
    }

    /// Atomic counterpart load for word fields published by
    /// [`Arena::atomic_write_u64`].
    pub fn atomic_read_u64(&self, addr: Address) -> u64 {
        debug_assert!(addr.0 % WORD_ALIGN as u64 == 0);
        let ptr = self.ptr(addr, WORD_ALIGN);
        let cell = unsafe { &*(ptr as *const AtomicU64) };
        cell.load(Ordering::Acquire)
    }

    /// Live bytes: allocated and not yet disposed (size-class rounded).
    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("block_size", &self.block_size)
            .field("max_blocks", &self.max_blocks)
            .field("used_bytes", &self.used_bytes())
            .finish()
    }
}
