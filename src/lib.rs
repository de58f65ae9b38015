//! cinderdb: the in-memory write-buffering tier of a log-structured store.
//!
//! Incoming records land in key-range partitions backed by arena-allocated
//! hash tables. A compressed trie routes each key to the partition owning
//! its range. Partitions that fill up are frozen and queued at level 0,
//! where an external flush engine converts them into on-disk sorted files;
//! writers stall when that queue backs up. Writes reach partitions either
//! synchronously or through sharded background writer threads with a
//! durable log in front.
//!
//! ```no_run
//! use cinderdb::{Engine, EngineConfig};
//!
//! let engine = Engine::open_with_config(EngineConfig::new("/tmp/cinder"))?;
//! engine.set(b"species", b"capra")?;
//! assert_eq!(engine.get(b"species")?, Some(b"capra".to_vec()));
//! engine.delete(b"species")?;
//! # Ok::<(), cinderdb::Error>(())
//! ```

pub mod arena;
pub mod config;
pub mod engine;
pub mod error;
pub mod flush;
pub mod index;
pub mod level0;
pub mod log;
pub mod partition;
pub mod writer;

#[cfg(test)]
pub mod tmpfs;

pub use config::{EngineConfig, WriteMode};
pub use engine::Engine;
pub use error::{Error, Result};
pub use flush::{FlushEngine, FlushOutcome};
pub use partition::{Lookup, Partition};
