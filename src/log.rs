//! Sequential durable log consumed by the background writers.
//!
//! Each shard owns one log: a record is appended (and synced) here before
//! the write is enqueued, so a buffered write survives the queue. Once a
//! shard queue drains to its clear point the log is reset.
//!
//! # Record Format
//!
//! ```text
//! +-----------+----------------------------------------+-----------+
//! |len: u32   | payload                                | crc32: u32|
//! +-----------+-----------+-----------+-------+--------+-----------+
//!             |key_len:u32|val_len:u32| key   | value  |
//!             +-----------+-----------+-------+--------+
//! ```
//!
//! - All multi-byte integers are big-endian
//! - The CRC32 covers the payload only
//! - `val_len == 0` encodes a tombstone

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Framing overhead around each payload: leading length and trailing crc.
pub const RECORD_OVERHEAD: usize = 8;

type LogEntry = (Vec<u8>, Option<Vec<u8>>);

pub struct Log {
    file: Mutex<File>,
    path: PathBuf,
    end: AtomicU64,
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("path", &self.path)
            .field("end", &self.end.load(Ordering::Relaxed))
            .finish()
    }
}

impl Log {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        let end = file.metadata()?.len();

        Ok(Self {
            file: Mutex::new(file),
            path,
            end: AtomicU64::new(end),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes currently in the log.
    pub fn size(&self) -> u64 {
        self.end.load(Ordering::Acquire)
    }

    /// Append one record and return the offset of its first byte. The
    /// record is written through to the file before the offset is handed
    /// back, so a consumer may re-read it immediately.
    pub fn append(&self, key: &[u8], value: Option<&[u8]>) -> Result<u64> {
        let mut payload = Vec::with_capacity(8 + key.len() + value.map_or(0, <[u8]>::len));
        payload.write_u32::<BigEndian>(key.len() as u32)?;
        payload.write_u32::<BigEndian>(value.map_or(0, <[u8]>::len) as u32)?;
        payload.extend_from_slice(key);
        if let Some(v) = value {
            payload.extend_from_slice(v);
        }
        let checksum = CRC32.checksum(&payload);

        let mut file = self.file.lock()?;
        let offset = self.end.load(Ordering::Acquire);
        file.seek(SeekFrom::Start(offset))?;
        file.write_u32::<BigEndian>(payload.len() as u32)?;
        file.write_all(&payload)?;
        file.write_u32::<BigEndian>(checksum)?;

        self.end.store(
            offset + (RECORD_OVERHEAD + payload.len()) as u64,
            Ordering::Release,
        );
        Ok(offset)
    }

    /// Read back the record at `offset`, returning the entry and the offset
    /// of the following record.
    pub fn read_at(&self, offset: u64) -> Result<(LogEntry, u64)> {
        let mut file = self.file.lock()?;
        file.seek(SeekFrom::Start(offset))?;
        let entry = read_record(&mut *file)?
            .ok_or_else(|| Error::Corruption(format!("no record at offset {}", offset)))?;
        let next = file.stream_position()?;
        Ok((entry, next))
    }

    /// Force written records to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.lock()?.sync_all()?;
        Ok(())
    }

    /// Discard all records. Called at the clear point once every record in
    /// the log has been applied.
    pub fn reset(&self) -> Result<()> {
        let file = self.file.lock()?;
        file.set_len(0)?;
        self.end.store(0, Ordering::Release);
        Ok(())
    }

    /// Iterate records from the start of the log.
    pub fn replay(&self) -> Result<ReplayIter> {
        ReplayIter::new(&self.path)
    }
}

fn read_record<R: Read>(reader: &mut R) -> Result<Option<LogEntry>> {
    let record_len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut payload = vec![0u8; record_len];
    reader
        .read_exact(&mut payload)
        .map_err(|e| Error::Corruption(format!("truncated payload: {}", e)))?;

    let stored_crc = reader
        .read_u32::<BigEndian>()
        .map_err(|e| Error::Corruption(format!("truncated checksum: {}", e)))?;
    if CRC32.checksum(&payload) != stored_crc {
        return Err(Error::Corruption("checksum mismatch".to_string()));
    }

    let mut cursor = Cursor::new(&payload);
    let key_len = cursor.read_u32::<BigEndian>()? as usize;
    let value_len = cursor.read_u32::<BigEndian>()? as usize;

    let mut key = vec![0u8; key_len];
    cursor
        .read_exact(&mut key)
        .map_err(|e| Error::Corruption(format!("truncated key: {}", e)))?;

    let value = if value_len > 0 {
        let mut v = vec![0u8; value_len];
        cursor
            .read_exact(&mut v)
            .map_err(|e| Error::Corruption(format!("truncated value: {}", e)))?;
        Some(v)
    } else {
        None
    };

    Ok(Some((key, value)))
}

pub struct ReplayIter {
    reader: BufReader<File>,
}

impl ReplayIter {
    fn new(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
        })
    }
}

impl Iterator for ReplayIter {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match read_record(&mut self.reader) {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
