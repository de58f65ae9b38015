use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    /// Malformed or checksum-failed record during log replay.
    Corruption(String),
    /// Key absent or tombstoned. A normal, non-fatal outcome.
    NotFound,
    /// Arena or partition out of space. Handled internally by the
    /// admission layer via freeze/split/stall; never reaches the client.
    ResourceExhausted(String),
    /// Write attempted against an immutable partition.
    Frozen,
    MutexPoisoned,
    InvalidState(String),
    InvalidInput(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::Corruption(msg) => write!(f, "Corrupted record: {}", msg),
            Error::NotFound => write!(f, "Key not found"),
            Error::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
            Error::Frozen => write!(f, "Partition is frozen"),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
