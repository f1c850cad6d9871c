use std::io;

use thiserror::Error;

use crate::flavor::FlavorKind;

pub type Result<T> = std::result::Result<T, FmqError>;

#[derive(Debug, Error)]
pub enum FmqError {
    #[error("shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("descriptor encode error: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("descriptor decode error: {0}")]
    Decode(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("flavor mismatch: handle is {expected:?}, descriptor is {found:?}")]
    FlavorMismatch {
        expected: FlavorKind,
        found: FlavorKind,
    },
    #[error("quantum size mismatch: element is {expected} bytes, descriptor says {found}")]
    QuantumSizeMismatch { expected: usize, found: usize },

    /// Not enough free slots for an all-or-nothing write.
    #[error("not enough space: requested {requested} quanta, {available} available")]
    InsufficientSpace { requested: usize, available: usize },
    /// Not enough published quanta for an all-or-nothing read.
    #[error("not enough data: requested {requested} quanta, {available} available")]
    InsufficientData { requested: usize, available: usize },
    /// The request could never be satisfied, even by an empty queue.
    #[error("request of {requested} quanta exceeds capacity {capacity}")]
    ExceedsCapacity { requested: usize, capacity: usize },
    /// The writer lapped this reader. The reader cursor now sits at `resync_to`.
    #[error("reader overrun by {lag} quanta, resynchronized to {resync_to}")]
    Overflow { lag: u64, resync_to: u64 },

    #[error("timed out")]
    Timeout,
    #[error("queue has no event flag")]
    NoEventFlag,
    #[error("event flag bitmask must not be empty")]
    EmptyBitmask,
}

impl FmqError {
    /// True for the failures a blocking call waits out instead of returning.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FmqError::InsufficientSpace { .. } | FmqError::InsufficientData { .. }
        )
    }
}
