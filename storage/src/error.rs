use thiserror::Error;

/// Errors surfaced by a [`crate::Storage`] or an [`crate::Access`] built on top of one.
///
/// All errors are propagated to the caller; the engine never retries I/O on
/// the caller's behalf (see spec §7).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Couldn't open, create, or resize the backing file.
    #[error("opening the backing file failed")]
    Open(#[source] std::io::Error),
    /// Couldn't synchronize to the backing file or memory map.
    #[error("flushing to the backing store failed")]
    Sync(#[source] std::io::Error),
    /// Couldn't take an exclusive lock on the backing file.
    #[error("failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),
    /// Couldn't resize the backing file.
    #[error("resizing the backing file failed: wanted {requested} bytes, had {current}")]
    ResizeFailed {
        current: u64,
        requested: u64,
        source: std::io::Error,
    },
    /// Couldn't grow the memory map.
    #[error("mapping {requested} bytes failed")]
    MapFailed {
        requested: usize,
        source: std::io::Error,
    },
    /// A read or write exceeded the bounds of the enclosing Access or Endpoint.
    #[error("index out of bounds: offset {offset} length {len}, storage size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
    /// Operation attempted on a Storage or Access that has already been closed.
    #[error("storage has already been closed")]
    AlreadyClosed,
    /// The split-file backend ran out of the 9999 addressable part files.
    #[error("split-file storage ran out of part file numbers (max {max})")]
    TooManyParts { max: u32 },
    /// Miscellaneous configuration or invariant violation.
    #[error("{0}")]
    Other(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
