use thiserror::Error;

/// Errors raised by the Object Store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ObjectError {
    #[error(transparent)]
    Storage(#[from] warren_storage::Error),
    #[error(transparent)]
    Coordinator(#[from] warren_coordinator::CoordinatorError),
    /// A requested allocation exceeds `MAX_SIZE` (65535 bytes).
    #[error("allocation of {requested} bytes exceeds the maximum record size of {max}")]
    TooLarge { requested: usize, max: usize },
    /// The store's preamble doesn't carry the expected magic number.
    #[error("object store preamble has an unrecognized magic id: 0x{found:016x}")]
    BadMagic { found: u64 },
    /// The named-root table is full.
    #[error("named-root registry is full (max {max})")]
    RegistryFull { max: usize },
}

pub type Result<T> = std::result::Result<T, ObjectError>;

/// Errors raised by the persistent B+ Tree.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BTreeError {
    #[error(transparent)]
    Object(#[from] ObjectError),
    /// A key or value equal to `KEY_NULL` was supplied where a real key or
    /// value is required.
    #[error("KEY_NULL is reserved and cannot be stored as a real key or value")]
    ReservedKey,
    /// `open_named` was asked for a root that isn't registered.
    #[error("no named root registered under {name:?}")]
    RootNotFound { name: String },
}

pub type BTreeResult<T> = std::result::Result<T, BTreeError>;
