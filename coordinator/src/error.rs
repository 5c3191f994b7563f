use thiserror::Error;

/// Errors surfaced by the Access Coordinator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoordinatorError {
    /// The underlying storage failed.
    #[error(transparent)]
    Storage(#[from] warren_storage::Error),
    /// Every pooled access slot is in use and none freed up within the
    /// bounded retry budget.
    #[error("access slot pool exhausted")]
    SlotsExhausted,
    /// The requested range overflows `u64`.
    #[error("access range overflows: location {location} length {length}")]
    RangeOverflow { location: u64, length: u64 },
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
