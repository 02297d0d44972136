use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    #[error("key is already present in the map")]
    DuplicateKey,
    #[error("key not found")]
    KeyNotFound,
    #[error("requested capacity exceeds the maximum table size")]
    CapacityOverflow,
    #[error("map was modified while it was being scanned")]
    ConcurrentModification,
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
}

pub type Result<T> = std::result::Result<T, MapError>;
