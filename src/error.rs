//! Error types for shelfheap.

use thiserror::Error;

/// Result type alias using shelfheap's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for shelfheap operations.
///
/// Each variant carries a stable numeric code (see [`Error::code`]) so that
/// cooperating processes sharing the same shelves agree on failure causes
/// without sharing a binary.
#[derive(Error, Debug)]
pub enum Error {
    /// The backing file for a shelf does not exist.
    #[error("shelf file not found: {0}")]
    ShelfFileNotFound(String),

    /// A shelf with this pathname already exists.
    #[error("shelf already exists: {0}")]
    ShelfExists(String),

    /// The shelf is already open in this process.
    #[error("shelf file already opened: {0}")]
    ShelfFileOpened(String),

    /// An entry with this id is already registered.
    #[error("id already registered: {0}")]
    IdFound(String),

    /// No entry with this id is registered.
    #[error("id not registered: {0}")]
    IdNotFound(String),

    /// Every epoch-vector slot is claimed by a live participant.
    #[error("epoch vector is full")]
    PoolFull,

    /// The heap has no chunk large enough for the request.
    #[error("heap out of memory")]
    OutOfMemory,

    /// An argument violated an operation's preconditions.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// On-shelf metadata failed its magic or version check.
    #[error("corrupted shelf metadata: {0}")]
    Corrupted(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Stable numeric id for cross-process agreement.
    ///
    /// Success is code 0 and is represented by `Ok(_)`, never by a variant.
    pub fn code(&self) -> u32 {
        match self {
            Error::ShelfFileNotFound(_) => 1,
            Error::ShelfExists(_) => 2,
            Error::ShelfFileOpened(_) => 3,
            Error::IdFound(_) => 4,
            Error::IdNotFound(_) => 5,
            Error::PoolFull => 6,
            Error::OutOfMemory => 7,
            Error::InvalidArg(_) => 8,
            Error::Corrupted(_) => 9,
            Error::Io(_) | Error::System(_) => 10,
        }
    }
}
