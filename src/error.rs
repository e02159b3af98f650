//! Error types for shmbus.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using shmbus's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Longest accepted segment name, in bytes, including the leading `/`.
pub const MAX_NAME_LEN: usize = 247;

/// Main error type for shmbus operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A creator was asked to make a shared-memory object whose name is
    /// already present on the host.
    #[error("shared-memory object `{0}` already exists")]
    NameInUse(String),

    /// The segment name is malformed (missing leading `/`, interior `/`,
    /// embedded NUL, or empty).
    #[error("invalid shared-memory name `{0}`")]
    InvalidName(String),

    /// A segment or allocation of zero bytes was requested.
    #[error("segment length must be greater than 0")]
    ZeroLength,

    /// The segment name exceeds [`MAX_NAME_LEN`] bytes.
    #[error("shared-memory name is {len} bytes, longer than the {MAX_NAME_LEN}-byte limit")]
    NameTooLong {
        /// Length of the offending name in bytes.
        len: usize,
    },

    /// An allocation requested alignment beyond what page-aligned mappings
    /// can guarantee.
    #[error("requested alignment {requested} exceeds the page size {page_size}")]
    TooLargeAlignment {
        /// The alignment the caller asked for.
        requested: usize,
        /// The host page size, which is the largest satisfiable alignment.
        page_size: usize,
    },

    /// An accessor waited for the named object to appear and gave up.
    #[error("shared-memory object did not appear within {0:?}")]
    ObjectNotFoundWithin(Duration),

    /// `shm_open`, `ftruncate`, `fstat`, or `mmap` failed with an errno that
    /// has no more specific classification.
    #[error("mapping shared memory failed: {0}")]
    MappingFailed(#[from] rustix::io::Errno),

    /// The given address does not fall inside any segment owned by the
    /// queried resource, or a typed access would run past the segment end.
    #[error("address {0:#x} is not inside any owned segment")]
    ObjectNotInArena(usize),
}
