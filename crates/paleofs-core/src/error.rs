//! The error taxonomy shared by every format crate (spec §7).
//!
//! Format crates define their own structural error enums (corrupt node
//! layouts, bad magic numbers, …) and convert them into [`Error::Structural`]
//! at the boundary, the same way `hadris_fat::FileSystemError` wraps
//! `hadris_core::ReadWriteError`.

use std::fmt;

/// Unified error type returned by every public `paleofs-*` operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying device failure, not a structural/on-disk problem.
    #[error("I/O error: {0}")]
    Io(String),

    /// A specific sector or block could not be read and the medium reports
    /// it unrecoverable. Distinct from [`Error::Io`] so callers can retry on
    /// adjacent sectors before giving up.
    #[error("bad block {0}")]
    BadBlock(u32),

    /// Allocation could not satisfy a request.
    #[error("disk full")]
    DiskFull,

    /// A name violates the target filesystem's naming rules.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// A name collides with an existing sibling.
    #[error("duplicate name: {0}")]
    DuplicateName(String),

    /// Caller misuse: bad offset, wrong mode, unknown fork, etc.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// Operation requires file-access (or raw-access) mode.
    #[error("wrong mode: {0}")]
    WrongMode(&'static str),

    /// Structural modification attempted on a read-only image or file.
    #[error("read only")]
    ReadOnly,

    /// Entry not present in the filesystem.
    #[error("not found")]
    NotFound,

    /// The open-file table refused the requested access (§4.7 ordering).
    #[error("open conflict")]
    OpenConflict,

    /// Object used after its owning filesystem was torn down.
    #[error("disposed")]
    Disposed,

    /// An entry handle from a different filesystem / generation.
    #[error("not part of this filesystem")]
    NotPartOfThisFs,

    /// An on-disk invariant is broken (corrupt tree node, bad MDB, …).
    #[error("structural error: {0}")]
    Structural(String),

    /// The entry's damaged flag is set; reads and writes are both refused.
    #[error("damaged file")]
    Damaged,

    /// The entry is dubious (conflict or bad link) and a write was
    /// attempted; reads are still permitted.
    #[error("dubious file, refusing write")]
    DubiousAndWriting,

    /// Structural key already present where a unique key was required.
    #[error("duplicate key")]
    DuplicateKey,
}

impl Error {
    pub fn structural(msg: impl fmt::Display) -> Self {
        Self::Structural(msg.to_string())
    }
}

#[cfg(feature = "std")]
impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value.to_string())
    }
}

pub type Result<T> = core::result::Result<T, Error>;
