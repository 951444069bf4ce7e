//! Pascal-specific error taxonomy, convertible into the shared
//! `paleofs_core::Error` at the crate boundary.

#[derive(Debug, thiserror::Error)]
pub enum PascalError {
    #[error("bad volume header at block {0}")]
    BadVolumeHeader(u32),
    #[error("corrupt structure: {0}")]
    Corrupt(&'static str),
    #[error("name already exists: {0}")]
    DuplicateName(String),
    #[error("no contiguous free range of {0} blocks; defragment first")]
    NoContiguousSpace(u32),
    #[error(transparent)]
    Core(#[from] paleofs_core::Error),
}

impl From<PascalError> for paleofs_core::Error {
    fn from(err: PascalError) -> Self {
        match err {
            PascalError::Core(e) => e,
            PascalError::DuplicateName(name) => paleofs_core::Error::DuplicateName(name),
            PascalError::NoContiguousSpace(_) => paleofs_core::Error::DiskFull,
            PascalError::BadVolumeHeader(_) | PascalError::Corrupt(_) => {
                paleofs_core::Error::structural(err.to_string())
            }
        }
    }
}

pub type Result<T> = core::result::Result<T, PascalError>;
