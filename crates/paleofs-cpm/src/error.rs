//! CP/M-specific error taxonomy, convertible into the shared
//! `paleofs_core::Error` at the crate boundary.

#[derive(Debug, thiserror::Error)]
pub enum CpmError {
    #[error("no free directory entry")]
    DirectoryFull,
    #[error("corrupt structure: {0}")]
    Corrupt(&'static str),
    #[error("name already exists: {0}")]
    DuplicateName(String),
    #[error(transparent)]
    Core(#[from] paleofs_core::Error),
}

impl From<CpmError> for paleofs_core::Error {
    fn from(err: CpmError) -> Self {
        match err {
            CpmError::Core(e) => e,
            CpmError::DuplicateName(name) => paleofs_core::Error::DuplicateName(name),
            CpmError::DirectoryFull => paleofs_core::Error::DiskFull,
            CpmError::Corrupt(_) => paleofs_core::Error::structural(err.to_string()),
        }
    }
}

pub type Result<T> = core::result::Result<T, CpmError>;
