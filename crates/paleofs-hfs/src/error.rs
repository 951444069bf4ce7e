//! HFS-specific error taxonomy, convertible into the shared
//! `paleofs_core::Error` at the crate boundary.

#[derive(Debug, thiserror::Error)]
pub enum HfsError {
    #[error("bad MDB signature: {0:#06x}")]
    BadSignature(u16),
    #[error("corrupt structure: {0}")]
    Corrupt(&'static str),
    #[error("duplicate key")]
    DuplicateKey,
    #[error(transparent)]
    Core(#[from] paleofs_core::Error),
}

impl From<HfsError> for paleofs_core::Error {
    fn from(err: HfsError) -> Self {
        match err {
            HfsError::Core(e) => e,
            HfsError::DuplicateKey => paleofs_core::Error::DuplicateKey,
            HfsError::BadSignature(_) | HfsError::Corrupt(_) => {
                paleofs_core::Error::structural(err.to_string())
            }
        }
    }
}

pub type Result<T> = core::result::Result<T, HfsError>;
