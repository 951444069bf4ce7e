//! ProDOS-specific error taxonomy, convertible into the shared
//! `paleofs_core::Error` at the crate boundary.

#[derive(Debug, thiserror::Error)]
pub enum ProdosError {
    #[error("bad volume directory signature at block {0}")]
    BadVolumeHeader(u32),
    #[error("corrupt structure: {0}")]
    Corrupt(&'static str),
    #[error("name already exists: {0}")]
    DuplicateName(String),
    #[error(transparent)]
    Core(#[from] paleofs_core::Error),
}

impl From<ProdosError> for paleofs_core::Error {
    fn from(err: ProdosError) -> Self {
        match err {
            ProdosError::Core(e) => e,
            ProdosError::DuplicateName(name) => paleofs_core::Error::DuplicateName(name),
            ProdosError::BadVolumeHeader(_) | ProdosError::Corrupt(_) => {
                paleofs_core::Error::structural(err.to_string())
            }
        }
    }
}

pub type Result<T> = core::result::Result<T, ProdosError>;
