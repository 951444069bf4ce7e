//! Archive-specific error taxonomy, convertible into the shared
//! `paleofs_core::Error` at the crate boundary (spec §7).

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("bad signature: expected {expected:?}, found {found:?}")]
    BadSignature {
        expected: &'static [u8],
        found: Vec<u8>,
    },
    #[error("unsupported version {0:#010x}")]
    UnsupportedVersion(u32),
    #[error("corrupt structure: {0}")]
    Corrupt(&'static str),
    #[error("crc mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    CrcMismatch { expected: u32, computed: u32 },
    #[error("no part named {0}")]
    NoSuchPart(String),
    #[error(transparent)]
    Core(#[from] paleofs_core::Error),
}

impl From<ArchiveError> for paleofs_core::Error {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Core(e) => e,
            ArchiveError::NoSuchPart(_) => paleofs_core::Error::NotFound,
            other => paleofs_core::Error::structural(other.to_string()),
        }
    }
}

pub type Result<T> = core::result::Result<T, ArchiveError>;
