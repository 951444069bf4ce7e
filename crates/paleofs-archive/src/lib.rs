//! Archive-format glue: header parsers for the formats spec §1 calls out
//! as external-collaborator territory (Binary II, AppleSingle/
//! AppleDouble, GZip, ZIP), plus the shared transaction discipline of
//! spec §5.

pub mod error;
pub mod gzip;
pub mod signatures;
pub mod transaction;
pub mod zip;

pub use error::{ArchiveError, Result};
pub use gzip::{GzipArchive, GzipMember};
pub use signatures::{AppleSingleHeader, Binary2Header};
pub use zip::ZipArchive;
