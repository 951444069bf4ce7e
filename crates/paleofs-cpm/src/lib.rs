//! CP/M extent-chain file model on top of `paleofs_core` (spec §3, §4.7).

pub mod error;
pub mod extent;
pub mod fs;
pub mod tree;

pub use error::{CpmError, Result};
pub use extent::FileId;
pub use fs::CpmVolume;
pub use tree::DiskParams;
