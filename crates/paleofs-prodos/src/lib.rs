//! ProDOS volume directory and seedling/sapling/tree file model on top of
//! `paleofs_core` (spec §3, §4.6).

pub mod directory;
pub mod error;
pub mod extended;
pub mod fs;
pub mod time;
pub mod tree;

pub use error::{ProdosError, Result};
pub use fs::{EntryLocation, ProdosVolume};
