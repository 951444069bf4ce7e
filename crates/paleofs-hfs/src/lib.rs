//! HFS (Hierarchical File System) support: Master Directory Block, the
//! catalog and extents-overflow B*-trees, fork storage, and volume
//! scan-and-verify (spec §4.4–§4.6, §6).

pub mod btree;
pub mod catalog;
pub mod error;
pub mod extents;
pub mod fs;
pub mod mdb;
pub mod time;

pub use error::{HfsError, Result};
pub use fs::{HfsForkStorage, HfsVolume, ROOT_DIR_ID, ROOT_PARENT_ID};
