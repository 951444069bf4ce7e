//! `paleofs-core` — the chunk-device, allocation, and descriptor engine
//! shared by every vintage filesystem format in the `paleofs` workspace.
//!
//! Individual format crates (`paleofs-hfs`, `paleofs-prodos`, …) build
//! their catalog/extent/index models on top of the types here; none of
//! them reimplement block I/O, allocation, or the read/write/seek state
//! machine.

pub mod arena;
pub mod bitmap;
pub mod descriptor;
pub mod device;
pub mod entry;
pub mod error;
pub mod fsops;
pub mod notes;
pub mod usage;

pub use device::{ChunkDevice, MemoryDevice, SectorOrder, BLOCK_SIZE, SECTOR_SIZE};
pub use error::{Error, Result};
pub use gate::{AccessLevel, GatedDevice};

mod gate;
