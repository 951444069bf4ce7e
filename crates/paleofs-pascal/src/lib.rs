//! UCSD Pascal contiguous-range volume model on top of `paleofs_core`
//! (spec §3, §4.7).

pub mod directory;
pub mod error;
pub mod fs;
pub mod time;
pub mod tree;

pub use directory::FileKind;
pub use error::{PascalError, Result};
pub use fs::PascalVolume;
pub use time::PascalDate;
