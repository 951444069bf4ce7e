//! Gated access wrapper (spec §4.1).
//!
//! Fronts a [`ChunkDevice`] with a level — `Closed`, `ReadOnly`, `Open` —
//! driven by the owning filesystem's mode. `Closed` rejects all reads,
//! `ReadOnly` rejects all writes, `Open` delegates unconditionally.

use crate::device::{ChunkDevice, SectorOrder, BLOCK_SIZE, SECTOR_SIZE};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    Closed,
    ReadOnly,
    Open,
}

/// Wraps a [`ChunkDevice`], enforcing [`AccessLevel`] on every call.
///
/// Changing the level (`set_level`) is a single atomic write from the
/// client's perspective: there is no window where a concurrent call could
/// observe a half-applied transition, since all operations on a given
/// filesystem run to completion before the next begins (spec §5).
pub struct GatedDevice<D> {
    device: D,
    level: AccessLevel,
}

impl<D: ChunkDevice> GatedDevice<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            level: AccessLevel::Closed,
        }
    }

    pub fn level(&self) -> AccessLevel {
        self.level
    }

    pub fn set_level(&mut self, level: AccessLevel) {
        self.level = level;
    }

    fn check_read(&self) -> Result<()> {
        match self.level {
            AccessLevel::Closed => Err(Error::Disposed),
            AccessLevel::ReadOnly | AccessLevel::Open => Ok(()),
        }
    }

    fn check_write(&self) -> Result<()> {
        match self.level {
            AccessLevel::Closed => Err(Error::Disposed),
            AccessLevel::ReadOnly => Err(Error::ReadOnly),
            AccessLevel::Open => Ok(()),
        }
    }

    pub fn into_inner(self) -> D {
        self.device
    }

    pub fn inner(&self) -> &D {
        &self.device
    }
}

impl<D: ChunkDevice> ChunkDevice for GatedDevice<D> {
    fn has_blocks(&self) -> bool {
        self.device.has_blocks()
    }
    fn has_sectors(&self) -> bool {
        self.device.has_sectors()
    }
    fn formatted_length(&self) -> u64 {
        self.device.formatted_length()
    }
    fn is_read_only(&self) -> bool {
        self.device.is_read_only() || self.level == AccessLevel::ReadOnly
    }
    fn num_tracks(&self) -> u32 {
        self.device.num_tracks()
    }
    fn num_sectors_per_track(&self) -> u32 {
        self.device.num_sectors_per_track()
    }
    fn file_order(&self) -> SectorOrder {
        self.device.file_order()
    }

    fn read_block(&mut self, block: u32, dst: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        self.check_read()?;
        self.device.read_block(block, dst)
    }

    fn write_block(&mut self, block: u32, src: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.check_write()?;
        self.device.write_block(block, src)
    }

    fn read_blocks(&mut self, start: u32, count: u32, dst: &mut [u8]) -> Result<()> {
        self.check_read()?;
        self.device.read_blocks(start, count, dst)
    }

    fn read_sector(&mut self, track: u32, sector: u32, dst: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        self.check_read()?;
        self.device.read_sector(track, sector, dst)
    }

    fn write_sector(&mut self, track: u32, sector: u32, src: &[u8; SECTOR_SIZE]) -> Result<()> {
        self.check_write()?;
        self.device.write_sector(track, sector, src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    #[test]
    fn closed_rejects_reads() {
        let mut gated = GatedDevice::new(MemoryDevice::zeroed(1));
        let mut buf = [0u8; BLOCK_SIZE];
        assert!(matches!(gated.read_block(0, &mut buf), Err(Error::Disposed)));
    }

    #[test]
    fn read_only_rejects_writes_but_allows_reads() {
        let mut gated = GatedDevice::new(MemoryDevice::zeroed(1));
        gated.set_level(AccessLevel::ReadOnly);
        let mut buf = [0u8; BLOCK_SIZE];
        assert!(gated.read_block(0, &mut buf).is_ok());
        assert!(matches!(gated.write_block(0, &buf), Err(Error::ReadOnly)));
    }

    #[test]
    fn open_allows_everything() {
        let mut gated = GatedDevice::new(MemoryDevice::zeroed(1));
        gated.set_level(AccessLevel::Open);
        let buf = [0u8; BLOCK_SIZE];
        assert!(gated.write_block(0, &buf).is_ok());
    }
}
