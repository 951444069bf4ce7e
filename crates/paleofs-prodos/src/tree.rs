//! ProDOS seedling/sapling/tree index model (spec §4.6) and the
//! [`ForkStorage`] implementation the shared descriptor engine drives.
//!
//! Index blocks store 256 16-bit block numbers split across their two
//! halves: low bytes in `[0..256)`, high bytes in `[256..512)`. A zero
//! entry is a sparse hole — ProDOS never allocates block 0 (the boot
//! block) to a file, so zero is an unambiguous "no block" marker.

use std::cell::RefCell;
use std::rc::Rc;

use paleofs_core::bitmap::{ClumpBitmap, Extent};
use paleofs_core::descriptor::ForkStorage;
use paleofs_core::{ChunkDevice, Error, Result};

use crate::directory::StorageType;

pub const BLOCKS_PER_INDEX: u64 = 256;

/// Unpacks an index block's 256 split-byte entries; exposed for the
/// volume scan to walk sapling/tree index and sub-index blocks directly.
pub fn index_entries(block: &[u8; 512]) -> [u16; 256] {
    let mut out = [0u16; 256];
    for (i, entry) in out.iter_mut().enumerate() {
        *entry = u16::from(block[i]) | (u16::from(block[256 + i]) << 8);
    }
    out
}

fn read_index_entries(block: &[u8; 512]) -> [u16; 256] {
    index_entries(block)
}

fn write_index_entries(entries: &[u16; 256]) -> [u8; 512] {
    let mut block = [0u8; 512];
    for (i, entry) in entries.iter().enumerate() {
        block[i] = (*entry & 0xFF) as u8;
        block[256 + i] = (*entry >> 8) as u8;
    }
    block
}

/// Resolves and grows a single fork (data or resource) through the
/// seedling/sapling/tree ladder. One `ForkStorage` "block" is exactly one
/// 512-byte ProDOS block — there is no separate allocation-block concept
/// here, unlike HFS.
pub struct ProdosForkStorage<D> {
    device: Rc<RefCell<D>>,
    bitmap: Rc<RefCell<ClumpBitmap>>,
    storage_type: StorageType,
    key_pointer: u16,
    blocks_used: u32,
    eof: u64,
}

impl<D: ChunkDevice> ProdosForkStorage<D> {
    pub fn new(
        device: Rc<RefCell<D>>,
        bitmap: Rc<RefCell<ClumpBitmap>>,
        storage_type: StorageType,
        key_pointer: u16,
        blocks_used: u32,
        eof: u64,
    ) -> Self {
        Self {
            device,
            bitmap,
            storage_type,
            key_pointer,
            blocks_used,
            eof,
        }
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    pub fn key_pointer(&self) -> u16 {
        self.key_pointer
    }

    pub fn blocks_used(&self) -> u32 {
        self.blocks_used
    }

    fn read_index(&mut self, block_num: u16) -> Result<[u16; 256]> {
        let mut raw = [0u8; 512];
        self.device.borrow_mut().read_block(block_num as u32, &mut raw)?;
        Ok(read_index_entries(&raw))
    }

    fn write_index(&mut self, block_num: u16, entries: &[u16; 256]) -> Result<()> {
        let raw = write_index_entries(entries);
        self.device.borrow_mut().write_block(block_num as u32, &raw)
    }

    fn alloc_device_block(&mut self) -> Result<u16> {
        let granted = self.bitmap.borrow_mut().alloc_blocks(1, 0)?;
        self.blocks_used += 1;
        Ok(granted.start as u16)
    }

    fn free_device_block(&mut self, block: u16) {
        if block == 0 {
            return;
        }
        self.bitmap.borrow_mut().release_blocks(Extent { start: block as u32, count: 1 });
        self.blocks_used = self.blocks_used.saturating_sub(1);
    }

    /// Promotes storage type so that `index` falls within the ladder's
    /// current tier, per spec §4.6 "file growth promotes storage type
    /// when a new block pushes past the current tier".
    fn ensure_tier(&mut self, index: u64) -> Result<()> {
        if matches!(self.storage_type, StorageType::Deleted) {
            self.storage_type = StorageType::Seedling;
        }
        if matches!(self.storage_type, StorageType::Seedling) && index > 0 {
            let idx_block = self.alloc_device_block()?;
            let mut entries = [0u16; 256];
            entries[0] = self.key_pointer;
            self.write_index(idx_block, &entries)?;
            self.key_pointer = idx_block;
            self.storage_type = StorageType::Sapling;
        }
        if matches!(self.storage_type, StorageType::Sapling) && index >= BLOCKS_PER_INDEX {
            let master_block = self.alloc_device_block()?;
            let mut entries = [0u16; 256];
            entries[0] = self.key_pointer;
            self.write_index(master_block, &entries)?;
            self.key_pointer = master_block;
            self.storage_type = StorageType::Tree;
        }
        Ok(())
    }
}

impl<D: ChunkDevice> ForkStorage for ProdosForkStorage<D> {
    fn block_size(&self) -> usize {
        512
    }

    fn resolve_block(&mut self, index: u64) -> Result<Option<u32>> {
        match self.storage_type {
            StorageType::Deleted => Ok(None),
            StorageType::Seedling => {
                if index == 0 && self.key_pointer != 0 {
                    Ok(Some(self.key_pointer as u32))
                } else {
                    Ok(None)
                }
            }
            StorageType::Sapling => {
                if index >= BLOCKS_PER_INDEX || self.key_pointer == 0 {
                    return Ok(None);
                }
                let entries = self.read_index(self.key_pointer)?;
                let block = entries[index as usize];
                Ok((block != 0).then_some(block as u32))
            }
            StorageType::Tree => {
                if self.key_pointer == 0 {
                    return Ok(None);
                }
                let segment = (index / BLOCKS_PER_INDEX) as usize;
                let slot = (index % BLOCKS_PER_INDEX) as usize;
                let master = self.read_index(self.key_pointer)?;
                if segment >= 256 || master[segment] == 0 {
                    return Ok(None);
                }
                let sub = self.read_index(master[segment])?;
                let block = sub[slot];
                Ok((block != 0).then_some(block as u32))
            }
            other => Err(Error::structural(format!(
                "fork storage type {other:?} does not support block resolution"
            ))),
        }
    }

    fn allocate_block(&mut self, index: u64) -> Result<u32> {
        self.ensure_tier(index)?;
        match self.storage_type {
            StorageType::Seedling => {
                if index != 0 {
                    return Err(Error::InvalidArg("seedling allocate out of range"));
                }
                let block = self.alloc_device_block()?;
                self.key_pointer = block;
                Ok(block as u32)
            }
            StorageType::Sapling => {
                let mut entries = self.read_index(self.key_pointer)?;
                let slot = index as usize;
                if entries[slot] != 0 {
                    return Ok(entries[slot] as u32);
                }
                let block = self.alloc_device_block()?;
                entries[slot] = block;
                self.write_index(self.key_pointer, &entries)?;
                Ok(block as u32)
            }
            StorageType::Tree => {
                let segment = (index / BLOCKS_PER_INDEX) as usize;
                let slot = (index % BLOCKS_PER_INDEX) as usize;
                let mut master = self.read_index(self.key_pointer)?;
                if master[segment] == 0 {
                    let sub_block = self.alloc_device_block()?;
                    master[segment] = sub_block;
                    self.write_index(self.key_pointer, &master)?;
                }
                let sub_ptr = master[segment];
                let mut sub = self.read_index(sub_ptr)?;
                if sub[slot] != 0 {
                    return Ok(sub[slot] as u32);
                }
                let block = self.alloc_device_block()?;
                sub[slot] = block;
                self.write_index(sub_ptr, &sub)?;
                Ok(block as u32)
            }
            other => Err(Error::structural(format!(
                "fork storage type {other:?} does not support allocation"
            ))),
        }
    }

    fn read_device_block(&mut self, device_block: u32, buf: &mut [u8]) -> Result<()> {
        let mut block = [0u8; 512];
        self.device.borrow_mut().read_block(device_block, &mut block)?;
        buf.copy_from_slice(&block);
        Ok(())
    }

    fn write_device_block(&mut self, device_block: u32, buf: &[u8]) -> Result<()> {
        let block: [u8; 512] = buf.try_into().map_err(|_| Error::InvalidArg("write buffer is not one block"))?;
        self.device.borrow_mut().write_block(device_block, &block)
    }

    fn fill_byte(&self) -> u8 {
        0
    }

    fn eof(&self) -> u64 {
        self.eof
    }

    fn set_eof(&mut self, eof: u64) {
        self.eof = eof;
    }

    /// Frees blocks from the tail down to (but not including) `index`,
    /// demoting the storage type when the remaining data fits a lower
    /// tier (spec §4.6 "truncation demotes and frees unreachable indices
    /// and data blocks").
    fn truncate_from(&mut self, index: u64) -> Result<()> {
        match self.storage_type {
            StorageType::Deleted => {}
            StorageType::Seedling => {
                if index == 0 {
                    self.free_device_block(self.key_pointer);
                    self.key_pointer = 0;
                }
            }
            StorageType::Sapling => {
                if self.key_pointer == 0 {
                    return Ok(());
                }
                let mut entries = self.read_index(self.key_pointer)?;
                for i in index.min(BLOCKS_PER_INDEX) as usize..256 {
                    if entries[i] != 0 {
                        self.free_device_block(entries[i]);
                        entries[i] = 0;
                    }
                }
                if index == 0 {
                    self.free_device_block(self.key_pointer);
                    self.key_pointer = 0;
                    self.storage_type = StorageType::Seedling;
                } else if index < BLOCKS_PER_INDEX {
                    self.write_index(self.key_pointer, &entries)?;
                    if index == 1 && entries[0] == 0 {
                        // only the seedling slot would remain and it's empty
                        self.free_device_block(self.key_pointer);
                        self.key_pointer = 0;
                        self.storage_type = StorageType::Seedling;
                    }
                }
            }
            StorageType::Tree => {
                if self.key_pointer == 0 {
                    return Ok(());
                }
                let mut master = self.read_index(self.key_pointer)?;
                let keep_segment = (index / BLOCKS_PER_INDEX) as usize;
                for segment in (keep_segment..256).rev() {
                    let sub_ptr = master[segment];
                    if sub_ptr == 0 {
                        continue;
                    }
                    let keep_from = if segment == keep_segment {
                        (index % BLOCKS_PER_INDEX) as usize
                    } else {
                        0
                    };
                    let mut sub = self.read_index(sub_ptr)?;
                    for slot in keep_from..256 {
                        if sub[slot] != 0 {
                            self.free_device_block(sub[slot]);
                            sub[slot] = 0;
                        }
                    }
                    if sub.iter().all(|b| *b == 0) {
                        self.free_device_block(sub_ptr);
                        master[segment] = 0;
                    } else {
                        self.write_index(sub_ptr, &sub)?;
                    }
                }
                if master.iter().all(|b| *b == 0) {
                    self.free_device_block(self.key_pointer);
                    self.key_pointer = 0;
                    self.storage_type = StorageType::Seedling;
                } else {
                    self.write_index(self.key_pointer, &master)?;
                }
            }
            other => {
                return Err(Error::structural(format!(
                    "fork storage type {other:?} does not support truncation"
                )))
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paleofs_core::MemoryDevice;

    fn storage(total_blocks: u32) -> ProdosForkStorage<MemoryDevice> {
        let device = Rc::new(RefCell::new(MemoryDevice::zeroed(total_blocks)));
        let bitmap = Rc::new(RefCell::new(ClumpBitmap::new(total_blocks, 4096)));
        ProdosForkStorage::new(device, bitmap, StorageType::Seedling, 0, 0, 0)
    }

    #[test]
    fn seedling_allocates_one_block() {
        let mut s = storage(16);
        let block = s.allocate_block(0).unwrap();
        assert_ne!(block, 0);
        assert_eq!(s.storage_type(), StorageType::Seedling);
    }

    #[test]
    fn growth_past_one_block_promotes_to_sapling() {
        let mut s = storage(16);
        s.allocate_block(0).unwrap();
        s.allocate_block(1).unwrap();
        assert_eq!(s.storage_type(), StorageType::Sapling);
        assert!(s.resolve_block(0).unwrap().is_some());
        assert!(s.resolve_block(1).unwrap().is_some());
    }

    #[test]
    fn growth_past_256_blocks_promotes_to_tree() {
        let mut s = storage(600);
        for i in 0..260u64 {
            s.allocate_block(i).unwrap();
        }
        assert_eq!(s.storage_type(), StorageType::Tree);
        for i in 0..260u64 {
            assert!(s.resolve_block(i).unwrap().is_some(), "block {i} missing");
        }
    }

    #[test]
    fn sparse_hole_in_sapling_has_no_block() {
        let mut s = storage(16);
        s.allocate_block(0).unwrap();
        s.allocate_block(5).unwrap();
        assert_eq!(s.storage_type(), StorageType::Sapling);
        assert!(s.resolve_block(2).unwrap().is_none());
    }

    #[test]
    fn truncate_sapling_to_seedling_frees_index_block() {
        let mut s = storage(16);
        s.allocate_block(0).unwrap();
        s.allocate_block(1).unwrap();
        let used_before = s.blocks_used();
        s.truncate_from(0).unwrap();
        assert_eq!(s.storage_type(), StorageType::Seedling);
        assert_eq!(s.key_pointer(), 0);
        assert!(s.blocks_used() < used_before);
    }
}
