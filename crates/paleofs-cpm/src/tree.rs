//! Allocation-block and directory-slot tracking plus the per-file
//! extent-chain storage model (spec §4.3, §4.7).
//!
//! Classic CP/M keeps no on-disk free-space bitmap: a BDOS rebuilds free
//! block/directory-slot state by scanning the directory at mount. This
//! mirrors that by keeping both as plain in-memory sets, rebuilt once by
//! `CpmVolume::mount` and shared with every open file the same way HFS and
//! ProDOS share a `ClumpBitmap`.
//!
//! Allocation-block pointers are absolute over the whole disk (directory
//! and data share one numbering), which is why `0` is safe to use as the
//! "no block" sentinel in an `ExtentRecord`: allocation block 0 always
//! belongs to the directory and a file can never legitimately point at it.

use std::cell::RefCell;
use std::rc::Rc;

use paleofs_core::descriptor::ForkStorage;
use paleofs_core::{ChunkDevice, Error, Result as CoreResult, BLOCK_SIZE};

use crate::extent::{
    ExtentRecord, FileId, ALLOC_BLOCK_SIZE, DELETED_USER, DIR_ENTRY_SIZE, RECORDS_PER_ALLOC_BLOCK,
    RECORDS_PER_EXTENT, RECORD_SIZE,
};

const DIR_ENTRIES_PER_ALLOC_BLOCK: u32 = (ALLOC_BLOCK_SIZE / DIR_ENTRY_SIZE) as u32;
const RECORDS_PER_DEVICE_BLOCK: u32 = (BLOCK_SIZE / RECORD_SIZE) as u32;

/// Host-supplied disk geometry. Real CP/M keeps this in a BIOS-resident
/// Disk Parameter Block rather than on the disk itself, so there is no
/// on-disk superblock to read it from.
#[derive(Debug, Clone, Copy)]
pub struct DiskParams {
    /// Number of 1-KB allocation blocks occupied by the directory, always
    /// starting at allocation block 0.
    pub dir_alloc_blocks: u32,
    /// Total 1-KB allocation blocks on the disk (directory + data).
    pub total_alloc_blocks: u32,
}

impl DiskParams {
    pub fn dir_entry_count(&self) -> u32 {
        self.dir_alloc_blocks * DIR_ENTRIES_PER_ALLOC_BLOCK
    }
}

/// A directory entry's physical location: the allocation block containing
/// it and its 32-byte slot index within that block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirLocation {
    pub alloc_block: u32,
    pub slot: usize,
}

/// In-memory free/used set over allocation blocks, rebuilt by scanning the
/// directory at mount (spec §4.3's "no persistent bitmap" case).
#[derive(Debug)]
pub struct BlockTracker {
    used: Vec<bool>,
}

impl BlockTracker {
    /// Blocks `[0, dir_alloc_blocks)` start pre-marked used: the directory
    /// never competes with file data for allocation.
    pub fn new(params: &DiskParams) -> Self {
        let mut used = vec![false; params.total_alloc_blocks as usize];
        for b in used.iter_mut().take(params.dir_alloc_blocks as usize) {
            *b = true;
        }
        Self { used }
    }

    pub fn mark_used(&mut self, block: u32) {
        if let Some(slot) = self.used.get_mut(block as usize) {
            *slot = true;
        }
    }

    pub fn is_used(&self, block: u32) -> bool {
        self.used.get(block as usize).copied().unwrap_or(true)
    }

    pub fn alloc_one(&mut self) -> CoreResult<u32> {
        for (i, used) in self.used.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return Ok(i as u32);
            }
        }
        Err(Error::DiskFull)
    }

    pub fn free_one(&mut self, block: u32) {
        if let Some(slot) = self.used.get_mut(block as usize) {
            *slot = false;
        }
    }
}

/// In-memory free/used set over directory slots, alongside `BlockTracker`.
#[derive(Debug)]
pub struct DirSlotTracker {
    used: Vec<bool>,
}

impl DirSlotTracker {
    pub fn new(params: &DiskParams) -> Self {
        Self {
            used: vec![false; params.dir_entry_count() as usize],
        }
    }

    pub fn mark_used(&mut self, slot: u32) {
        if let Some(s) = self.used.get_mut(slot as usize) {
            *s = true;
        }
    }

    pub fn alloc_one(&mut self) -> CoreResult<u32> {
        for (i, used) in self.used.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return Ok(i as u32);
            }
        }
        Err(Error::DiskFull)
    }

    pub fn free_one(&mut self, slot: u32) {
        if let Some(s) = self.used.get_mut(slot as usize) {
            *s = false;
        }
    }
}

pub fn slot_location(slot: u32) -> DirLocation {
    DirLocation {
        alloc_block: slot / DIR_ENTRIES_PER_ALLOC_BLOCK,
        slot: (slot % DIR_ENTRIES_PER_ALLOC_BLOCK) as usize,
    }
}

pub fn dir_slot_number(location: DirLocation) -> u32 {
    location.alloc_block * DIR_ENTRIES_PER_ALLOC_BLOCK + location.slot as u32
}

fn alloc_block_device_blocks(alloc_block: u32) -> (u32, u32) {
    (alloc_block * 2, alloc_block * 2 + 1)
}

pub fn read_dir_entry<D: ChunkDevice>(device: &mut D, location: DirLocation) -> CoreResult<ExtentRecord> {
    let byte_off = location.slot * DIR_ENTRY_SIZE;
    let (b0, b1) = alloc_block_device_blocks(location.alloc_block);
    let device_block = if byte_off < BLOCK_SIZE { b0 } else { b1 };
    let off_in_block = byte_off % BLOCK_SIZE;
    let mut buf = [0u8; BLOCK_SIZE];
    device.read_block(device_block, &mut buf)?;
    let mut entry = [0u8; DIR_ENTRY_SIZE];
    entry.copy_from_slice(&buf[off_in_block..off_in_block + DIR_ENTRY_SIZE]);
    Ok(ExtentRecord::parse(&entry))
}

pub fn write_dir_entry<D: ChunkDevice>(
    device: &mut D,
    location: DirLocation,
    record: &ExtentRecord,
) -> CoreResult<()> {
    let byte_off = location.slot * DIR_ENTRY_SIZE;
    let (b0, b1) = alloc_block_device_blocks(location.alloc_block);
    let device_block = if byte_off < BLOCK_SIZE { b0 } else { b1 };
    let off_in_block = byte_off % BLOCK_SIZE;
    let mut buf = [0u8; BLOCK_SIZE];
    device.read_block(device_block, &mut buf)?;
    buf[off_in_block..off_in_block + DIR_ENTRY_SIZE].copy_from_slice(&record.serialize());
    device.write_block(device_block, &buf)
}

/// Walks every directory slot, calling `visit` with each non-deleted
/// entry's location and parsed record. Used at mount to rebuild both
/// trackers and the volume's file listing from scratch.
pub fn scan_directory<D: ChunkDevice>(
    device: &mut D,
    params: &DiskParams,
    mut visit: impl FnMut(DirLocation, ExtentRecord),
) -> CoreResult<()> {
    for slot in 0..params.dir_entry_count() {
        let location = slot_location(slot);
        let record = read_dir_entry(device, location)?;
        if !record.is_deleted() {
            visit(location, record);
        }
    }
    Ok(())
}

fn record_to_device_block(record_number: u32) -> (u32, usize) {
    let device_block = record_number / RECORDS_PER_DEVICE_BLOCK;
    let offset = (record_number % RECORDS_PER_DEVICE_BLOCK) as usize * RECORD_SIZE;
    (device_block, offset)
}

struct ExtentSlot {
    location: DirLocation,
    record: ExtentRecord,
}

/// Per-file fork storage over the extent chain (spec §4.7). One instance
/// serves the single, unnamed data stream of one CP/M file; there is no
/// resource fork and no raw-partition mode in this format.
pub struct CpmForkStorage<D> {
    device: Rc<RefCell<D>>,
    blocks: Rc<RefCell<BlockTracker>>,
    dir_slots: Rc<RefCell<DirSlotTracker>>,
    id: FileId,
    extents: Vec<ExtentSlot>,
    eof: u64,
}

impl<D: ChunkDevice> CpmForkStorage<D> {
    pub fn new(
        device: Rc<RefCell<D>>,
        blocks: Rc<RefCell<BlockTracker>>,
        dir_slots: Rc<RefCell<DirSlotTracker>>,
        id: FileId,
        mut existing: Vec<(DirLocation, ExtentRecord)>,
        eof: u64,
    ) -> Self {
        existing.sort_by_key(|(_, r)| r.extent_number());
        let extents = existing
            .into_iter()
            .map(|(location, record)| ExtentSlot { location, record })
            .collect();
        Self {
            device,
            blocks,
            dir_slots,
            id,
            extents,
            eof,
        }
    }

    pub fn extent_count(&self) -> usize {
        self.extents.len()
    }

    fn extent_index(&self, extent_number: u32) -> Option<usize> {
        self.extents
            .iter()
            .position(|slot| slot.record.extent_number() == extent_number)
    }

    fn write_back(&mut self, index: usize) -> CoreResult<()> {
        let slot = &self.extents[index];
        let mut device = self.device.borrow_mut();
        write_dir_entry(&mut *device, slot.location, &slot.record)
    }
}

impl<D: ChunkDevice> ForkStorage for CpmForkStorage<D> {
    fn block_size(&self) -> usize {
        RECORD_SIZE
    }

    fn resolve_block(&mut self, index: u64) -> CoreResult<Option<u32>> {
        let extent_number = (index / RECORDS_PER_EXTENT as u64) as u32;
        let record_in_extent = (index % RECORDS_PER_EXTENT as u64) as u32;
        let Some(i) = self.extent_index(extent_number) else {
            return Ok(None);
        };
        let alloc_slot = (record_in_extent / RECORDS_PER_ALLOC_BLOCK as u32) as usize;
        let record_in_alloc = record_in_extent % RECORDS_PER_ALLOC_BLOCK as u32;
        let alloc_block = self.extents[i].record.blocks[alloc_slot] as u32;
        if alloc_block == 0 {
            return Ok(None);
        }
        Ok(Some(alloc_block * RECORDS_PER_ALLOC_BLOCK as u32 + record_in_alloc))
    }

    fn allocate_block(&mut self, index: u64) -> CoreResult<u32> {
        let extent_number = (index / RECORDS_PER_EXTENT as u64) as u32;
        let record_in_extent = (index % RECORDS_PER_EXTENT as u64) as u32;
        let alloc_slot = (record_in_extent / RECORDS_PER_ALLOC_BLOCK as u32) as usize;
        let record_in_alloc = record_in_extent % RECORDS_PER_ALLOC_BLOCK as u32;

        let i = match self.extent_index(extent_number) {
            Some(i) => i,
            None => {
                let dir_slot = self.dir_slots.borrow_mut().alloc_one()?;
                let location = slot_location(dir_slot);
                let record = ExtentRecord::new_for(self.id, extent_number);
                self.extents.push(ExtentSlot { location, record });
                self.extents.len() - 1
            }
        };

        let existing = self.extents[i].record.blocks[alloc_slot] as u32;
        let alloc_block = if existing != 0 {
            existing
        } else {
            self.blocks.borrow_mut().alloc_one()?
        };
        self.extents[i].record.blocks[alloc_slot] = alloc_block as u8;
        self.write_back(i)?;
        Ok(alloc_block * RECORDS_PER_ALLOC_BLOCK as u32 + record_in_alloc)
    }

    fn read_device_block(&mut self, device_block: u32, buf: &mut [u8]) -> CoreResult<()> {
        let (block, offset) = record_to_device_block(device_block);
        let mut raw = [0u8; BLOCK_SIZE];
        self.device.borrow_mut().read_block(block, &mut raw)?;
        buf.copy_from_slice(&raw[offset..offset + RECORD_SIZE]);
        Ok(())
    }

    fn write_device_block(&mut self, device_block: u32, buf: &[u8]) -> CoreResult<()> {
        let (block, offset) = record_to_device_block(device_block);
        let mut raw = [0u8; BLOCK_SIZE];
        let mut device = self.device.borrow_mut();
        device.read_block(block, &mut raw)?;
        raw[offset..offset + RECORD_SIZE].copy_from_slice(buf);
        device.write_block(block, &raw)
    }

    fn fill_byte(&self) -> u8 {
        0xE5
    }

    fn eof(&self) -> u64 {
        self.eof
    }

    fn set_eof(&mut self, eof: u64) {
        self.eof = eof;
    }

    fn truncate_from(&mut self, index: u64) -> CoreResult<()> {
        let mut to_remove = Vec::new();
        for i in 0..self.extents.len() {
            let extent_number = self.extents[i].record.extent_number() as u64;
            let extent_start = extent_number * RECORDS_PER_EXTENT as u64;
            if extent_start >= index {
                for b in self.extents[i].record.blocks {
                    if b != 0 {
                        self.blocks.borrow_mut().free_one(b as u32);
                    }
                }
                let mut deleted = self.extents[i].record;
                deleted.user = DELETED_USER;
                {
                    let mut device = self.device.borrow_mut();
                    write_dir_entry(&mut device, self.extents[i].location, &deleted)?;
                }
                self.dir_slots
                    .borrow_mut()
                    .free_one(dir_slot_number(self.extents[i].location));
                to_remove.push(i);
                continue;
            }
            let local_index = index - extent_start;
            let first_freed_alloc_slot = local_index.div_ceil(RECORDS_PER_ALLOC_BLOCK as u64) as usize;
            let mut changed = false;
            for slot in first_freed_alloc_slot..self.extents[i].record.blocks.len() {
                let b = self.extents[i].record.blocks[slot];
                if b != 0 {
                    self.blocks.borrow_mut().free_one(b as u32);
                    self.extents[i].record.blocks[slot] = 0;
                    changed = true;
                }
            }
            if changed {
                self.write_back(i)?;
            }
        }
        for i in to_remove.into_iter().rev() {
            self.extents.remove(i);
        }
        Ok(())
    }

    fn flush(&mut self) -> CoreResult<()> {
        let records_total = self.eof.div_ceil(RECORD_SIZE as u64);
        for i in 0..self.extents.len() {
            let extent_number = self.extents[i].record.extent_number() as u64;
            let extent_start = extent_number * RECORDS_PER_EXTENT as u64;
            let in_extent = records_total
                .saturating_sub(extent_start)
                .min(RECORDS_PER_EXTENT as u64) as u8;
            if self.extents[i].record.record_count != in_extent {
                self.extents[i].record.record_count = in_extent;
                self.write_back(i)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paleofs_core::MemoryDevice;

    fn params() -> DiskParams {
        DiskParams {
            dir_alloc_blocks: 1,
            total_alloc_blocks: 16,
        }
    }

    fn storage(p: DiskParams) -> CpmForkStorage<MemoryDevice> {
        let device = Rc::new(RefCell::new(MemoryDevice::zeroed(p.total_alloc_blocks * 2)));
        let blocks = Rc::new(RefCell::new(BlockTracker::new(&p)));
        let dir_slots = Rc::new(RefCell::new(DirSlotTracker::new(&p)));
        let id = FileId {
            user: 0,
            name: *b"HELLO   ",
            ext: *b"TXT",
        };
        CpmForkStorage::new(device, blocks, dir_slots, id, Vec::new(), 0)
    }

    fn write_at(fork: &mut CpmForkStorage<MemoryDevice>, record_index: u64, byte: u8) {
        let block = match fork.resolve_block(record_index).unwrap() {
            Some(b) => b,
            None => fork.allocate_block(record_index).unwrap(),
        };
        fork.write_device_block(block, &[byte; RECORD_SIZE]).unwrap();
    }

    #[test]
    fn write_past_one_extent_allocates_second_extent() {
        let p = params();
        let mut fork = storage(p);
        for i in 0..(RECORDS_PER_EXTENT as u64 + 1) {
            write_at(&mut fork, i, b'A');
        }
        fork.set_eof((RECORDS_PER_EXTENT as u64 + 1) * RECORD_SIZE as u64);
        fork.flush().unwrap();
        assert_eq!(fork.extent_count(), 2);
    }

    #[test]
    fn sparse_read_returns_0xe5_fill() {
        let p = params();
        let mut fork = storage(p);
        assert_eq!(fork.fill_byte(), 0xE5);
        assert!(fork.resolve_block(0).unwrap().is_none());
    }

    #[test]
    fn truncate_frees_allocation_blocks() {
        let p = params();
        let mut fork = storage(p);
        write_at(&mut fork, 0, b'A');
        write_at(&mut fork, 1, b'A');
        fork.set_eof(2 * RECORD_SIZE as u64);
        assert_eq!(fork.extent_count(), 1);
        let allocated_block = fork.extents[0].record.blocks[0] as u32;

        fork.truncate_from(0).unwrap();
        fork.set_eof(0);

        assert!(fork.extents.is_empty());
        assert!(!fork.blocks.borrow().is_used(allocated_block));
    }

    #[test]
    fn allocation_block_zero_never_assigned() {
        let p = params();
        let mut fork = storage(p);
        let block = fork.allocate_block(0).unwrap();
        assert!(block >= RECORDS_PER_ALLOC_BLOCK as u32);
    }
}
