//! The ProDOS volume object: volume-directory-driven mount, linked
//! directory block traversal, fork storage, growth allocation, and the
//! scan-and-verify pass (spec §4).

use std::cell::RefCell;
use std::rc::Rc;

use paleofs_core::arena::{Arena, EntryId};
use paleofs_core::bitmap::{ClumpBitmap, Extent as AllocExtent};
use paleofs_core::descriptor::{FileDescriptor, ForkStorage, Mode, OpenFileTable, Part};
use paleofs_core::entry::{Dubious, EntryFlags};
use paleofs_core::fsops::{check_file_access, AccessCheck, FsMode};
use paleofs_core::notes::Notes;
use paleofs_core::usage::VolumeUsageMap;
use paleofs_core::{AccessLevel, ChunkDevice, GatedDevice};

use crate::directory::{
    entries, write_block, BlockLinks, FileEntry, StorageType, SubdirHeader, VolumeHeader,
    ENTRIES_PER_BLOCK, ENTRY_LENGTH, VOLUME_DIR_BLOCK,
};
use crate::error::ProdosError;
use crate::extended::{ExtendedKeyBlock, ForkDescriptor};
use crate::tree::ProdosForkStorage;

/// Where a directory entry physically lives: a fixed directory block
/// number and its slot within that block's 13 entries. The block number
/// never changes once allocated, so this is a stable handle even though
/// ProDOS directories have no analogue of HFS's CNID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    pub block: u32,
    pub slot: usize,
}

/// In-memory handle to a directory entry, keyed by [`EntryId`] for the
/// generation-checked arena (spec §9).
pub struct EntryRecord {
    pub location: EntryLocation,
    /// Key block of the directory this entry's slot lives in — needed to
    /// find the right header (volume or subdirectory) to adjust `file_count`
    /// against on delete/move, since a slot's own block isn't necessarily
    /// the directory's key block once its chain has grown past one block.
    pub dir_key_block: u32,
    pub name: String,
    pub is_directory: bool,
    pub flags: EntryFlags,
}

impl Dubious for EntryRecord {
    fn add_conflict(&mut self) {
        self.flags.add_conflict();
    }
    fn is_dubious(&self) -> bool {
        self.flags.is_dubious()
    }
}

/// How a fork's storage-type/key-pointer/blocks-used/eof quadruplet gets
/// written back to disk after `flush()`. A plain file entry stores these
/// fields directly; an `Extended` (GS/OS two-fork) file keeps them inside
/// its key block's fork descriptor instead (spec §3 "extended info
/// block").
enum Writeback {
    Entry(EntryLocation),
    ExtendedData { key_block: u32 },
    ExtendedRsrc { key_block: u32 },
}

fn read_block_raw<D: ChunkDevice>(device: &Rc<RefCell<D>>, block: u32) -> Result<[u8; 512], ProdosError> {
    let mut raw = [0u8; 512];
    device
        .borrow_mut()
        .read_block(block, &mut raw)
        .map_err(paleofs_core::Error::from)?;
    Ok(raw)
}

fn write_block_raw<D: ChunkDevice>(device: &Rc<RefCell<D>>, block: u32, raw: &[u8; 512]) -> Result<(), ProdosError> {
    device
        .borrow_mut()
        .write_block(block, raw)
        .map_err(paleofs_core::Error::from)?;
    Ok(())
}

/// Persists a fork's post-write storage state to wherever it is recorded
/// on disk, matching spec §4.7's "write contract" that a descriptor's
/// `flush` commits growth back to the owning entry.
fn commit_writeback<D: ChunkDevice>(
    device: &Rc<RefCell<D>>,
    writeback: &Writeback,
    storage_type: StorageType,
    key_pointer: u16,
    blocks_used: u32,
    eof: u64,
) -> Result<(), ProdosError> {
    match writeback {
        Writeback::Entry(loc) => {
            let mut raw = read_block_raw(device, loc.block)?;
            let (links, mut records) = entries(&raw);
            let mut entry = FileEntry::parse(&records[loc.slot]);
            entry.storage_type = storage_type;
            entry.key_pointer = key_pointer;
            entry.blocks_used = blocks_used as u16;
            entry.eof = eof as u32;
            records[loc.slot] = entry.serialize();
            raw = write_block(links, &records);
            write_block_raw(device, loc.block, &raw)?;
        }
        Writeback::ExtendedData { key_block } | Writeback::ExtendedRsrc { key_block } => {
            let raw = read_block_raw(device, *key_block)?;
            let mut xkb = ExtendedKeyBlock::parse(&raw);
            let descriptor = ForkDescriptor {
                storage_type: storage_type.to_nibble(),
                key_pointer,
                blocks_used: blocks_used as u16,
                eof: eof as u32,
            };
            match writeback {
                Writeback::ExtendedData { .. } => xkb.data = descriptor,
                Writeback::ExtendedRsrc { .. } => xkb.rsrc = descriptor,
                Writeback::Entry(_) => unreachable!(),
            }
            write_block_raw(device, *key_block, &xkb.serialize())?;
        }
    }
    Ok(())
}

/// Wraps [`ProdosForkStorage`] with a writeback hook so that closing or
/// flushing a descriptor commits the (possibly promoted) storage type,
/// key pointer, block count, and EOF back to the entry that owns it.
pub struct WritebackForkStorage<D: ChunkDevice> {
    device: Rc<RefCell<D>>,
    inner: ProdosForkStorage<D>,
    writeback: Writeback,
}

impl<D: ChunkDevice> ForkStorage for WritebackForkStorage<D> {
    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn resolve_block(&mut self, index: u64) -> Result<Option<u32>, paleofs_core::Error> {
        self.inner.resolve_block(index)
    }

    fn allocate_block(&mut self, index: u64) -> Result<u32, paleofs_core::Error> {
        self.inner.allocate_block(index)
    }

    fn read_device_block(&mut self, device_block: u32, buf: &mut [u8]) -> Result<(), paleofs_core::Error> {
        self.inner.read_device_block(device_block, buf)
    }

    fn write_device_block(&mut self, device_block: u32, buf: &[u8]) -> Result<(), paleofs_core::Error> {
        self.inner.write_device_block(device_block, buf)
    }

    fn fill_byte(&self) -> u8 {
        self.inner.fill_byte()
    }

    fn eof(&self) -> u64 {
        self.inner.eof()
    }

    fn set_eof(&mut self, eof: u64) {
        self.inner.set_eof(eof)
    }

    fn truncate_from(&mut self, index: u64) -> Result<(), paleofs_core::Error> {
        self.inner.truncate_from(index)
    }

    fn flush(&mut self) -> Result<(), paleofs_core::Error> {
        self.inner.flush()?;
        commit_writeback(
            &self.device,
            &self.writeback,
            self.inner.storage_type(),
            self.inner.key_pointer(),
            self.inner.blocks_used(),
            self.inner.eof(),
        )
        .map_err(paleofs_core::Error::from)
    }
}

pub struct ProdosVolume<D: ChunkDevice> {
    device: Rc<RefCell<D>>,
    bitmap: Rc<RefCell<ClumpBitmap>>,
    header: VolumeHeader,
    entries: Arena<EntryRecord, EntryId>,
    open_files: OpenFileTable,
    mode: FsMode,
    image_read_only: bool,
    notes: Notes,
}

impl<D: ChunkDevice> ProdosVolume<D> {
    fn mount_over(device: D, image_read_only: bool) -> Result<Self, ProdosError> {
        let device = Rc::new(RefCell::new(device));
        let raw = read_block_raw(&device, VOLUME_DIR_BLOCK)?;
        let (_, records) = entries(&raw);
        let header = VolumeHeader::parse(&records[0])?;

        let bitmap = Rc::new(RefCell::new(read_volume_bitmap(
            &mut *device.borrow_mut(),
            header.bit_map_pointer as u32,
            header.total_blocks as u32,
        )?));

        let mut notes = Notes::new();
        if header.entry_length as usize != ENTRY_LENGTH || header.entries_per_block as usize != ENTRIES_PER_BLOCK {
            notes.warning("volume directory entry geometry differs from the standard 39-byte/13-entry layout");
        }

        Ok(Self {
            device,
            bitmap,
            header,
            entries: Arena::new(),
            open_files: OpenFileTable::new(),
            mode: FsMode::FileAccess,
            image_read_only,
            notes,
        })
    }

    /// Formats a disk image from scratch: writes the volume header and an
    /// all-free allocation bitmap, reserving the header and bitmap blocks
    /// themselves (spec §4.8 "format"). `vol_num` is accepted for parity
    /// with the other three formats' `format()` but unused — ProDOS has no
    /// volume-number field. `bootable` is likewise accepted but a no-op:
    /// writing boot blocks 0-1 is out of scope here.
    fn format_over(
        device: D,
        vol_name: &str,
        _vol_num: u8,
        _bootable: bool,
        total_blocks: u32,
    ) -> Result<Self, ProdosError> {
        let device = Rc::new(RefCell::new(device));
        let bit_map_pointer: u16 = 6;
        let blocks_needed = total_blocks.div_ceil(4096).max(1);
        let reserved = bit_map_pointer as u32 + blocks_needed;
        if total_blocks <= reserved {
            return Err(ProdosError::Corrupt("volume too small to format"));
        }

        let header = VolumeHeader {
            volume_name: vol_name.to_string(),
            creation: crate::time::ProdosTime::default(),
            access: 0xE3,
            entry_length: ENTRY_LENGTH as u8,
            entries_per_block: ENTRIES_PER_BLOCK as u8,
            file_count: 0,
            bit_map_pointer,
            total_blocks: total_blocks as u16,
        };
        let mut records = [[0u8; ENTRY_LENGTH]; ENTRIES_PER_BLOCK];
        records[0] = header.serialize();
        let raw = write_block(BlockLinks::default(), &records);
        write_block_raw(&device, VOLUME_DIR_BLOCK, &raw)?;

        let mut bitmap = ClumpBitmap::new(total_blocks, 4096);
        for b in 0..reserved {
            bitmap.mark_used(b);
        }
        write_volume_bitmap(&device, &bitmap, bit_map_pointer as u32)?;

        Ok(Self {
            device,
            bitmap: Rc::new(RefCell::new(bitmap)),
            header,
            entries: Arena::new(),
            open_files: OpenFileTable::new(),
            mode: FsMode::FileAccess,
            image_read_only: false,
            notes: Notes::new(),
        })
    }

    pub fn notes(&self) -> &Notes {
        &self.notes
    }

    pub fn header(&self) -> &VolumeHeader {
        &self.header
    }

    pub fn mode(&self) -> FsMode {
        self.mode
    }

    /// Walks the linked chain of directory blocks starting at `first_block`,
    /// yielding every non-deleted, non-header entry with its physical
    /// location (spec §4.6 "directory blocks linked forward/backward").
    fn walk_directory(&mut self, first_block: u32) -> Result<Vec<(EntryLocation, FileEntry)>, ProdosError> {
        let mut out = Vec::new();
        let mut block = first_block;
        let mut guard = 0;
        while block != 0 {
            guard += 1;
            if guard > 65536 {
                return Err(ProdosError::Corrupt("directory block chain did not terminate"));
            }
            let raw = read_block_raw(&self.device, block)?;
            let (links, records) = entries(&raw);
            let start_slot = if block == first_block { 1 } else { 0 };
            for (slot, record) in records.iter().enumerate().skip(start_slot) {
                let entry = FileEntry::parse(record);
                if entry.is_deleted() {
                    continue;
                }
                out.push((EntryLocation { block, slot }, entry));
            }
            block = links.next_block as u32;
        }
        Ok(out)
    }

    /// Lists the entries of the directory whose key block is
    /// `dir_key_block` (pass [`crate::directory::VOLUME_DIR_BLOCK`] for the
    /// root).
    pub fn list_children(&mut self, dir_key_block: u32) -> Result<Vec<(String, FileEntry)>, ProdosError> {
        Ok(self
            .walk_directory(dir_key_block)?
            .into_iter()
            .map(|(_, entry)| (entry.name.clone(), entry))
            .collect())
    }

    /// Finds the first deleted (or never-used, all-zero) slot across a
    /// directory's block chain, growing the chain by one block if every
    /// existing block is full (spec §4.6).
    fn find_free_slot(&mut self, dir_key_block: u32) -> Result<EntryLocation, ProdosError> {
        let mut block = dir_key_block;
        let mut last_block = dir_key_block;
        let mut guard = 0;
        loop {
            guard += 1;
            if guard > 65536 {
                return Err(ProdosError::Corrupt("directory block chain did not terminate"));
            }
            let raw = read_block_raw(&self.device, block)?;
            let (links, records) = entries(&raw);
            let start_slot = if block == dir_key_block { 1 } else { 0 };
            for slot in start_slot..ENTRIES_PER_BLOCK {
                if FileEntry::parse(&records[slot]).is_deleted() {
                    return Ok(EntryLocation { block, slot });
                }
            }
            last_block = block;
            if links.next_block == 0 {
                break;
            }
            block = links.next_block as u32;
        }

        let new_block = self.alloc_raw_block(last_block + 1)?;
        let records = [[0u8; ENTRY_LENGTH]; ENTRIES_PER_BLOCK];
        let raw = write_block(BlockLinks { prev_block: last_block as u16, next_block: 0 }, &records);
        write_block_raw(&self.device, new_block, &raw)?;

        let mut prev_raw = read_block_raw(&self.device, last_block)?;
        let (mut links, records) = entries(&prev_raw);
        links.next_block = new_block as u16;
        prev_raw = write_block(links, &records);
        write_block_raw(&self.device, last_block, &prev_raw)?;

        Ok(EntryLocation { block: new_block, slot: 0 })
    }

    fn alloc_raw_block(&mut self, near: u32) -> Result<u32, ProdosError> {
        let granted = self
            .bitmap
            .borrow_mut()
            .alloc_blocks(1, near)
            .map_err(paleofs_core::Error::from)?;
        Ok(granted.start)
    }

    /// Creates a new file or subdirectory entry under `dir_key_block`
    /// (spec §4.6). Subdirectories get their own key block seeded with a
    /// [`SubdirHeader`] pointing back to the new entry.
    pub fn create_entry(
        &mut self,
        dir_key_block: u32,
        name: &str,
        file_type: u8,
        is_directory: bool,
    ) -> Result<EntryLocation, ProdosError> {
        if self.image_read_only {
            return Err(ProdosError::Core(paleofs_core::Error::ReadOnly));
        }
        if self
            .walk_directory(dir_key_block)?
            .iter()
            .any(|(_, e)| e.name.eq_ignore_ascii_case(name))
        {
            return Err(ProdosError::DuplicateName(name.to_string()));
        }

        let location = self.find_free_slot(dir_key_block)?;
        let mut entry = FileEntry {
            name: name.to_string(),
            file_type,
            ..Default::default()
        };

        if is_directory {
            let subdir_block = self.alloc_raw_block(location.block + 1)?;
            entry.storage_type = StorageType::Directory;
            entry.key_pointer = subdir_block as u16;
            entry.blocks_used = 1;
            let header = SubdirHeader {
                dir_name: name.to_string(),
                creation: entry.creation,
                access: entry.access,
                entry_length: ENTRY_LENGTH as u8,
                entries_per_block: ENTRIES_PER_BLOCK as u8,
                file_count: 0,
                parent_pointer: location.block as u16,
                parent_entry_number: location.slot as u8 + 1,
                parent_entry_length: ENTRY_LENGTH as u8,
            };
            let mut records = [[0u8; ENTRY_LENGTH]; ENTRIES_PER_BLOCK];
            records[0] = header.serialize();
            let raw = write_block(BlockLinks::default(), &records);
            write_block_raw(&self.device, subdir_block, &raw)?;
        } else {
            entry.storage_type = StorageType::Seedling;
        }

        let mut raw = read_block_raw(&self.device, location.block)?;
        let (links, mut records) = entries(&raw);
        records[location.slot] = entry.serialize();
        raw = write_block(links, &records);
        write_block_raw(&self.device, location.block, &raw)?;
        self.adjust_directory_file_count(dir_key_block, 1)?;
        Ok(location)
    }

    /// Adjusts the `file_count` field of whichever header entry owns
    /// `dir_key_block` (the volume header for the root, a
    /// [`SubdirHeader`] otherwise) by `delta`, persisting it back to disk.
    fn adjust_directory_file_count(&mut self, dir_key_block: u32, delta: i32) -> Result<(), ProdosError> {
        if dir_key_block == VOLUME_DIR_BLOCK {
            self.header.file_count = (self.header.file_count as i32 + delta).max(0) as u16;
            let mut raw = read_block_raw(&self.device, VOLUME_DIR_BLOCK)?;
            let (links, mut records) = entries(&raw);
            records[0] = self.header.serialize();
            raw = write_block(links, &records);
            write_block_raw(&self.device, VOLUME_DIR_BLOCK, &raw)?;
        } else {
            let mut raw = read_block_raw(&self.device, dir_key_block)?;
            let (links, mut records) = entries(&raw);
            let mut header = SubdirHeader::parse(&records[0])?;
            header.file_count = (header.file_count as i32 + delta).max(0) as u16;
            records[0] = header.serialize();
            raw = write_block(links, &records);
            write_block_raw(&self.device, dir_key_block, &raw)?;
        }
        Ok(())
    }

    /// Opens one fork of the file at `location` for reading or writing.
    /// `Part::RawData` is rejected: ProDOS forks are addressed as
    /// `DataFork`/`RsrcFork`, the resource fork only existing on
    /// [`StorageType::Extended`] entries.
    pub fn open_fork(
        &mut self,
        entry: EntryId,
        location: EntryLocation,
        part: Part,
        mode: Mode,
    ) -> Result<FileDescriptor<WritebackForkStorage<D>>, ProdosError> {
        let entry_flags = self
            .entries
            .get(entry)
            .map(|e| e.flags)
            .map_err(paleofs_core::Error::from)?;
        check_file_access(&AccessCheck {
            fs_mode: self.mode,
            image_read_only: self.image_read_only,
            entry_flags: &entry_flags,
            want_write: mode == Mode::ReadWrite,
            entry_belongs_to_this_fs: true,
        })
        .map_err(ProdosError::from)?;
        self.open_files
            .try_acquire(entry, part, mode)
            .map_err(ProdosError::from)?;

        let raw = read_block_raw(&self.device, location.block)?;
        let (_, records) = entries(&raw);
        let file_entry = FileEntry::parse(&records[location.slot]);

        let (storage_type, key_pointer, blocks_used, eof, writeback) = match (part, file_entry.storage_type) {
            (Part::DataFork, StorageType::Extended) => {
                let xkb = ExtendedKeyBlock::parse(&read_block_raw(&self.device, file_entry.key_pointer as u32)?);
                (
                    xkb.data.storage_kind(),
                    xkb.data.key_pointer,
                    xkb.data.blocks_used as u32,
                    xkb.data.eof as u64,
                    Writeback::ExtendedData { key_block: file_entry.key_pointer as u32 },
                )
            }
            (Part::RsrcFork, StorageType::Extended) => {
                let xkb = ExtendedKeyBlock::parse(&read_block_raw(&self.device, file_entry.key_pointer as u32)?);
                (
                    xkb.rsrc.storage_kind(),
                    xkb.rsrc.key_pointer,
                    xkb.rsrc.blocks_used as u32,
                    xkb.rsrc.eof as u64,
                    Writeback::ExtendedRsrc { key_block: file_entry.key_pointer as u32 },
                )
            }
            (Part::RsrcFork, _) => {
                return Err(ProdosError::Core(paleofs_core::Error::InvalidArg(
                    "resource fork is only valid on an extended (GS/OS) entry",
                )))
            }
            (Part::DataFork, st) => (
                st,
                file_entry.key_pointer,
                file_entry.blocks_used as u32,
                file_entry.eof as u64,
                Writeback::Entry(location),
            ),
            (Part::RawData, _) => {
                return Err(ProdosError::Core(paleofs_core::Error::InvalidArg(
                    "ProDOS forks are opened as DataFork or RsrcFork, not RawData",
                )))
            }
        };

        let inner = ProdosForkStorage::new(
            self.device.clone(),
            self.bitmap.clone(),
            storage_type,
            key_pointer,
            blocks_used,
            eof,
        );
        let storage = WritebackForkStorage { device: self.device.clone(), inner, writeback };
        Ok(FileDescriptor::new(entry, part, mode, storage))
    }

    pub fn release_fork(&mut self, entry: EntryId, part: Part, mode: Mode) {
        self.open_files.release(entry, part, mode);
    }

    pub fn register_entry(
        &mut self,
        dir_key_block: u32,
        location: EntryLocation,
        name: String,
        is_directory: bool,
    ) -> EntryId {
        self.entries.insert(EntryRecord {
            location,
            dir_key_block,
            name,
            is_directory,
            flags: EntryFlags::new(),
        })
    }

    /// Returns the volume directory's own header entry, spec §4.8's
    /// "volume directory entry".
    pub fn get_vol_dir_entry(&self) -> &VolumeHeader {
        &self.header
    }

    /// Deletes a file entry: frees its fork's allocation-block ladder
    /// (both forks, for an extended entry), marks its directory slot
    /// deleted, and decrements the owning directory's `file_count` (spec
    /// §4.8). Only removes files — ProDOS directories need their own
    /// children emptied first, which is out of scope here.
    pub fn delete_file(&mut self, entry: EntryId) -> Result<(), ProdosError> {
        if self.image_read_only {
            return Err(ProdosError::Core(paleofs_core::Error::ReadOnly));
        }
        let (location, dir_key_block, entry_flags, is_directory) = {
            let rec = self.entries.get(entry).map_err(paleofs_core::Error::from)?;
            (rec.location, rec.dir_key_block, rec.flags, rec.is_directory)
        };
        if is_directory {
            return Err(ProdosError::Corrupt("delete_file does not remove directories"));
        }
        check_file_access(&AccessCheck {
            fs_mode: self.mode,
            image_read_only: self.image_read_only,
            entry_flags: &entry_flags,
            want_write: true,
            entry_belongs_to_this_fs: true,
        })
        .map_err(ProdosError::from)?;

        let raw = read_block_raw(&self.device, location.block)?;
        let (links, mut records) = entries(&raw);
        let file_entry = FileEntry::parse(&records[location.slot]);

        if file_entry.storage_type == StorageType::Extended {
            let xkb = ExtendedKeyBlock::parse(&read_block_raw(&self.device, file_entry.key_pointer as u32)?);
            self.free_fork_descriptor(&xkb.data)?;
            self.free_fork_descriptor(&xkb.rsrc)?;
            self.bitmap
                .borrow_mut()
                .release_blocks(AllocExtent { start: file_entry.key_pointer as u32, count: 1 });
        } else {
            self.free_fork_descriptor(&ForkDescriptor {
                storage_type: file_entry.storage_type.to_nibble(),
                key_pointer: file_entry.key_pointer,
                blocks_used: file_entry.blocks_used,
                eof: file_entry.eof,
            })?;
        }

        records[location.slot] = FileEntry::default().serialize();
        let raw = write_block(links, &records);
        write_block_raw(&self.device, location.block, &raw)?;

        self.adjust_directory_file_count(dir_key_block, -1)?;
        self.entries.remove(entry).map_err(paleofs_core::Error::from)?;
        Ok(())
    }

    /// Frees every block a fork descriptor's storage-type ladder owns
    /// (index blocks included), mirroring `ProdosForkStorage::truncate_from(0)`
    /// without needing a live descriptor around the fork.
    fn free_fork_descriptor(&mut self, fork: &ForkDescriptor) -> Result<(), ProdosError> {
        match fork.storage_kind() {
            StorageType::Seedling => {
                if fork.key_pointer != 0 {
                    self.bitmap
                        .borrow_mut()
                        .release_blocks(AllocExtent { start: fork.key_pointer as u32, count: 1 });
                }
            }
            StorageType::Sapling => {
                if fork.key_pointer == 0 {
                    return Ok(());
                }
                let raw = read_block_raw(&self.device, fork.key_pointer as u32)?;
                for b in crate::tree::index_entries(&raw) {
                    if b != 0 {
                        self.bitmap.borrow_mut().release_blocks(AllocExtent { start: b as u32, count: 1 });
                    }
                }
                self.bitmap
                    .borrow_mut()
                    .release_blocks(AllocExtent { start: fork.key_pointer as u32, count: 1 });
            }
            StorageType::Tree => {
                if fork.key_pointer == 0 {
                    return Ok(());
                }
                let master_raw = read_block_raw(&self.device, fork.key_pointer as u32)?;
                for sub_ptr in crate::tree::index_entries(&master_raw) {
                    if sub_ptr == 0 {
                        continue;
                    }
                    let sub_raw = read_block_raw(&self.device, sub_ptr as u32)?;
                    for b in crate::tree::index_entries(&sub_raw) {
                        if b != 0 {
                            self.bitmap.borrow_mut().release_blocks(AllocExtent { start: b as u32, count: 1 });
                        }
                    }
                    self.bitmap.borrow_mut().release_blocks(AllocExtent { start: sub_ptr as u32, count: 1 });
                }
                self.bitmap
                    .borrow_mut()
                    .release_blocks(AllocExtent { start: fork.key_pointer as u32, count: 1 });
            }
            _ => {}
        }
        Ok(())
    }

    /// Relocates and/or renames a file or directory: moves its entry
    /// record into a free slot under the new parent directory, deletes
    /// the old slot, fixes up a moved subdirectory's own back-pointer to
    /// its parent entry, and adjusts both parents' `file_count` (spec
    /// §4.8 "move_file").
    pub fn move_file(&mut self, entry: EntryId, new_parent_key_block: u32, new_name: &str) -> Result<(), ProdosError> {
        if self.image_read_only {
            return Err(ProdosError::Core(paleofs_core::Error::ReadOnly));
        }
        let (old_location, old_dir_key_block) = {
            let rec = self.entries.get(entry).map_err(paleofs_core::Error::from)?;
            (rec.location, rec.dir_key_block)
        };
        if self
            .walk_directory(new_parent_key_block)?
            .iter()
            .any(|(_, e)| e.name.eq_ignore_ascii_case(new_name))
        {
            return Err(ProdosError::DuplicateName(new_name.to_string()));
        }

        let mut raw = read_block_raw(&self.device, old_location.block)?;
        let (links, mut records) = entries(&raw);
        let mut file_entry = FileEntry::parse(&records[old_location.slot]);
        file_entry.name = new_name.to_string();
        records[old_location.slot] = FileEntry::default().serialize();
        raw = write_block(links, &records);
        write_block_raw(&self.device, old_location.block, &raw)?;

        let new_location = self.find_free_slot(new_parent_key_block)?;
        let mut new_raw = read_block_raw(&self.device, new_location.block)?;
        let (new_links, mut new_records) = entries(&new_raw);
        new_records[new_location.slot] = file_entry.serialize();
        new_raw = write_block(new_links, &new_records);
        write_block_raw(&self.device, new_location.block, &new_raw)?;

        if file_entry.storage_type == StorageType::Directory {
            let mut sub_raw = read_block_raw(&self.device, file_entry.key_pointer as u32)?;
            let (sub_links, mut sub_records) = entries(&sub_raw);
            let mut sub_header = SubdirHeader::parse(&sub_records[0])?;
            sub_header.parent_pointer = new_location.block as u16;
            sub_header.parent_entry_number = new_location.slot as u8 + 1;
            sub_records[0] = sub_header.serialize();
            sub_raw = write_block(sub_links, &sub_records);
            write_block_raw(&self.device, file_entry.key_pointer as u32, &sub_raw)?;
        }

        if old_dir_key_block != new_parent_key_block {
            self.adjust_directory_file_count(old_dir_key_block, -1)?;
            self.adjust_directory_file_count(new_parent_key_block, 1)?;
        }
        if let Ok(rec) = self.entries.get_mut(entry) {
            rec.location = new_location;
            rec.dir_key_block = new_parent_key_block;
            rec.name = new_name.to_string();
        }
        Ok(())
    }

    /// Promotes a plain (single-fork) entry to an extended (GS/OS
    /// two-fork) entry: allocates its key block and moves the existing
    /// data fork's descriptor into it (spec §4.8 "add_rsrc_fork").
    pub fn add_rsrc_fork(&mut self, entry: EntryId) -> Result<(), ProdosError> {
        if self.image_read_only {
            return Err(ProdosError::Core(paleofs_core::Error::ReadOnly));
        }
        let location = {
            let rec = self.entries.get(entry).map_err(paleofs_core::Error::from)?;
            if rec.is_directory {
                return Err(ProdosError::Corrupt("add_rsrc_fork called on a directory entry"));
            }
            rec.location
        };
        let mut raw = read_block_raw(&self.device, location.block)?;
        let (links, mut records) = entries(&raw);
        let mut file_entry = FileEntry::parse(&records[location.slot]);
        if file_entry.storage_type == StorageType::Extended {
            return Ok(());
        }

        let key_block = self.alloc_raw_block(location.block + 1)?;
        let xkb = ExtendedKeyBlock {
            data: ForkDescriptor {
                storage_type: file_entry.storage_type.to_nibble(),
                key_pointer: file_entry.key_pointer,
                blocks_used: file_entry.blocks_used,
                eof: file_entry.eof,
            },
            rsrc: ForkDescriptor::default(),
            finder_info: None,
        };
        write_block_raw(&self.device, key_block, &xkb.serialize())?;

        file_entry.storage_type = StorageType::Extended;
        file_entry.key_pointer = key_block as u16;
        file_entry.blocks_used = xkb.blocks_used();
        records[location.slot] = file_entry.serialize();
        raw = write_block(links, &records);
        write_block_raw(&self.device, location.block, &raw)?;
        Ok(())
    }

    /// Transitions into file-access mode (spec §4.8's Raw→FileAccess leg).
    pub fn prepare_file_access(&mut self) -> Result<(), ProdosError> {
        if self.mode == FsMode::Disposed {
            return Err(ProdosError::Core(paleofs_core::Error::Disposed));
        }
        self.mode = FsMode::FileAccess;
        Ok(())
    }

    /// Transitions into raw-block mode; refuses while any fork is open
    /// (spec §4.8's FileAccess→Raw leg).
    pub fn prepare_raw_access(&mut self) -> Result<(), ProdosError> {
        if self.mode == FsMode::Disposed {
            return Err(ProdosError::Core(paleofs_core::Error::Disposed));
        }
        if !self.open_files.is_empty() {
            return Err(ProdosError::Core(paleofs_core::Error::structural(
                "cannot drop to raw access with forks still open",
            )));
        }
        self.mode = FsMode::Raw;
        Ok(())
    }

    /// Commits the allocation bitmap back to disk (spec §4.8 "flush"). The
    /// volume and subdirectory headers are already written synchronously
    /// by every mutating call, so the bitmap is the only batched state.
    pub fn flush(&mut self) -> Result<(), ProdosError> {
        if self.image_read_only {
            return Ok(());
        }
        let bitmap = self.bitmap.borrow();
        write_volume_bitmap(&self.device, &bitmap, self.header.bit_map_pointer as u32)
    }

    /// Walks every directory transitively from the root, cross-referencing
    /// allocated blocks against the volume bitmap (spec §4.2, §8 property
    /// 13: `blocks_used` must equal the sum of the fork's actual extent
    /// footprint).
    pub fn scan_and_verify(&mut self) -> Result<VolumeUsageMap, ProdosError> {
        let mut usage = VolumeUsageMap::new(self.bitmap.borrow().len() as usize);
        usage.mark_in_use(VOLUME_DIR_BLOCK);
        let bitmap_blocks = (self.header.total_blocks as u32).div_ceil(4096).max(1);
        for b in self.header.bit_map_pointer as u32..self.header.bit_map_pointer as u32 + bitmap_blocks {
            usage.mark_in_use(b);
        }

        let mut stack = vec![VOLUME_DIR_BLOCK];
        while let Some(dir_block) = stack.pop() {
            let mut block = dir_block;
            loop {
                usage.mark_in_use(block);
                let raw = match read_block_raw(&self.device, block) {
                    Ok(raw) => raw,
                    Err(_) => {
                        self.notes.error("failed to read directory block during scan");
                        break;
                    }
                };
                let (links, records) = entries(&raw);
                let start_slot = if block == dir_block { 1 } else { 0 };
                for (slot, record) in records.iter().enumerate().skip(start_slot) {
                    let entry = FileEntry::parse(record);
                    if entry.is_deleted() {
                        continue;
                    }
                    let entry_id = self.entries.insert(EntryRecord {
                        location: EntryLocation { block, slot },
                        dir_key_block: dir_block,
                        name: entry.name.clone(),
                        is_directory: entry.storage_type.is_directory_like(),
                        flags: EntryFlags::new(),
                    });
                    if entry.storage_type.is_directory_like() {
                        stack.push(entry.key_pointer as u32);
                    } else {
                        self.mark_fork_blocks(&mut usage, entry_id, &entry)?;
                    }
                }
                if links.next_block == 0 {
                    break;
                }
                block = links.next_block as u32;
            }
        }

        if !usage.conflicts().is_empty() {
            self.notes
                .warning(format!("{} chunk ownership conflicts found during scan", usage.conflicts().len()));
        }
        Ok(usage)
    }

    fn mark_fork_blocks(
        &mut self,
        usage: &mut VolumeUsageMap,
        entry_id: EntryId,
        entry: &FileEntry,
    ) -> Result<(), ProdosError> {
        if entry.storage_type == StorageType::Extended {
            usage.alloc_chunk(entry.key_pointer as u32, entry_id);
            let xkb = ExtendedKeyBlock::parse(&read_block_raw(&self.device, entry.key_pointer as u32)?);
            self.mark_fork_descriptor(usage, entry_id, &xkb.data)?;
            self.mark_fork_descriptor(usage, entry_id, &xkb.rsrc)?;
            return Ok(());
        }
        self.mark_fork_descriptor(
            usage,
            entry_id,
            &ForkDescriptor {
                storage_type: entry.storage_type.to_nibble(),
                key_pointer: entry.key_pointer,
                blocks_used: entry.blocks_used,
                eof: entry.eof,
            },
        )
    }

    fn mark_fork_descriptor(
        &mut self,
        usage: &mut VolumeUsageMap,
        entry_id: EntryId,
        fork: &ForkDescriptor,
    ) -> Result<(), ProdosError> {
        match fork.storage_kind() {
            StorageType::Seedling => {
                if fork.key_pointer != 0 {
                    usage.alloc_chunk(fork.key_pointer as u32, entry_id);
                }
            }
            StorageType::Sapling => {
                if fork.key_pointer == 0 {
                    return Ok(());
                }
                usage.alloc_chunk(fork.key_pointer as u32, entry_id);
                let raw = read_block_raw(&self.device, fork.key_pointer as u32)?;
                for b in crate::tree::index_entries(&raw) {
                    if b != 0 {
                        usage.alloc_chunk(b as u32, entry_id);
                    }
                }
            }
            StorageType::Tree => {
                if fork.key_pointer == 0 {
                    return Ok(());
                }
                usage.alloc_chunk(fork.key_pointer as u32, entry_id);
                let master_raw = read_block_raw(&self.device, fork.key_pointer as u32)?;
                for sub_ptr in crate::tree::index_entries(&master_raw) {
                    if sub_ptr == 0 {
                        continue;
                    }
                    usage.alloc_chunk(sub_ptr as u32, entry_id);
                    let sub_raw = read_block_raw(&self.device, sub_ptr as u32)?;
                    for b in crate::tree::index_entries(&sub_raw) {
                        if b != 0 {
                            usage.alloc_chunk(b as u32, entry_id);
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl<D: ChunkDevice> ProdosVolume<GatedDevice<D>> {
    /// Mounts a raw device behind a [`GatedDevice`], enforcing spec §4.1's
    /// access-level gate on every block read/write the volume performs —
    /// `Closed` until the bootstrap header/bitmap reads below, then
    /// `ReadOnly` or `Open` depending on `image_read_only`.
    pub fn mount(device: D, image_read_only: bool) -> Result<Self, ProdosError> {
        let mut gated = GatedDevice::new(device);
        gated.set_level(AccessLevel::Open);
        let mut volume = ProdosVolume::mount_over(gated, image_read_only)?;
        volume.device.borrow_mut().set_level(if image_read_only {
            AccessLevel::ReadOnly
        } else {
            AccessLevel::Open
        });
        Ok(volume)
    }

    /// Formats a fresh device behind a [`GatedDevice`], same gating story
    /// as `mount` (spec §4.8 "format").
    pub fn format(
        device: D,
        vol_name: &str,
        vol_num: u8,
        bootable: bool,
        total_blocks: u32,
    ) -> Result<Self, ProdosError> {
        let mut gated = GatedDevice::new(device);
        gated.set_level(AccessLevel::Open);
        let mut volume = ProdosVolume::format_over(gated, vol_name, vol_num, bootable, total_blocks)?;
        volume.device.borrow_mut().set_level(AccessLevel::Open);
        Ok(volume)
    }

    /// Flushes, drops every open-file bookkeeping entry, and gates the
    /// device shut — the terminal FileAccess/Raw→Disposed transition of
    /// spec §4.8's lifecycle. A caller's own still-held `FileDescriptor`s
    /// keep working until they explicitly `flush`/`invalidate`; this only
    /// guarantees no *new* volume operation succeeds afterward.
    pub fn close_all(&mut self) -> Result<(), ProdosError> {
        self.flush()?;
        self.open_files = OpenFileTable::new();
        self.mode = FsMode::Disposed;
        self.device.borrow_mut().set_level(AccessLevel::Closed);
        Ok(())
    }

    /// Reclaims the raw device once every fork has been closed.
    pub fn into_device(self) -> D {
        let cell = Rc::try_unwrap(self.device)
            .ok()
            .expect("device still shared by an open fork");
        cell.into_inner().into_inner()
    }
}

/// Reads the volume bitmap starting at `bit_map_pointer`, inverting
/// ProDOS's on-disk polarity (bit clear ⇒ in use) into `ClumpBitmap`'s
/// uniform "true == in use" convention.
fn read_volume_bitmap<D: ChunkDevice>(
    device: &mut D,
    bit_map_pointer: u32,
    total_blocks: u32,
) -> Result<ClumpBitmap, ProdosError> {
    let blocks_needed = total_blocks.div_ceil(4096).max(1);
    let mut raw = vec![0u8; blocks_needed as usize * 512];
    for i in 0..blocks_needed {
        let mut block = [0u8; 512];
        device
            .read_block(bit_map_pointer + i, &mut block)
            .map_err(paleofs_core::Error::from)?;
        raw[i as usize * 512..(i as usize + 1) * 512].copy_from_slice(&block);
    }
    let mut bits = Vec::with_capacity(total_blocks as usize);
    for i in 0..total_blocks {
        let byte = raw[(i / 8) as usize];
        bits.push(byte & (0x80 >> (i % 8)) == 0);
    }
    Ok(ClumpBitmap::from_bits(bits, 4096))
}

/// Serializes the current bitmap back to its on-disk blocks, restoring
/// ProDOS's inverted polarity.
pub fn write_volume_bitmap<D: ChunkDevice>(
    device: &Rc<RefCell<D>>,
    bitmap: &ClumpBitmap,
    bit_map_pointer: u32,
) -> Result<(), ProdosError> {
    let total_blocks = bitmap.len();
    let blocks_needed = total_blocks.div_ceil(4096).max(1);
    let mut raw = vec![0xFFu8; blocks_needed as usize * 512];
    for i in 0..total_blocks {
        if bitmap.is_used(i) {
            let byte = (i / 8) as usize;
            raw[byte] &= !(0x80 >> (i % 8));
        }
    }
    for i in 0..blocks_needed {
        let block: [u8; 512] = raw[i as usize * 512..(i as usize + 1) * 512].try_into().unwrap();
        write_block_raw(device, bit_map_pointer + i, &block)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ENTRY_LENGTH;
    use crate::time::ProdosTime;
    use paleofs_core::MemoryDevice;

    /// Builds a minimal formatted volume: block 2 holds the volume header
    /// entry (no other entries yet), bitmap starting at block 6, total
    /// device size `total_blocks`.
    fn format_volume(total_blocks: u32) -> MemoryDevice {
        let bit_map_pointer = 6u16;
        let mut device = MemoryDevice::zeroed(total_blocks);

        let header = VolumeHeader {
            volume_name: "TESTVOL".into(),
            creation: ProdosTime::default(),
            access: 0xE3,
            entry_length: ENTRY_LENGTH as u8,
            entries_per_block: ENTRIES_PER_BLOCK as u8,
            file_count: 0,
            bit_map_pointer,
            total_blocks: total_blocks as u16,
        };
        let mut records = [[0u8; ENTRY_LENGTH]; ENTRIES_PER_BLOCK];
        records[0] = header.serialize();
        let raw = write_block(BlockLinks::default(), &records);
        device.write_block(VOLUME_DIR_BLOCK, &raw).unwrap();

        // Blocks 0..bit_map_pointer + bitmap blocks are reserved/in-use;
        // ProDOS stores "in use" as a clear bit.
        let blocks_needed = (total_blocks as u32).div_ceil(4096).max(1);
        let mut bitmap_block = [0xFFu8; 512];
        let reserved = bit_map_pointer as u32 + blocks_needed;
        for i in 0..reserved {
            bitmap_block[(i / 8) as usize] &= !(0x80 >> (i % 8));
        }
        device.write_block(bit_map_pointer as u32, &bitmap_block).unwrap();

        device
    }

    #[test]
    fn mount_reads_volume_header() {
        let device = format_volume(280);
        let volume = ProdosVolume::mount(device, false).unwrap();
        assert_eq!(volume.header().volume_name, "TESTVOL");
        assert!(volume.notes().is_empty());
    }

    #[test]
    fn create_entry_appears_in_listing() {
        let device = format_volume(280);
        let mut volume = ProdosVolume::mount(device, false).unwrap();
        volume.create_entry(VOLUME_DIR_BLOCK, "HELLO.TXT", 0x04, false).unwrap();
        let children = volume.list_children(VOLUME_DIR_BLOCK).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].0, "HELLO.TXT");
    }

    #[test]
    fn create_entry_rejects_duplicate_name() {
        let device = format_volume(280);
        let mut volume = ProdosVolume::mount(device, false).unwrap();
        volume.create_entry(VOLUME_DIR_BLOCK, "DUP", 0x04, false).unwrap();
        let err = volume.create_entry(VOLUME_DIR_BLOCK, "DUP", 0x04, false).unwrap_err();
        assert!(matches!(err, ProdosError::DuplicateName(_)));
    }

    #[test]
    fn create_subdirectory_seeds_header_block() {
        let device = format_volume(280);
        let mut volume = ProdosVolume::mount(device, false).unwrap();
        let loc = volume.create_entry(VOLUME_DIR_BLOCK, "DOCS", 0x0F, true).unwrap();
        let subdir_block = volume.entries_test_key_pointer(loc);
        let raw = read_block_raw(&volume.device, subdir_block).unwrap();
        let (_, records) = entries(&raw);
        let header = SubdirHeader::parse(&records[0]).unwrap();
        assert_eq!(header.dir_name, "DOCS");
        assert_eq!(header.parent_pointer, VOLUME_DIR_BLOCK);
    }

    impl<D: ChunkDevice> ProdosVolume<D> {
        fn entries_test_key_pointer(&mut self, location: EntryLocation) -> u32 {
            let raw = read_block_raw(&self.device, location.block).unwrap();
            let (_, records) = entries(&raw);
            FileEntry::parse(&records[location.slot]).key_pointer as u32
        }
    }

    #[test]
    fn fork_write_flush_and_reopen_round_trips_through_directory() {
        let device = format_volume(280);
        let mut volume = ProdosVolume::mount(device, false).unwrap();
        let location = volume.create_entry(VOLUME_DIR_BLOCK, "MEMO", 0x04, false).unwrap();
        let entry = volume.register_entry(VOLUME_DIR_BLOCK, location, "MEMO".to_string(), false);

        {
            let mut fd = volume.open_fork(entry, location, Part::DataFork, Mode::ReadWrite).unwrap();
            fd.write(b"hello prodos").unwrap();
            fd.flush().unwrap();
            fd.invalidate();
        }
        volume.release_fork(entry, Part::DataFork, Mode::ReadWrite);

        let mut fd = volume.open_fork(entry, location, Part::DataFork, Mode::ReadOnly).unwrap();
        assert_eq!(fd.eof(), 12);
        let mut buf = [0u8; 12];
        fd.read(&mut buf).unwrap();
        assert_eq!(&buf, b"hello prodos");
        fd.invalidate();
        volume.release_fork(entry, Part::DataFork, Mode::ReadOnly);
    }

    #[test]
    fn delete_file_frees_blocks_and_drops_file_count() {
        let device = format_volume(280);
        let mut volume = ProdosVolume::mount(device, false).unwrap();
        let sub_loc = volume.create_entry(VOLUME_DIR_BLOCK, "DOCS", 0x0F, true).unwrap();
        let sub_block = volume.entries_test_key_pointer(sub_loc);

        let location = volume.create_entry(sub_block, "MEMO", 0x04, false).unwrap();
        let entry = volume.register_entry(sub_block, location, "MEMO".to_string(), false);
        {
            let mut fd = volume.open_fork(entry, location, Part::DataFork, Mode::ReadWrite).unwrap();
            fd.write(b"junk").unwrap();
            fd.flush().unwrap();
            fd.invalidate();
        }
        volume.release_fork(entry, Part::DataFork, Mode::ReadWrite);

        volume.delete_file(entry).unwrap();
        let raw = read_block_raw(&volume.device, sub_block).unwrap();
        let (_, records) = entries(&raw);
        let header = SubdirHeader::parse(&records[0]).unwrap();
        assert_eq!(header.file_count, 0);
        assert!(volume.list_children(sub_block).unwrap().is_empty());
    }

    #[test]
    fn format_then_mount_round_trips_through_close_all() {
        let device = MemoryDevice::zeroed(280);
        let mut volume = ProdosVolume::format(device, "FORMATTED", 1, false, 280).unwrap();
        volume.create_entry(VOLUME_DIR_BLOCK, "DOC", 0x04, false).unwrap();
        assert_eq!(volume.get_vol_dir_entry().file_count, 1);
        volume.close_all().unwrap();
        assert_eq!(volume.mode(), FsMode::Disposed);

        let raw = volume.into_device();
        let mut reopened = ProdosVolume::mount(raw, false).unwrap();
        let children = reopened.list_children(VOLUME_DIR_BLOCK).unwrap();
        assert_eq!(children[0].0, "DOC");
    }
}
