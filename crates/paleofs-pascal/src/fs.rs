//! UCSD Pascal volume object: a flat directory over contiguous-range files
//! (spec §3 "Pascal entry", §4.8).
//!
//! There is no hierarchy and no bitmap. The directory blob doubles as the
//! free-space map: anything not covered by an occupied range is free, and
//! [`PascalVolume::defragment`] is the only operation that ever relocates
//! file data.

use std::cell::RefCell;
use std::rc::Rc;

use paleofs_core::arena::{Arena, EntryId};
use paleofs_core::descriptor::{FileDescriptor, Mode, OpenFileTable, Part};
use paleofs_core::entry::{Dubious, EntryFlags};
use paleofs_core::fsops::{check_file_access, AccessCheck, FsMode};
use paleofs_core::notes::Notes;
use paleofs_core::usage::VolumeUsageMap;
use paleofs_core::{ChunkDevice, Error, BLOCK_SIZE};

use crate::directory::{FileEntry, FileKind, DIR_BLOCKS, DIR_START_BLOCK, MAX_ENTRIES};
use crate::error::{PascalError, Result};
use crate::tree::{unused_entry, DirectoryState, PascalForkStorage};

/// The in-memory handle for a Pascal directory entry. `slot` indexes the
/// shared [`DirectoryState::entries`] vector directly — there is no
/// separate on-disk identity to decouple it from.
#[derive(Debug, Clone)]
pub struct PascalEntryRecord {
    pub slot: usize,
    pub flags: EntryFlags,
}

impl Dubious for PascalEntryRecord {
    fn add_conflict(&mut self) {
        self.flags.add_conflict();
    }
    fn is_dubious(&self) -> bool {
        self.flags.is_dubious()
    }
}

fn entry_eof(entry: &FileEntry) -> u64 {
    let blocks = entry.block_count();
    if blocks == 0 {
        return 0;
    }
    let last = if entry.bytes_in_last_block == 0 {
        BLOCK_SIZE as u64
    } else {
        entry.bytes_in_last_block as u64
    };
    (blocks as u64 - 1) * BLOCK_SIZE as u64 + last
}

pub struct PascalVolume<D: ChunkDevice> {
    dir: Rc<RefCell<DirectoryState<D>>>,
    entries: Arena<PascalEntryRecord, EntryId>,
    open_files: OpenFileTable,
    mode: FsMode,
    image_read_only: bool,
    notes: Notes,
}

impl<D: ChunkDevice> PascalVolume<D> {
    pub fn mount(device: Rc<RefCell<D>>, image_read_only: bool) -> Result<Self> {
        let dir = Rc::new(RefCell::new(DirectoryState::read(device)?));
        if dir.borrow().header.next_block <= dir.borrow().header.first_block {
            return Err(PascalError::BadVolumeHeader(DIR_START_BLOCK));
        }
        let mut entries = Arena::new();
        let slots: Vec<usize> = dir
            .borrow()
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_unused())
            .map(|(i, _)| i)
            .collect();
        for slot in slots {
            entries.insert(PascalEntryRecord {
                slot,
                flags: EntryFlags::new(),
            });
        }
        let mut notes = Notes::new();
        notes.info(format!(
            "mounted Pascal volume \"{}\" with {} files",
            dir.borrow().header.name(),
            entries.iter().count()
        ));
        Ok(Self {
            dir,
            entries,
            open_files: OpenFileTable::new(),
            mode: FsMode::FileAccess,
            image_read_only,
            notes,
        })
    }

    /// Seeds a fresh directory blob (empty entry table, reserved
    /// boot+directory range) and mounts it (spec §4.8 "format"). UCSD
    /// Pascal has no volume number or boot flag to record, so those
    /// parameters of spec §4.8's signature have nothing to write here.
    pub fn format(device: Rc<RefCell<D>>, vol_name: &str, volume_blocks: u16) -> Result<Self> {
        let mut header = crate::directory::VolumeHeader {
            first_block: 0,
            next_block: DIR_START_BLOCK as u16 + DIR_BLOCKS as u16,
            volume_name: [0; 8],
            volume_blocks,
            num_files: 0,
            last_boot_access: crate::time::PascalDate(0),
        };
        header.set_name(vol_name);
        {
            let mut dir = DirectoryState {
                device: device.clone(),
                header,
                entries: vec![unused_entry(); MAX_ENTRIES - 1],
            };
            dir.write_all()?;
        }
        Self::mount(device, false)
    }

    pub fn notes(&self) -> &Notes {
        &self.notes
    }

    pub fn mode(&self) -> FsMode {
        self.mode
    }

    /// spec §4.8's "volume directory entry".
    pub fn get_vol_dir_entry(&self) -> crate::directory::VolumeHeader {
        self.dir.borrow().header
    }

    /// Transitions into file-access mode (spec §4.8's Raw→FileAccess leg).
    pub fn prepare_file_access(&mut self) -> Result<()> {
        if self.mode == FsMode::Disposed {
            return Err(PascalError::Core(Error::Disposed));
        }
        self.mode = FsMode::FileAccess;
        Ok(())
    }

    /// Transitions into raw-block mode; refuses while any fork is open
    /// (spec §4.8's FileAccess→Raw leg).
    pub fn prepare_raw_access(&mut self) -> Result<()> {
        if self.mode == FsMode::Disposed {
            return Err(PascalError::Core(Error::Disposed));
        }
        if !self.open_files.is_empty() {
            return Err(PascalError::Core(Error::structural(
                "cannot drop to raw access with forks still open",
            )));
        }
        self.mode = FsMode::Raw;
        Ok(())
    }

    /// No-op: `create_file`/`delete_file`/`defragment` already call
    /// `DirectoryState::write_all` synchronously, so there is no batched
    /// state left to commit (spec §4.8 "flush").
    pub fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Always fails: a Pascal file has a single unnamed data range, no
    /// resource fork (spec §4.8 "add_rsrc_fork").
    pub fn add_rsrc_fork(&mut self, _entry: EntryId) -> Result<()> {
        Err(PascalError::Core(Error::InvalidArg(
            "UCSD Pascal has no resource forks",
        )))
    }

    /// Renames an entry in place (spec §4.8 "move_file" — UCSD Pascal's
    /// flat directory has no hierarchy to reparent into, so only the name
    /// half of the operation applies).
    pub fn move_file(&mut self, entry: EntryId, new_name: &str) -> Result<()> {
        if self.image_read_only {
            return Err(PascalError::Core(Error::ReadOnly));
        }
        if self.find_entry(new_name).is_some() {
            return Err(PascalError::DuplicateName(new_name.to_string()));
        }
        let slot = self.entries.get(entry)?.slot;
        {
            let mut dir = self.dir.borrow_mut();
            dir.entries[slot].set_name(new_name);
            dir.write_all()?;
        }
        Ok(())
    }

    /// Flushes and gates the volume shut — the terminal transition of
    /// spec §4.8's lifecycle.
    pub fn close_all(&mut self) -> Result<()> {
        self.flush()?;
        self.open_files = OpenFileTable::new();
        self.mode = FsMode::Disposed;
        Ok(())
    }

    pub fn volume_name(&self) -> String {
        self.dir.borrow().header.name()
    }

    pub fn list_files(&self) -> Vec<(EntryId, String)> {
        self.entries
            .iter()
            .map(|(key, record)| (key, self.dir.borrow().entries[record.slot].name()))
            .collect()
    }

    fn find_entry(&self, name: &str) -> Option<EntryId> {
        self.entries
            .iter()
            .find(|(_, record)| self.dir.borrow().entries[record.slot].name() == name)
            .map(|(key, _)| key)
    }

    pub fn create_file(&mut self, name: &str, kind: FileKind, initial_blocks: u32) -> Result<EntryId> {
        if self.image_read_only {
            return Err(PascalError::Core(Error::ReadOnly));
        }
        if self.find_entry(name).is_some() {
            return Err(PascalError::DuplicateName(name.to_string()));
        }
        let min_blocks = initial_blocks.max(1);
        let (start, _) = {
            let dir = self.dir.borrow();
            dir.find_free_range(min_blocks)
                .ok_or(PascalError::NoContiguousSpace(min_blocks))?
        };
        let slot = {
            let dir = self.dir.borrow();
            dir.find_unused_slot().ok_or(PascalError::Corrupt("directory full"))?
        };

        let mut entry = unused_entry();
        entry.first_block = start as u16;
        entry.next_block = (start + min_blocks) as u16;
        entry.kind = kind;
        entry.set_name(name);
        {
            let mut dir = self.dir.borrow_mut();
            dir.entries[slot] = entry;
            dir.header.num_files += 1;
            dir.write_all()?;
        }
        Ok(self.entries.insert(PascalEntryRecord {
            slot,
            flags: EntryFlags::new(),
        }))
    }

    pub fn delete_file(&mut self, entry: EntryId) -> Result<()> {
        if self.image_read_only {
            return Err(PascalError::Core(Error::ReadOnly));
        }
        let record = self.entries.get(entry)?;
        let slot = record.slot;
        {
            let mut dir = self.dir.borrow_mut();
            dir.entries[slot] = unused_entry();
            dir.header.num_files = dir.header.num_files.saturating_sub(1);
            dir.write_all()?;
        }
        self.entries.remove(entry)?;
        Ok(())
    }

    pub fn open_fork(
        &mut self,
        entry: EntryId,
        mode: Mode,
    ) -> Result<FileDescriptor<PascalForkStorage<D>>> {
        let record = self.entries.get(entry)?;
        let check = AccessCheck {
            fs_mode: self.mode,
            image_read_only: self.image_read_only,
            entry_flags: &record.flags,
            want_write: mode == Mode::ReadWrite,
            entry_belongs_to_this_fs: true,
        };
        check_file_access(&check)?;
        self.open_files.try_acquire(entry, Part::DataFork, mode)?;

        let slot = record.slot;
        let (first_block, block_count, eof) = {
            let dir = self.dir.borrow();
            let e = &dir.entries[slot];
            (e.first_block as u32, e.block_count(), entry_eof(e))
        };
        let storage = PascalForkStorage::new(self.dir.clone(), slot, first_block, block_count, eof);
        Ok(FileDescriptor::new(entry, Part::DataFork, mode, storage))
    }

    pub fn release_fork(&mut self, entry: EntryId, mode: Mode) {
        self.open_files.release(entry, Part::DataFork, mode);
    }

    /// Compacts every file's range toward the start of the volume,
    /// preserving relative order, eliminating every gap between them
    /// (spec §3, Scenario F). A call over an already-compact volume makes
    /// no device writes at all.
    pub fn defragment(&mut self) -> Result<()> {
        let mut dir = self.dir.borrow_mut();
        let reserved_end = dir.header.next_block as u32;

        let mut slots: Vec<usize> = (0..dir.entries.len())
            .filter(|&i| !dir.entries[i].is_unused())
            .collect();
        slots.sort_by_key(|&i| dir.entries[i].first_block);

        let mut cursor = reserved_end;
        let mut moves: Vec<(usize, u32, u32)> = Vec::new();
        for &slot in &slots {
            let entry = &dir.entries[slot];
            let len = entry.block_count();
            if entry.first_block as u32 != cursor {
                moves.push((slot, entry.first_block as u32, cursor));
            }
            cursor += len;
        }

        if moves.is_empty() {
            return Ok(());
        }

        for &(slot, old_start, new_start) in &moves {
            let len = dir.entries[slot].block_count();
            for i in 0..len {
                let mut buf = [0u8; BLOCK_SIZE];
                dir.device.borrow_mut().read_block(old_start + i, &mut buf)?;
                dir.device.borrow_mut().write_block(new_start + i, &buf)?;
            }
            dir.entries[slot].first_block = new_start as u16;
            dir.entries[slot].next_block = (new_start + len) as u16;
        }
        dir.write_all()?;
        self.notes.info(format!("defragmented {} files", moves.len()));
        Ok(())
    }

    /// Re-walks the directory, checking that every file's range lies
    /// within the volume and that no two files overlap (spec §4.2).
    pub fn scan_and_verify(&mut self) -> Result<VolumeUsageMap> {
        let dir = self.dir.borrow();
        let mut usage = VolumeUsageMap::new(dir.header.volume_blocks as usize);
        for b in dir.header.first_block as u32..dir.header.next_block as u32 {
            usage.mark_in_use(b);
        }
        let ids: Vec<(EntryId, usize)> = self
            .entries
            .iter()
            .map(|(key, record)| (key, record.slot))
            .collect();
        drop(dir);

        let mut conflicted: Vec<EntryId> = Vec::new();
        for (key, slot) in ids {
            let (first_block, block_count) = {
                let dir = self.dir.borrow();
                let e = &dir.entries[slot];
                (e.first_block as u32, e.block_count())
            };
            let before = usage.conflicts().len();
            for b in first_block..first_block + block_count {
                usage.alloc_chunk(b, key);
            }
            if usage.conflicts().len() > before {
                conflicted.push(key);
            }
        }
        for key in conflicted {
            if let Ok(record) = self.entries.get_mut(key) {
                record.add_conflict();
            }
        }
        if !usage.conflicts().is_empty() {
            self.notes.warning(format!(
                "{} block conflicts found during scan",
                usage.conflicts().len()
            ));
        }
        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paleofs_core::descriptor::SeekOrigin;
    use paleofs_core::MemoryDevice;

    fn mount_fresh(volume_blocks: u16) -> PascalVolume<MemoryDevice> {
        let device = Rc::new(RefCell::new(MemoryDevice::zeroed(volume_blocks as u32)));
        {
            let mut dev = device.borrow_mut();
            let mut header = crate::directory::VolumeHeader {
                first_block: 0,
                next_block: DIR_START_BLOCK as u16 + DIR_BLOCKS as u16,
                volume_name: [0; 8],
                volume_blocks,
                num_files: 0,
                last_boot_access: crate::time::PascalDate(0),
            };
            header.set_name("MYDISK");
            let mut blob = vec![0u8; DIR_BLOCKS as usize * BLOCK_SIZE];
            blob[0..26].copy_from_slice(&header.serialize());
            for i in 1..MAX_ENTRIES {
                let off = i * 26;
                if off + 26 <= blob.len() {
                    blob[off..off + 26].copy_from_slice(&unused_entry().serialize());
                }
            }
            for i in 0..DIR_BLOCKS {
                let off = i as usize * BLOCK_SIZE;
                let mut buf = [0u8; BLOCK_SIZE];
                buf.copy_from_slice(&blob[off..off + BLOCK_SIZE]);
                dev.write_block(DIR_START_BLOCK + i, &buf).unwrap();
            }
        }
        PascalVolume::mount(device, false).unwrap()
    }

    #[test]
    fn create_list_and_write_round_trip() {
        let mut vol = mount_fresh(40);
        let entry = vol.create_file("HELLO.TEXT", FileKind::Text, 2).unwrap();
        assert_eq!(vol.list_files().len(), 1);

        let mut fd = vol.open_fork(entry, Mode::ReadWrite).unwrap();
        fd.write(b"hi there").unwrap();
        fd.flush().unwrap();
        fd.seek(0, SeekOrigin::Begin).unwrap();
        let mut buf = [0u8; 8];
        fd.read(&mut buf).unwrap();
        assert_eq!(&buf, b"hi there");
        fd.invalidate();
        vol.release_fork(entry, Mode::ReadWrite);
    }

    #[test]
    fn create_rejects_duplicate_name() {
        let mut vol = mount_fresh(40);
        vol.create_file("HELLO.TEXT", FileKind::Text, 1).unwrap();
        assert!(matches!(
            vol.create_file("HELLO.TEXT", FileKind::Text, 1),
            Err(PascalError::DuplicateName(_))
        ));
    }

    #[test]
    fn defragment_is_idempotent() {
        let mut vol = mount_fresh(40);
        let a = vol.create_file("A.TEXT", FileKind::Text, 2).unwrap();
        let b = vol.create_file("B.TEXT", FileKind::Text, 2).unwrap();
        vol.delete_file(a).unwrap();
        let c = vol.create_file("C.TEXT", FileKind::Text, 1).unwrap();
        let _ = b;
        let _ = c;

        vol.defragment().unwrap();
        let snapshot_one: Vec<FileEntry> = vol.dir.borrow().entries.clone();

        vol.defragment().unwrap();
        let snapshot_two: Vec<FileEntry> = vol.dir.borrow().entries.clone();

        for (x, y) in snapshot_one.iter().zip(snapshot_two.iter()) {
            assert_eq!(x.first_block, y.first_block);
            assert_eq!(x.next_block, y.next_block);
        }
    }

    #[test]
    fn delete_frees_range_for_reuse() {
        let mut vol = mount_fresh(40);
        let entry = vol.create_file("BYE.TEXT", FileKind::Text, 3).unwrap();
        vol.delete_file(entry).unwrap();
        let reused = vol.create_file("AGAIN.TEXT", FileKind::Text, 3).unwrap();
        assert_eq!(vol.list_files().len(), 1);
        let _ = reused;
    }

    #[test]
    fn move_file_renames_entry() {
        let mut vol = mount_fresh(40);
        let entry = vol.create_file("OLD.TEXT", FileKind::Text, 1).unwrap();
        vol.move_file(entry, "NEW.TEXT").unwrap();
        let files = vol.list_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].1, "NEW.TEXT");
    }

    #[test]
    fn format_then_mount_round_trips_through_close_all() {
        let device = Rc::new(RefCell::new(MemoryDevice::zeroed(40)));
        let mut vol = PascalVolume::format(device, "FORMATTED", 40).unwrap();
        vol.create_file("DOC.TEXT", FileKind::Text, 1).unwrap();
        assert_eq!(vol.get_vol_dir_entry().num_files, 1);
        vol.close_all().unwrap();
        assert_eq!(vol.mode(), FsMode::Disposed);
    }
}
