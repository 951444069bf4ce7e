//! CP/M volume object: a flat, user-number-partitioned namespace over the
//! extent-chain storage model (spec §3, §4.8).
//!
//! Unlike HFS/ProDOS, CP/M has no on-disk identity stronger than (user,
//! name, extension) — an [`EntryId`] here is purely an in-memory handle
//! minted at mount/create time, never a value stored on disk.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use paleofs_core::arena::{Arena, EntryId};
use paleofs_core::descriptor::{FileDescriptor, Mode, OpenFileTable, Part};
use paleofs_core::entry::{Dubious, EntryFlags};
use paleofs_core::fsops::{check_file_access, AccessCheck, FsMode};
use paleofs_core::notes::Notes;
use paleofs_core::usage::VolumeUsageMap;
use paleofs_core::{ChunkDevice, Error};

use crate::error::{CpmError, Result};
use crate::extent::{ExtentRecord, FileId, DELETED_USER, RECORDS_PER_EXTENT, RECORD_SIZE};
use crate::tree::{
    dir_slot_number, scan_directory, slot_location, write_dir_entry, BlockTracker, CpmForkStorage,
    DirLocation, DirSlotTracker, DiskParams,
};

/// The in-memory entry a [`CpmVolume`] tracks per distinct file identity.
/// Carries no extent data itself — every operation re-reads the current
/// directory state for the file's `id`, so a concurrent grow/truncate is
/// always reflected rather than risking a stale cached extent list.
#[derive(Debug, Clone)]
pub struct CpmEntryRecord {
    pub id: FileId,
    pub flags: EntryFlags,
}

impl Dubious for CpmEntryRecord {
    fn add_conflict(&mut self) {
        self.flags.add_conflict();
    }
    fn is_dubious(&self) -> bool {
        self.flags.is_dubious()
    }
}

fn parse_name(name: &str) -> Result<([u8; 8], [u8; 3])> {
    let (base, ext) = match name.split_once('.') {
        Some((b, e)) => (b, e),
        None => (name, ""),
    };
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return Err(CpmError::Core(Error::InvalidName(name.to_string())));
    }
    if !base.chars().chain(ext.chars()).all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err(CpmError::Core(Error::InvalidName(name.to_string())));
    }
    let mut name_bytes = [0x20u8; 8];
    for (i, c) in base.to_ascii_uppercase().bytes().enumerate() {
        name_bytes[i] = c;
    }
    let mut ext_bytes = [0x20u8; 3];
    for (i, c) in ext.to_ascii_uppercase().bytes().enumerate() {
        ext_bytes[i] = c;
    }
    Ok((name_bytes, ext_bytes))
}

fn compute_eof(extents: &[(DirLocation, ExtentRecord)]) -> u64 {
    extents
        .iter()
        .map(|(_, r)| {
            r.extent_number() as u64 * RECORDS_PER_EXTENT as u64 * RECORD_SIZE as u64
                + r.claimed_bytes()
        })
        .max()
        .unwrap_or(0)
}

/// What spec §4.8's "volume directory entry" means for a format with no
/// on-disk volume label: the parameters that shape the directory itself.
#[derive(Debug, Clone, Copy)]
pub struct CpmVolumeInfo {
    pub dir_alloc_blocks: u32,
    pub total_alloc_blocks: u32,
    pub file_count: usize,
}

pub struct CpmVolume<D: ChunkDevice> {
    device: Rc<RefCell<D>>,
    blocks: Rc<RefCell<BlockTracker>>,
    dir_slots: Rc<RefCell<DirSlotTracker>>,
    params: DiskParams,
    entries: Arena<CpmEntryRecord, EntryId>,
    open_files: OpenFileTable,
    mode: FsMode,
    image_read_only: bool,
    notes: Notes,
}

impl<D: ChunkDevice> CpmVolume<D> {
    pub fn mount(device: Rc<RefCell<D>>, params: DiskParams, image_read_only: bool) -> Result<Self> {
        let blocks = Rc::new(RefCell::new(BlockTracker::new(&params)));
        let dir_slots = Rc::new(RefCell::new(DirSlotTracker::new(&params)));
        let mut seen: HashMap<FileId, ()> = HashMap::new();
        {
            let mut dev = device.borrow_mut();
            scan_directory(&mut *dev, &params, |location, record| {
                dir_slots.borrow_mut().mark_used(dir_slot_number(location));
                for b in record.blocks {
                    if b != 0 {
                        blocks.borrow_mut().mark_used(b as u32);
                    }
                }
                seen.insert(record.id(), ());
            })?;
        }
        let mut entries = Arena::new();
        for id in seen.into_keys() {
            entries.insert(CpmEntryRecord {
                id,
                flags: EntryFlags::new(),
            });
        }
        let mut notes = Notes::new();
        notes.info(format!("mounted CP/M volume with {} files", entries.iter().count()));
        Ok(Self {
            device,
            blocks,
            dir_slots,
            params,
            entries,
            open_files: OpenFileTable::new(),
            mode: FsMode::FileAccess,
            image_read_only,
            notes,
        })
    }

    /// Fills every directory block with deleted (`0xE5`) entries and
    /// returns a freshly mounted, empty volume (spec §4.8 "format"). CP/M
    /// has no volume name, volume number, or boot flag to record, so
    /// those parameters of spec §4.8's signature have nothing to write.
    pub fn format(device: Rc<RefCell<D>>, params: DiskParams) -> Result<Self> {
        {
            let mut dev = device.borrow_mut();
            let blk = [0xE5u8; 512];
            let device_blocks = params.dir_alloc_blocks * (crate::extent::ALLOC_BLOCK_SIZE as u32 / 512);
            for b in 0..device_blocks {
                dev.write_block(b, &blk)?;
            }
        }
        Self::mount(device, params, false)
    }

    pub fn notes(&self) -> &Notes {
        &self.notes
    }

    pub fn mode(&self) -> FsMode {
        self.mode
    }

    /// spec §4.8's "volume directory entry" — CP/M has no on-disk volume
    /// label, so this surfaces the directory-shaping parameters instead.
    pub fn get_vol_dir_entry(&self) -> CpmVolumeInfo {
        CpmVolumeInfo {
            dir_alloc_blocks: self.params.dir_alloc_blocks,
            total_alloc_blocks: self.params.total_alloc_blocks,
            file_count: self.entries.iter().count(),
        }
    }

    /// Transitions into file-access mode (spec §4.8's Raw→FileAccess leg).
    pub fn prepare_file_access(&mut self) -> Result<()> {
        if self.mode == FsMode::Disposed {
            return Err(CpmError::Core(Error::Disposed));
        }
        self.mode = FsMode::FileAccess;
        Ok(())
    }

    /// Transitions into raw-block mode; refuses while any fork is open
    /// (spec §4.8's FileAccess→Raw leg).
    pub fn prepare_raw_access(&mut self) -> Result<()> {
        if self.mode == FsMode::Disposed {
            return Err(CpmError::Core(Error::Disposed));
        }
        if !self.open_files.is_empty() {
            return Err(CpmError::Core(Error::structural(
                "cannot drop to raw access with forks still open",
            )));
        }
        self.mode = FsMode::Raw;
        Ok(())
    }

    /// No-op: every CP/M directory write in this crate already lands on
    /// the device synchronously, so there is no batched state to commit
    /// (spec §4.8 "flush").
    pub fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Always fails: CP/M files have a single unnamed data area, no
    /// resource fork (spec §4.8 "add_rsrc_fork").
    pub fn add_rsrc_fork(&mut self, _entry: EntryId) -> Result<()> {
        Err(CpmError::Core(Error::InvalidArg(
            "CP/M has no resource forks",
        )))
    }

    /// Renames an entry and/or moves it to a different user number by
    /// rewriting every one of its extent records under the new identity
    /// (spec §4.8 "move_file" — CP/M's flat, user-partitioned namespace
    /// has no directory hierarchy to reparent into).
    pub fn move_file(&mut self, entry: EntryId, new_user: u8, new_name: &str) -> Result<()> {
        if self.image_read_only {
            return Err(CpmError::Core(Error::ReadOnly));
        }
        let (name_bytes, ext_bytes) = parse_name(new_name)?;
        let new_id = FileId {
            user: new_user,
            name: name_bytes,
            ext: ext_bytes,
        };
        let old_id = self.entries.get(entry)?.id;
        if new_id != old_id && self.find_entry(new_id).is_some() {
            return Err(CpmError::DuplicateName(new_id.display_name()));
        }

        let extents = self.collect_extents(old_id)?;
        for (location, mut record) in extents {
            record.user = new_id.user;
            record.name = new_id.name;
            record.ext = new_id.ext;
            let mut device = self.device.borrow_mut();
            write_dir_entry(&mut device, location, &record)?;
        }
        if let Ok(rec) = self.entries.get_mut(entry) {
            rec.id = new_id;
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

    pub fn list_files(&self) -> Vec<(EntryId, String)> {
        self.entries
            .iter()
            .map(|(key, record)| (key, record.id.display_name()))
            .collect()
    }

    fn collect_extents(&self, id: FileId) -> Result<Vec<(DirLocation, ExtentRecord)>> {
        let mut device = self.device.borrow_mut();
        let mut found = Vec::new();
        scan_directory(&mut *device, &self.params, |location, record| {
            if record.id() == id {
                found.push((location, record));
            }
        })?;
        Ok(found)
    }

    fn find_entry(&self, id: FileId) -> Option<EntryId> {
        self.entries
            .iter()
            .find(|(_, record)| record.id == id)
            .map(|(key, _)| key)
    }

    pub fn create_file(&mut self, user: u8, name: &str) -> Result<EntryId> {
        if self.image_read_only {
            return Err(CpmError::Core(Error::ReadOnly));
        }
        let (name_bytes, ext_bytes) = parse_name(name)?;
        let id = FileId {
            user,
            name: name_bytes,
            ext: ext_bytes,
        };
        if self.find_entry(id).is_some() {
            return Err(CpmError::DuplicateName(id.display_name()));
        }
        let slot = self.dir_slots.borrow_mut().alloc_one()?;
        let location = slot_location(slot);
        let record = ExtentRecord::new_for(id, 0);
        {
            let mut device = self.device.borrow_mut();
            write_dir_entry(&mut device, location, &record)?;
        }
        Ok(self.entries.insert(CpmEntryRecord {
            id,
            flags: EntryFlags::new(),
        }))
    }

    pub fn delete_file(&mut self, entry: EntryId) -> Result<()> {
        if self.image_read_only {
            return Err(CpmError::Core(Error::ReadOnly));
        }
        let record = self.entries.get(entry)?;
        let id = record.id;
        let extents = self.collect_extents(id)?;
        for (location, mut extent) in extents {
            for b in extent.blocks {
                if b != 0 {
                    self.blocks.borrow_mut().free_one(b as u32);
                }
            }
            extent.user = DELETED_USER;
            let mut device = self.device.borrow_mut();
            write_dir_entry(&mut device, location, &extent)?;
            drop(device);
            self.dir_slots.borrow_mut().free_one(dir_slot_number(location));
        }
        self.entries.remove(entry)?;
        Ok(())
    }

    pub fn open_fork(
        &mut self,
        entry: EntryId,
        mode: Mode,
    ) -> Result<FileDescriptor<CpmForkStorage<D>>> {
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

        let id = record.id;
        let extents = self.collect_extents(id)?;
        let eof = compute_eof(&extents);
        let storage = CpmForkStorage::new(
            self.device.clone(),
            self.blocks.clone(),
            self.dir_slots.clone(),
            id,
            extents,
            eof,
        );
        Ok(FileDescriptor::new(entry, Part::DataFork, mode, storage))
    }

    pub fn release_fork(&mut self, entry: EntryId, mode: Mode) {
        self.open_files.release(entry, Part::DataFork, mode);
    }

    /// Re-walks the whole directory, registering every distinct file and
    /// reporting allocation conflicts between files that claim the same
    /// allocation block (spec §4.2).
    pub fn scan_and_verify(&mut self) -> Result<VolumeUsageMap> {
        let mut usage = VolumeUsageMap::new(self.params.total_alloc_blocks as usize);
        for block in 0..self.params.dir_alloc_blocks {
            usage.mark_in_use(block);
        }
        let ids: Vec<(EntryId, FileId)> = self
            .entries
            .iter()
            .map(|(key, record)| (key, record.id))
            .collect();
        let mut conflicted: Vec<EntryId> = Vec::new();
        for (key, id) in ids {
            let extents = self.collect_extents(id)?;
            let before = usage.conflicts().len();
            for (_, record) in &extents {
                for b in record.blocks {
                    if b != 0 {
                        usage.alloc_chunk(b as u32, key);
                    }
                }
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
                "{} allocation conflicts found during scan",
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

    fn mount_fresh(total_alloc_blocks: u32) -> CpmVolume<MemoryDevice> {
        let params = DiskParams {
            dir_alloc_blocks: 2,
            total_alloc_blocks,
        };
        let device = Rc::new(RefCell::new(MemoryDevice::zeroed(total_alloc_blocks * 2)));
        {
            let mut dev = device.borrow_mut();
            for b in 0..dev.formatted_length() as u32 / 512 {
                let mut blk = [0u8; 512];
                for slot in blk.chunks_mut(32) {
                    slot[0] = DELETED_USER;
                }
                dev.write_block(b, &blk).unwrap();
            }
        }
        CpmVolume::mount(device, params, false).unwrap()
    }

    #[test]
    fn create_list_and_write_round_trip() {
        let mut vol = mount_fresh(32);
        let entry = vol.create_file(0, "HELLO.TXT").unwrap();
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
        let mut vol = mount_fresh(32);
        vol.create_file(0, "HELLO.TXT").unwrap();
        assert!(matches!(
            vol.create_file(0, "HELLO.TXT"),
            Err(CpmError::DuplicateName(_))
        ));
    }

    #[test]
    fn delete_frees_directory_slot_and_blocks() {
        let mut vol = mount_fresh(32);
        let entry = vol.create_file(0, "BYE.TXT").unwrap();
        {
            let mut fd = vol.open_fork(entry, Mode::ReadWrite).unwrap();
            fd.write(&vec![b'Z'; RECORD_SIZE * 3]).unwrap();
            fd.flush().unwrap();
            fd.invalidate();
        }
        vol.release_fork(entry, Mode::ReadWrite);
        vol.delete_file(entry).unwrap();
        assert!(vol.list_files().is_empty());
    }

    #[test]
    fn move_file_renames_and_changes_user() {
        let mut vol = mount_fresh(32);
        let entry = vol.create_file(0, "OLD.TXT").unwrap();
        vol.move_file(entry, 1, "NEW.TXT").unwrap();
        let files = vol.list_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, entry);

        let mut fd = vol.open_fork(entry, Mode::ReadWrite).unwrap();
        fd.write(b"moved").unwrap();
        fd.flush().unwrap();
        fd.invalidate();
        vol.release_fork(entry, Mode::ReadWrite);
    }

    #[test]
    fn format_then_mount_round_trips_through_close_all() {
        let params = DiskParams {
            dir_alloc_blocks: 2,
            total_alloc_blocks: 32,
        };
        let device = Rc::new(RefCell::new(MemoryDevice::zeroed(32 * 2)));
        let mut vol = CpmVolume::format(device, params).unwrap();
        vol.create_file(0, "DOC.TXT").unwrap();
        assert_eq!(vol.get_vol_dir_entry().file_count, 1);
        vol.close_all().unwrap();
        assert_eq!(vol.mode(), FsMode::Disposed);
    }
}
