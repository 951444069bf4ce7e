//! The HFS volume object: MDB-driven mount, catalog/extents-tree wiring,
//! fork storage, growth allocation, and the scan-and-verify pass (spec §4).

use std::cell::RefCell;
use std::rc::Rc;

use paleofs_core::arena::{Arena, EntryId};
use paleofs_core::bitmap::{ClumpBitmap, Extent as AllocExtent};
use paleofs_core::descriptor::{FileDescriptor, ForkStorage, Mode, OpenFileTable, Part};
use paleofs_core::entry::{Dubious, EntryFlags};
use paleofs_core::fsops::{check_file_access, AccessCheck, FsMode};
use paleofs_core::{AccessLevel, GatedDevice};
use paleofs_core::notes::Notes;
use paleofs_core::usage::{Owner, VolumeUsageMap};
use paleofs_core::ChunkDevice;

use crate::btree::{BTree, NodeStore, TreeKey};
use crate::catalog::{CatalogKey, CatalogRecord, DirectoryInfo, FileInfo, ThreadInfo};
use crate::error::HfsError;
use crate::extents::{ExtentDescriptor, ExtentKey, ExtentOverflowRecord, ExtentRecord, ForkKind};
use crate::mdb::MasterDirectoryBlock;

pub const ROOT_PARENT_ID: u32 = 1;
pub const ROOT_DIR_ID: u32 = 2;
const FIRST_USER_CNID: u32 = 16;

/// Backs the catalog and extents-overflow B*-trees: translates node
/// numbers into device blocks via the fork's allocation-block extents,
/// growing by asking the shared bitmap for one more clump when a split
/// needs room the fork doesn't have yet.
pub struct MetadataFile<D> {
    device: Rc<RefCell<D>>,
    bitmap: Rc<RefCell<ClumpBitmap>>,
    alloc_block_start: u32,
    blocks_per_alloc: u32,
    extents: Vec<AllocExtent>,
}

impl<D: ChunkDevice> MetadataFile<D> {
    pub fn new(
        device: Rc<RefCell<D>>,
        bitmap: Rc<RefCell<ClumpBitmap>>,
        alloc_block_start: u32,
        blocks_per_alloc: u32,
        inline: &ExtentRecord,
    ) -> Self {
        let extents = inline
            .0
            .iter()
            .filter(|e| !e.is_empty())
            .map(|e| e.to_alloc_extent())
            .collect();
        Self {
            device,
            bitmap,
            alloc_block_start,
            blocks_per_alloc,
            extents,
        }
    }

    fn total_nodes(&self) -> u32 {
        self.extents.iter().map(|e| e.count).sum::<u32>() * self.blocks_per_alloc
    }

    fn device_block_for_node(&self, node: u32) -> Result<u32, HfsError> {
        let mut remaining = node;
        for extent in &self.extents {
            let extent_nodes = extent.count * self.blocks_per_alloc;
            if remaining < extent_nodes {
                let base = self.alloc_block_start + extent.start * self.blocks_per_alloc;
                return Ok(base + remaining);
            }
            remaining -= extent_nodes;
        }
        Err(HfsError::Corrupt("node index beyond metadata file extents"))
    }
}

impl<D: ChunkDevice> NodeStore for MetadataFile<D> {
    fn read_node(&mut self, node: u32) -> Result<[u8; 512], HfsError> {
        let device_block = self.device_block_for_node(node)?;
        let mut buf = [0u8; 512];
        self.device
            .borrow_mut()
            .read_block(device_block, &mut buf)
            .map_err(paleofs_core::Error::from)?;
        Ok(buf)
    }

    fn write_node(&mut self, node: u32, bytes: &[u8; 512]) -> Result<(), HfsError> {
        let device_block = self.device_block_for_node(node)?;
        self.device
            .borrow_mut()
            .write_block(device_block, bytes)
            .map_err(paleofs_core::Error::from)?;
        Ok(())
    }

    fn grow(&mut self) -> Result<u32, HfsError> {
        let nodes_before = self.total_nodes();
        let near = self.extents.last().map(|e| e.start + e.count).unwrap_or(0);
        let granted = self
            .bitmap
            .borrow_mut()
            .alloc_blocks(1, near)
            .map_err(paleofs_core::Error::from)?;
        if let Some(last) = self.extents.last_mut() {
            if last.start + last.count == granted.start {
                last.count += granted.count;
                return Ok(nodes_before);
            }
        }
        self.extents.push(granted);
        Ok(nodes_before)
    }
}

type ExtentsTree<D> = Rc<RefCell<BTree<ExtentKey, MetadataFile<D>>>>;
type CatalogTree<D> = Rc<RefCell<BTree<CatalogKey, MetadataFile<D>>>>;

/// Looks up the catalog key (parent CNID + name) that owns `cnid`, via its
/// thread record. Shared between `HfsVolume` (which also has `resolve_thread`
/// with a root-recovery fallback) and `HfsForkStorage::flush`, which only
/// needs the plain lookup to write its fork's extents back.
fn catalog_key_for_cnid<D: ChunkDevice>(
    catalog: &CatalogTree<D>,
    cnid: u32,
) -> Result<CatalogKey, HfsError> {
    let thread_key = CatalogKey::new(cnid, "");
    let mut tree = catalog.borrow_mut();
    let (leaf, idx) = tree
        .search(&thread_key)?
        .ok_or(HfsError::Corrupt("thread record not found"))?;
    let bytes = tree.get_record(leaf, idx)?;
    match parse_catalog_payload(&bytes)? {
        CatalogRecord::DirectoryThread(t) | CatalogRecord::FileThread(t) => {
            Ok(CatalogKey::new(t.parent_cnid, t.name))
        }
        _ => Err(HfsError::Corrupt("thread key did not resolve to a thread record")),
    }
}

/// Every leaf record is stored as `key.to_bytes() ++ data`; `CatalogRecord`
/// only knows how to parse the `data` half, so every read path strips the
/// key prefix (via its own self-describing length byte) before handing the
/// rest to `CatalogRecord::parse`.
fn parse_catalog_payload(record: &[u8]) -> Result<CatalogRecord, HfsError> {
    let (_, consumed) = CatalogKey::parse(record);
    CatalogRecord::parse(&record[consumed..])
}

/// Resolves a single fork's logical blocks to allocation blocks, walking
/// the catalog's three inline extents and spilling into the
/// extents-overflow tree beyond that (spec §3, §4.5). Each `ForkStorage`
/// "block" is one HFS allocation block, which may itself span several
/// 512-byte device blocks.
pub struct HfsForkStorage<D: ChunkDevice> {
    device: Rc<RefCell<D>>,
    bitmap: Rc<RefCell<ClumpBitmap>>,
    extents_tree: ExtentsTree<D>,
    catalog: CatalogTree<D>,
    alloc_block_start: u32,
    blocks_per_alloc: u32,
    clump_size_alloc_blocks: u32,
    fork: ForkKind,
    cnid: u32,
    inline: ExtentRecord,
    overflow_cache: Option<Vec<ExtentDescriptor>>,
    eof: u64,
}

impl<D: ChunkDevice> HfsForkStorage<D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Rc<RefCell<D>>,
        bitmap: Rc<RefCell<ClumpBitmap>>,
        extents_tree: ExtentsTree<D>,
        catalog: CatalogTree<D>,
        alloc_block_start: u32,
        blocks_per_alloc: u32,
        clump_size_alloc_blocks: u32,
        fork: ForkKind,
        cnid: u32,
        inline: ExtentRecord,
        logical_size: u64,
    ) -> Self {
        Self {
            device,
            bitmap,
            extents_tree,
            catalog,
            alloc_block_start,
            blocks_per_alloc,
            clump_size_alloc_blocks: clump_size_alloc_blocks.max(1),
            fork,
            cnid,
            inline,
            overflow_cache: None,
            eof: logical_size,
        }
    }

    pub fn inline_extents(&self) -> ExtentRecord {
        self.inline
    }

    fn load_overflow(&mut self) -> Result<&[ExtentDescriptor], HfsError> {
        if self.overflow_cache.is_none() {
            let mut out = Vec::new();
            let mut tree = self.extents_tree.borrow_mut();
            for (_, _, record) in tree.iter_leaf_chain()? {
                let (key, consumed) = ExtentKey::parse(&record);
                if key.fork != self.fork as u8 || key.cnid != self.cnid {
                    continue;
                }
                let overflow = ExtentOverflowRecord(ExtentRecord::parse(
                    &record[consumed..consumed + 12].try_into().unwrap(),
                ));
                for e in overflow.0 .0.into_iter() {
                    if !e.is_empty() {
                        out.push(e);
                    }
                }
            }
            self.overflow_cache = Some(out);
        }
        Ok(self.overflow_cache.as_deref().unwrap())
    }

    fn alloc_block_to_device(&self, alloc_block: u32) -> u32 {
        self.alloc_block_start + alloc_block * self.blocks_per_alloc
    }

    fn total_blocks_covered(&mut self) -> Result<u32, HfsError> {
        let overflow_total: u32 = self.load_overflow()?.iter().map(|e| e.block_count as u32).sum();
        Ok(self.inline.total_blocks() + overflow_total)
    }
}

impl<D: ChunkDevice> ForkStorage for HfsForkStorage<D> {
    fn block_size(&self) -> usize {
        self.blocks_per_alloc as usize * 512
    }

    fn resolve_block(&mut self, index: u64) -> Result<Option<u32>, paleofs_core::Error> {
        let idx = index as u32;
        let mut covered = 0u32;
        for e in self.inline.0.iter().filter(|e| !e.is_empty()) {
            if idx < covered + e.block_count as u32 {
                return Ok(Some((e.start_block as u32) + (idx - covered)));
            }
            covered += e.block_count as u32;
        }
        let overflow = self.load_overflow().map_err(paleofs_core::Error::from)?.to_vec();
        for e in overflow {
            if idx < covered + e.block_count as u32 {
                return Ok(Some((e.start_block as u32) + (idx - covered)));
            }
            covered += e.block_count as u32;
        }
        Ok(None)
    }

    fn allocate_block(&mut self, index: u64) -> Result<u32, paleofs_core::Error> {
        let covered = self.total_blocks_covered().map_err(paleofs_core::Error::from)?;
        if (index as u32) < covered {
            return self
                .resolve_block(index)?
                .ok_or_else(|| paleofs_core::Error::structural("hole inside already-covered fork range"));
        }
        if index as u32 > covered {
            return Err(paleofs_core::Error::InvalidArg(
                "allocate_block called out of sequence",
            ));
        }

        let near = self
            .inline
            .0
            .iter()
            .chain(self.load_overflow().map_err(paleofs_core::Error::from)?.iter())
            .filter(|e| !e.is_empty())
            .map(|e| e.start_block as u32 + e.block_count as u32)
            .max()
            .unwrap_or(0);

        let granted = self
            .bitmap
            .borrow_mut()
            .alloc_blocks(self.clump_size_alloc_blocks, near)
            .map_err(paleofs_core::Error::from)?;

        // Try extending the last inline extent if contiguous.
        if let Some(last) = self.inline.0.iter_mut().rev().find(|e| !e.is_empty()) {
            if last.start_block as u32 + last.block_count as u32 == granted.start {
                last.block_count += granted.count as u16;
                return Ok(self.alloc_block_to_device(granted.start));
            }
        }
        if let Some(slot) = self.inline.first_free_slot() {
            self.inline.0[slot] = ExtentDescriptor {
                start_block: granted.start as u16,
                block_count: granted.count as u16,
            };
            return Ok(self.alloc_block_to_device(granted.start));
        }

        // Inline slots are full: spill into the extents-overflow tree.
        let start_block_index = covered as u16;
        let key = ExtentKey::new(self.fork, self.cnid, start_block_index);
        let mut rec = ExtentRecord::default();
        rec.0[0] = ExtentDescriptor {
            start_block: granted.start as u16,
            block_count: granted.count as u16,
        };
        let mut rec_bytes = [0u8; 12];
        rec.serialize(&mut rec_bytes);
        self.extents_tree
            .borrow_mut()
            .insert(key, &rec_bytes)
            .map_err(paleofs_core::Error::from)?;
        self.overflow_cache = None;
        Ok(self.alloc_block_to_device(granted.start))
    }

    fn read_device_block(&mut self, device_block: u32, buf: &mut [u8]) -> Result<(), paleofs_core::Error> {
        let base = self.alloc_block_to_device(device_block);
        let mut device = self.device.borrow_mut();
        for i in 0..self.blocks_per_alloc {
            let mut block = [0u8; 512];
            device.read_block(base + i, &mut block)?;
            let off = i as usize * 512;
            buf[off..off + 512].copy_from_slice(&block);
        }
        Ok(())
    }

    fn write_device_block(&mut self, device_block: u32, buf: &[u8]) -> Result<(), paleofs_core::Error> {
        let base = self.alloc_block_to_device(device_block);
        let mut device = self.device.borrow_mut();
        for i in 0..self.blocks_per_alloc {
            let off = i as usize * 512;
            let block: [u8; 512] = buf[off..off + 512].try_into().unwrap();
            device.write_block(base + i, &block)?;
        }
        Ok(())
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

    fn truncate_from(&mut self, index: u64) -> Result<(), paleofs_core::Error> {
        let idx = index as u32;
        let mut covered = 0u32;
        for e in self.inline.0.iter_mut() {
            if e.is_empty() {
                continue;
            }
            let start_idx = covered;
            let end_idx = covered + e.block_count as u32;
            covered = end_idx;
            if idx <= start_idx {
                let freed = AllocExtent {
                    start: e.start_block as u32,
                    count: e.block_count as u32,
                };
                self.bitmap.borrow_mut().release_blocks(freed);
                *e = ExtentDescriptor::default();
            } else if idx < end_idx {
                let keep = idx - start_idx;
                let freed = AllocExtent {
                    start: e.start_block as u32 + keep,
                    count: e.block_count as u32 - keep,
                };
                self.bitmap.borrow_mut().release_blocks(freed);
                e.block_count = keep as u16;
            }
        }
        self.overflow_cache = None;
        Ok(())
    }

    /// Writes the fork's current inline extents, physical block count, and
    /// logical EOF back into its owning catalog file record. Without this,
    /// a grown/truncated fork's data is only ever reflected in this
    /// in-memory `HfsForkStorage` — the next `open_fork` for the same CNID
    /// reads a stale record, as if nothing had been written.
    fn flush(&mut self) -> Result<(), paleofs_core::Error> {
        let physical_blocks = self.total_blocks_covered()?;
        let key = catalog_key_for_cnid(&self.catalog, self.cnid)?;
        let mut tree = self.catalog.borrow_mut();
        let (leaf, idx) = tree
            .search(&key)?
            .ok_or(HfsError::Corrupt("catalog entry vanished during flush"))?;
        let bytes = tree.get_record(leaf, idx)?;
        let mut file = match parse_catalog_payload(&bytes)? {
            CatalogRecord::File(f) => f,
            _ => return Err(HfsError::Corrupt("fork flush on a non-file catalog record").into()),
        };
        match self.fork {
            ForkKind::Data => {
                file.data_extents = self.inline;
                file.data_logical_size = self.eof as u32;
                file.data_physical_blocks = physical_blocks;
            }
            ForkKind::Resource => {
                file.rsrc_extents = self.inline;
                file.rsrc_logical_size = self.eof as u32;
                file.rsrc_physical_blocks = physical_blocks;
            }
        }
        tree.delete(&key)?;
        tree.insert(key, &CatalogRecord::File(file).serialize())?;
        Ok(())
    }
}

/// In-memory handle to a catalog entry, keyed by [`EntryId`] for the
/// generation-checked arena (spec §9).
pub struct EntryRecord {
    pub cnid: u32,
    pub parent_cnid: u32,
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

pub struct HfsVolume<D: ChunkDevice> {
    device: Rc<RefCell<D>>,
    bitmap: Rc<RefCell<ClumpBitmap>>,
    mdb: MasterDirectoryBlock,
    catalog: CatalogTree<D>,
    extents: ExtentsTree<D>,
    entries: Arena<EntryRecord, EntryId>,
    open_files: OpenFileTable,
    mode: FsMode,
    image_read_only: bool,
    notes: Notes,
}

impl<D: ChunkDevice> HfsVolume<D> {
    fn mount_over(device: D, image_read_only: bool) -> Result<Self, HfsError> {
        let device = Rc::new(RefCell::new(device));
        let mut mdb_block = [0u8; 512];
        device
            .borrow_mut()
            .read_block(crate::mdb::MDB_BLOCK, &mut mdb_block)
            .map_err(paleofs_core::Error::from)?;
        let mdb = MasterDirectoryBlock::parse(&mdb_block)?;

        let blocks_per_alloc = (mdb.block_size / 512).max(1);
        let num_alloc_blocks = mdb.total_blocks as u32;
        let bitmap = Rc::new(RefCell::new(read_volume_bitmap(
            &mut *device.borrow_mut(),
            num_alloc_blocks,
        )?));

        let catalog_store = MetadataFile::new(
            device.clone(),
            bitmap.clone(),
            mdb.alloc_block_start as u32,
            blocks_per_alloc,
            &mdb.catalog_file_extents,
        );
        let catalog = Rc::new(RefCell::new(BTree::open(catalog_store)?));

        let extents_store = MetadataFile::new(
            device.clone(),
            bitmap.clone(),
            mdb.alloc_block_start as u32,
            blocks_per_alloc,
            &mdb.extents_file_extents,
        );
        let extents = Rc::new(RefCell::new(BTree::open(extents_store)?));

        let mut notes = Notes::new();
        if !mdb.is_unmounted_cleanly() {
            notes.warning("volume was not unmounted cleanly; consider a full scan-and-verify");
        }

        Ok(Self {
            device,
            bitmap,
            mdb,
            catalog,
            extents,
            entries: Arena::new(),
            open_files: OpenFileTable::new(),
            mode: FsMode::FileAccess,
            image_read_only,
            notes,
        })
    }

    /// Formats a disk image from scratch: writes the MDB, an all-free
    /// allocation bitmap, and empty catalog/extents B*-trees seeded with
    /// the root directory's own record (spec §4.8 "format"). `vol_num` is
    /// accepted for parity with the other three formats' `format()` but
    /// unused — HFS's MDB has no field for a DOS-3.3-style volume number.
    /// `bootable` is likewise accepted but a no-op: constructing boot
    /// blocks 0-1 is out of scope here.
    fn format_over(
        device: D,
        vol_name: &str,
        _vol_num: u8,
        _bootable: bool,
        total_device_blocks: u32,
    ) -> Result<Self, HfsError> {
        let device = Rc::new(RefCell::new(device));
        let alloc_block_start = 6u32;
        if total_device_blocks <= alloc_block_start + 4 {
            return Err(HfsError::Corrupt("volume too small to format"));
        }
        let num_alloc_blocks = total_device_blocks - alloc_block_start;
        let bitmap = Rc::new(RefCell::new(ClumpBitmap::new(num_alloc_blocks, 4096)));

        let catalog_extents = {
            let granted = bitmap.borrow_mut().alloc_blocks(2, 0).map_err(paleofs_core::Error::from)?;
            let mut r = ExtentRecord::default();
            r.0[0] = ExtentDescriptor {
                start_block: granted.start as u16,
                block_count: granted.count as u16,
            };
            r
        };
        let extents_extents = {
            let granted = bitmap.borrow_mut().alloc_blocks(2, 0).map_err(paleofs_core::Error::from)?;
            let mut r = ExtentRecord::default();
            r.0[0] = ExtentDescriptor {
                start_block: granted.start as u16,
                block_count: granted.count as u16,
            };
            r
        };

        let catalog_store = MetadataFile::new(device.clone(), bitmap.clone(), alloc_block_start, 1, &catalog_extents);
        BTree::<CatalogKey, _>::format(catalog_store, 37, 2)?;
        let extents_store = MetadataFile::new(device.clone(), bitmap.clone(), alloc_block_start, 1, &extents_extents);
        BTree::<ExtentKey, _>::format(extents_store, 8, 2)?;

        let mdb = MasterDirectoryBlock {
            signature: crate::mdb::MDB_SIGNATURE,
            create_date: crate::time::HfsTime(0),
            modify_date: crate::time::HfsTime(0),
            backup_date: crate::time::HfsTime(0),
            attributes: crate::mdb::VolumeAttributes::UNMOUNTED_CLEANLY,
            file_count: 0,
            directory_count: 1,
            alloc_block_start: alloc_block_start as u16,
            block_size: 512,
            total_blocks: num_alloc_blocks as u16,
            clump_size: 512,
            next_alloc_hint: 0,
            next_catalog_id: FIRST_USER_CNID,
            free_blocks: bitmap.borrow().free_blocks() as u16,
            volume_name: vol_name.to_string(),
            catalog_file_extents: catalog_extents,
            catalog_file_size: catalog_extents.total_blocks() * 512,
            extents_file_extents: extents_extents,
            extents_file_size: extents_extents.total_blocks() * 512,
        };
        let mut block = [0u8; 512];
        mdb.serialize(&mut block);
        device
            .borrow_mut()
            .write_block(crate::mdb::MDB_BLOCK, &block)
            .map_err(paleofs_core::Error::from)?;
        device
            .borrow_mut()
            .write_block(mdb.alternate_mdb_block(), &block)
            .map_err(paleofs_core::Error::from)?;
        {
            let mut bm = bitmap.borrow_mut();
            write_volume_bitmap(&device, &mut bm)?;
        }

        let catalog = Rc::new(RefCell::new(BTree::open(MetadataFile::new(
            device.clone(),
            bitmap.clone(),
            alloc_block_start,
            1,
            &catalog_extents,
        ))?));
        let extents = Rc::new(RefCell::new(BTree::open(MetadataFile::new(
            device.clone(),
            bitmap.clone(),
            alloc_block_start,
            1,
            &extents_extents,
        ))?));

        let root_key = CatalogKey::new(ROOT_PARENT_ID, vol_name.to_string());
        catalog.borrow_mut().insert(
            root_key,
            &CatalogRecord::Directory(DirectoryInfo {
                cnid: ROOT_DIR_ID,
                ..Default::default()
            })
            .serialize(),
        )?;
        catalog.borrow_mut().insert(
            CatalogKey::new(ROOT_DIR_ID, ""),
            &CatalogRecord::DirectoryThread(ThreadInfo {
                parent_cnid: ROOT_PARENT_ID,
                name: vol_name.to_string(),
            })
            .serialize(),
        )?;

        Ok(Self {
            device,
            bitmap,
            mdb,
            catalog,
            extents,
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

    pub fn mdb(&self) -> &MasterDirectoryBlock {
        &self.mdb
    }

    pub fn mode(&self) -> FsMode {
        self.mode
    }

    /// Finds the (parent CNID, name) of `cnid` via its thread record,
    /// falling back to a leftmost-leaf scan for the root directory when
    /// the thread record itself is missing or damaged.
    pub fn resolve_thread(&mut self, cnid: u32) -> Result<ThreadInfo, HfsError> {
        let key = CatalogKey::new(cnid, "");
        if let Some((leaf, idx)) = self.catalog.borrow_mut().search(&key)? {
            let bytes = self.catalog.borrow_mut().get_record(leaf, idx)?;
            return match parse_catalog_payload(&bytes)? {
                CatalogRecord::DirectoryThread(t) | CatalogRecord::FileThread(t) => Ok(t),
                _ => Err(HfsError::Corrupt("thread key did not resolve to a thread record")),
            };
        }
        if cnid == ROOT_DIR_ID {
            for (_, _, record) in self.catalog.borrow_mut().iter_leaf_chain()? {
                if let Ok(CatalogRecord::Directory(d)) = parse_catalog_payload(&record) {
                    if d.cnid == ROOT_DIR_ID {
                        self.notes
                            .warning("root thread record missing; recovered via leaf scan");
                        return Ok(ThreadInfo {
                            parent_cnid: ROOT_PARENT_ID,
                            name: String::new(),
                        });
                    }
                }
            }
        }
        Err(HfsError::Corrupt("thread record not found"))
    }

    /// Lists the direct children of `parent_cnid`: the leaf-chain walk
    /// starting at the first key for this parent, stopping at the first
    /// record belonging to a different parent (spec §4.6).
    pub fn list_children(&mut self, parent_cnid: u32) -> Result<Vec<(String, CatalogRecord)>, HfsError> {
        let mut out = Vec::new();
        for (_, _, record) in self.catalog.borrow_mut().iter_leaf_chain()? {
            let (key, _) = CatalogKey::parse(&record);
            if key.parent_cnid != parent_cnid || key.name.is_empty() {
                continue; // different parent, or this parent's own thread record
            }
            if let Ok(parsed) = parse_catalog_payload(&record) {
                out.push((key.name, parsed));
            }
        }
        Ok(out)
    }

    pub fn create_entry(
        &mut self,
        parent_cnid: u32,
        name: &str,
        is_directory: bool,
    ) -> Result<u32, HfsError> {
        if self.image_read_only {
            return Err(paleofs_core::Error::ReadOnly.into());
        }
        let cnid = self.mdb.next_catalog_id.max(FIRST_USER_CNID);
        self.mdb.next_catalog_id = cnid + 1;

        let key = CatalogKey::new(parent_cnid, name);
        if is_directory {
            let info = DirectoryInfo {
                cnid,
                ..Default::default()
            };
            self.catalog
                .borrow_mut()
                .insert(key, &CatalogRecord::Directory(info).serialize())?;
            self.mdb.directory_count += 1;
        } else {
            let info = FileInfo {
                cnid,
                ..Default::default()
            };
            self.catalog
                .borrow_mut()
                .insert(key, &CatalogRecord::File(Box::new(info)).serialize())?;
            self.mdb.file_count += 1;
        }

        let thread_key = CatalogKey::new(cnid, "");
        let thread = ThreadInfo {
            parent_cnid,
            name: name.to_string(),
        };
        let thread_record = if is_directory {
            CatalogRecord::DirectoryThread(thread)
        } else {
            CatalogRecord::FileThread(thread)
        };
        self.catalog.borrow_mut().insert(thread_key, &thread_record.serialize())?;
        self.adjust_valence(parent_cnid, 1)?;
        Ok(cnid)
    }

    /// Deletes a file entry: frees its inline and overflow extents,
    /// removes its catalog and thread records, and decrements the
    /// parent's valence (spec §4.8). Only removes files — HFS directories
    /// need their own children emptied first, which is out of scope here.
    pub fn delete_file(&mut self, entry: EntryId) -> Result<(), HfsError> {
        if self.image_read_only {
            return Err(paleofs_core::Error::ReadOnly.into());
        }
        let (cnid, entry_flags, is_directory) = {
            let rec = self.entries.get(entry).map_err(paleofs_core::Error::from)?;
            (rec.cnid, rec.flags, rec.is_directory)
        };
        if is_directory {
            return Err(HfsError::Corrupt("delete_file does not remove directories"));
        }
        check_file_access(&AccessCheck {
            fs_mode: self.mode,
            image_read_only: self.image_read_only,
            entry_flags: &entry_flags,
            want_write: true,
            entry_belongs_to_this_fs: true,
        })
        .map_err(HfsError::from)?;

        let parent_cnid = self.parent_of(cnid)?;
        let name = self.name_of(cnid)?;
        let key = CatalogKey::new(parent_cnid, name);
        let (leaf, idx) = self
            .catalog
            .borrow_mut()
            .search(&key)?
            .ok_or(HfsError::Corrupt("catalog entry vanished"))?;
        let bytes = self.catalog.borrow_mut().get_record(leaf, idx)?;
        let file = match parse_catalog_payload(&bytes)? {
            CatalogRecord::File(f) => f,
            _ => return Err(HfsError::Corrupt("delete_file called on a non-file record")),
        };

        for ext in file.data_extents.0.iter().chain(file.rsrc_extents.0.iter()) {
            if !ext.is_empty() {
                self.bitmap.borrow_mut().release_blocks(AllocExtent {
                    start: ext.start_block as u32,
                    count: ext.block_count as u32,
                });
            }
        }
        self.free_overflow_extents(cnid)?;

        self.catalog.borrow_mut().delete(&key)?;
        self.catalog.borrow_mut().delete(&CatalogKey::new(cnid, ""))?;
        self.mdb.file_count = self.mdb.file_count.saturating_sub(1);
        self.adjust_valence(parent_cnid, -1)?;
        self.entries.remove(entry).map_err(paleofs_core::Error::from)?;
        Ok(())
    }

    /// Frees and removes every extents-overflow record for `cnid`, across
    /// both forks.
    fn free_overflow_extents(&mut self, cnid: u32) -> Result<(), HfsError> {
        let mut to_delete = Vec::new();
        {
            let mut tree = self.extents.borrow_mut();
            for (_, _, record) in tree.iter_leaf_chain()? {
                let (key, consumed) = ExtentKey::parse(&record);
                if key.cnid != cnid {
                    continue;
                }
                let overflow = ExtentRecord::parse(&record[consumed..consumed + 12].try_into().unwrap());
                for e in overflow.0.iter() {
                    if !e.is_empty() {
                        self.bitmap.borrow_mut().release_blocks(AllocExtent {
                            start: e.start_block as u32,
                            count: e.block_count as u32,
                        });
                    }
                }
                to_delete.push(key);
            }
        }
        let mut tree = self.extents.borrow_mut();
        for key in to_delete {
            tree.delete(&key)?;
        }
        Ok(())
    }

    pub fn open_fork(
        &mut self,
        entry: EntryId,
        cnid: u32,
        part: Part,
        mode: Mode,
    ) -> Result<FileDescriptor<HfsForkStorage<D>>, HfsError> {
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
        .map_err(HfsError::from)?;
        self.open_files
            .try_acquire(entry, part, mode)
            .map_err(HfsError::from)?;

        let fork_kind = match part {
            Part::DataFork => ForkKind::Data,
            Part::RsrcFork => ForkKind::Resource,
            Part::RawData => {
                return Err(HfsError::Core(paleofs_core::Error::InvalidArg(
                    "HFS forks are opened as DataFork or RsrcFork, not RawData",
                )))
            }
        };

        let key = CatalogKey::new(self.parent_of(cnid)?, self.name_of(cnid)?);
        let (leaf, idx) = self
            .catalog
            .borrow_mut()
            .search(&key)?
            .ok_or(HfsError::Corrupt("catalog entry vanished"))?;
        let bytes = self.catalog.borrow_mut().get_record(leaf, idx)?;
        let file = match parse_catalog_payload(&bytes)? {
            CatalogRecord::File(f) => f,
            _ => return Err(HfsError::Corrupt("fork open on non-file entry")),
        };
        let (inline, logical_size) = match fork_kind {
            ForkKind::Data => (file.data_extents, file.data_logical_size as u64),
            ForkKind::Resource => (file.rsrc_extents, file.rsrc_logical_size as u64),
        };

        let storage = HfsForkStorage::new(
            self.device.clone(),
            self.bitmap.clone(),
            self.extents.clone(),
            self.catalog.clone(),
            self.mdb.alloc_block_start as u32,
            (self.mdb.block_size / 512).max(1),
            (self.mdb.clump_size / self.mdb.block_size.max(1)).max(1),
            fork_kind,
            cnid,
            inline,
            logical_size,
        );
        Ok(FileDescriptor::new(entry, part, mode, storage))
    }

    pub fn release_fork(&mut self, entry: EntryId, part: Part, mode: Mode) {
        self.open_files.release(entry, part, mode);
    }

    /// Registers an in-memory handle for a catalog entry already present
    /// on disk (e.g. right after `create_entry`, or during a directory
    /// walk), handing back the [`EntryId`] `open_fork`/`delete_file`/
    /// `move_file` key off of.
    pub fn register_entry(
        &mut self,
        cnid: u32,
        parent_cnid: u32,
        name: String,
        is_directory: bool,
    ) -> EntryId {
        self.entries.insert(EntryRecord {
            cnid,
            parent_cnid,
            name,
            is_directory,
            flags: EntryFlags::new(),
        })
    }

    fn parent_of(&mut self, cnid: u32) -> Result<u32, HfsError> {
        Ok(self.resolve_thread(cnid)?.parent_cnid)
    }

    fn name_of(&mut self, cnid: u32) -> Result<String, HfsError> {
        Ok(self.resolve_thread(cnid)?.name)
    }

    /// Finds the catalog key for `cnid`'s own directory record via its
    /// thread record, or `None` when no thread record exists yet (e.g. the
    /// root directory on a volume mounted without ever going through
    /// `format()`).
    fn directory_key_for(&mut self, cnid: u32) -> Result<Option<CatalogKey>, HfsError> {
        let thread_key = CatalogKey::new(cnid, "");
        if let Some((leaf, idx)) = self.catalog.borrow_mut().search(&thread_key)? {
            let bytes = self.catalog.borrow_mut().get_record(leaf, idx)?;
            if let Ok(CatalogRecord::DirectoryThread(t)) = parse_catalog_payload(&bytes) {
                return Ok(Some(CatalogKey::new(t.parent_cnid, t.name)));
            }
        }
        Ok(None)
    }

    fn directory_record(&mut self, cnid: u32) -> Result<Option<DirectoryInfo>, HfsError> {
        let Some(key) = self.directory_key_for(cnid)? else {
            return Ok(None);
        };
        let (leaf, idx) = self
            .catalog
            .borrow_mut()
            .search(&key)?
            .ok_or(HfsError::Corrupt("directory record vanished"))?;
        let bytes = self.catalog.borrow_mut().get_record(leaf, idx)?;
        match parse_catalog_payload(&bytes)? {
            CatalogRecord::Directory(d) => Ok(Some(d)),
            _ => Err(HfsError::Corrupt("catalog key did not resolve to a directory record")),
        }
    }

    /// Bumps `dir_cnid`'s valence by `delta`, a no-op when the directory
    /// has no catalog record of its own yet (spec property 11). This is
    /// how a just-created entry's parent directory gets its child count
    /// kept in sync, since the B*-tree has no in-place update API.
    fn adjust_valence(&mut self, dir_cnid: u32, delta: i32) -> Result<(), HfsError> {
        let Some(key) = self.directory_key_for(dir_cnid)? else {
            return Ok(());
        };
        let (leaf, idx) = self
            .catalog
            .borrow_mut()
            .search(&key)?
            .ok_or(HfsError::Corrupt("parent directory record vanished"))?;
        let bytes = self.catalog.borrow_mut().get_record(leaf, idx)?;
        let mut info = match parse_catalog_payload(&bytes)? {
            CatalogRecord::Directory(d) => d,
            _ => return Err(HfsError::Corrupt("parent is not a directory record")),
        };
        info.valence = (info.valence as i64 + delta as i64).max(0) as u32;
        self.catalog.borrow_mut().delete(&key)?;
        self.catalog
            .borrow_mut()
            .insert(key, &CatalogRecord::Directory(info).serialize())?;
        Ok(())
    }

    /// Returns the root directory's own catalog record, spec §4.8's
    /// "volume directory entry". Falls back to a bare stand-in carrying
    /// just the root CNID when the volume has no root catalog record
    /// (only `format()`-created volumes seed one).
    pub fn get_vol_dir_entry(&mut self) -> Result<DirectoryInfo, HfsError> {
        Ok(self.directory_record(ROOT_DIR_ID)?.unwrap_or(DirectoryInfo {
            cnid: ROOT_DIR_ID,
            ..Default::default()
        }))
    }

    /// Relocates and/or renames a file or directory: moves its catalog and
    /// thread records under the new parent/name and adjusts both parents'
    /// valence (spec §4.8 "move_file").
    pub fn move_file(&mut self, entry: EntryId, new_parent: u32, new_name: &str) -> Result<(), HfsError> {
        if self.image_read_only {
            return Err(paleofs_core::Error::ReadOnly.into());
        }
        let (cnid, is_directory) = {
            let rec = self.entries.get(entry).map_err(paleofs_core::Error::from)?;
            (rec.cnid, rec.is_directory)
        };
        let old_parent = self.parent_of(cnid)?;
        let old_name = self.name_of(cnid)?;
        let old_key = CatalogKey::new(old_parent, old_name);
        let new_key = CatalogKey::new(new_parent, new_name);

        if self.catalog.borrow_mut().search(&new_key)?.is_some() {
            return Err(HfsError::DuplicateKey);
        }
        let (leaf, idx) = self
            .catalog
            .borrow_mut()
            .search(&old_key)?
            .ok_or(HfsError::Corrupt("catalog entry vanished"))?;
        let bytes = self.catalog.borrow_mut().get_record(leaf, idx)?;
        let (_, consumed) = CatalogKey::parse(&bytes);
        self.catalog.borrow_mut().delete(&old_key)?;
        self.catalog.borrow_mut().insert(new_key, &bytes[consumed..])?;

        let thread_key = CatalogKey::new(cnid, "");
        let thread = ThreadInfo {
            parent_cnid: new_parent,
            name: new_name.to_string(),
        };
        let thread_record = if is_directory {
            CatalogRecord::DirectoryThread(thread)
        } else {
            CatalogRecord::FileThread(thread)
        };
        self.catalog.borrow_mut().delete(&thread_key)?;
        self.catalog.borrow_mut().insert(thread_key, &thread_record.serialize())?;

        if old_parent != new_parent {
            self.adjust_valence(old_parent, -1)?;
            self.adjust_valence(new_parent, 1)?;
        }
        if let Ok(rec) = self.entries.get_mut(entry) {
            rec.parent_cnid = new_parent;
            rec.name = new_name.to_string();
        }
        Ok(())
    }

    /// HFS files always carry both forks in their catalog record, so
    /// `add_rsrc_fork` is a validation no-op confirming the entry is a
    /// file (spec §4.8) rather than an allocation.
    pub fn add_rsrc_fork(&mut self, entry: EntryId) -> Result<(), HfsError> {
        let rec = self.entries.get(entry).map_err(paleofs_core::Error::from)?;
        if rec.is_directory {
            return Err(HfsError::Corrupt("add_rsrc_fork called on a directory entry"));
        }
        Ok(())
    }

    /// Transitions into file-access mode (spec §4.8's Raw→FileAccess leg).
    pub fn prepare_file_access(&mut self) -> Result<(), HfsError> {
        if self.mode == FsMode::Disposed {
            return Err(paleofs_core::Error::Disposed.into());
        }
        self.mode = FsMode::Raw; // placeholder only until the line below runs
        self.mode = FsMode::FileAccess;
        Ok(())
    }

    /// Transitions into raw-block mode; refuses while any fork is open,
    /// since raw access and a live `FileDescriptor` would disagree about
    /// who owns the underlying blocks (spec §4.8's FileAccess→Raw leg).
    pub fn prepare_raw_access(&mut self) -> Result<(), HfsError> {
        if self.mode == FsMode::Disposed {
            return Err(paleofs_core::Error::Disposed.into());
        }
        if !self.open_files.is_empty() {
            return Err(
                paleofs_core::Error::structural("cannot drop to raw access with forks still open").into(),
            );
        }
        self.mode = FsMode::Raw;
        Ok(())
    }

    /// Commits the allocation bitmap and MDB back to disk (spec §4.8
    /// "flush"), the HFS analogue of ProDOS's `write_volume_bitmap`-backed
    /// `flush`.
    pub fn flush(&mut self) -> Result<(), HfsError> {
        if self.image_read_only {
            return Ok(());
        }
        {
            let mut bm = self.bitmap.borrow_mut();
            write_volume_bitmap(&self.device, &mut bm)?;
        }
        self.mdb.free_blocks = self.bitmap.borrow().free_blocks() as u16;
        let mut block = [0u8; 512];
        self.mdb.serialize(&mut block);
        self.device
            .borrow_mut()
            .write_block(crate::mdb::MDB_BLOCK, &block)
            .map_err(paleofs_core::Error::from)?;
        let alt = self.mdb.alternate_mdb_block();
        self.device
            .borrow_mut()
            .write_block(alt, &block)
            .map_err(paleofs_core::Error::from)?;
        Ok(())
    }

    /// Rebuilds the volume usage map from a leaf-chain walk of the
    /// catalog, cross-referencing against the allocator bitmap (spec §4.2,
    /// §8 property 7).
    pub fn scan_and_verify(&mut self) -> Result<VolumeUsageMap, HfsError> {
        let mut usage = VolumeUsageMap::new(self.bitmap.borrow().len() as usize);
        for e in self.mdb.catalog_file_extents.0.iter().chain(self.mdb.extents_file_extents.0.iter()) {
            for b in e.start_block..e.start_block + e.block_count {
                usage.mark_in_use(b as u32);
            }
        }
        let mut max_cnid = 0u32;
        for (_, _, record) in self.catalog.borrow_mut().iter_leaf_chain()? {
            let Ok(parsed) = parse_catalog_payload(&record) else {
                self.notes.error("corrupt catalog record encountered during scan");
                continue;
            };
            if let Some(cnid) = parsed.cnid() {
                max_cnid = max_cnid.max(cnid);
            }
            if let CatalogRecord::File(f) = &parsed {
                let entry_id = self.entries.insert(EntryRecord {
                    cnid: f.cnid,
                    parent_cnid: 0,
                    name: String::new(),
                    is_directory: false,
                    flags: EntryFlags::new(),
                });
                for ext in f.data_extents.0.iter().chain(f.rsrc_extents.0.iter()) {
                    for b in ext.start_block..ext.start_block + ext.block_count {
                        usage.alloc_chunk(b as u32, entry_id);
                    }
                }
            }
        }
        if max_cnid >= self.mdb.next_catalog_id {
            self.notes.error("catalog contains a CNID >= next-CNID hint");
        }
        if !usage.conflicts().is_empty() {
            self.notes
                .warning(format!("{} chunk ownership conflicts found during scan", usage.conflicts().len()));
        }
        Ok(usage)
    }
}

impl<D: ChunkDevice> HfsVolume<GatedDevice<D>> {
    /// Mounts a raw device behind a [`GatedDevice`], enforcing spec §4.1's
    /// access-level gate on every block read/write the volume performs —
    /// `Closed` until the bootstrap MDB/bitmap/B*-tree reads below, then
    /// `ReadOnly` or `Open` depending on `image_read_only`.
    pub fn mount(device: D, image_read_only: bool) -> Result<Self, HfsError> {
        let mut gated = GatedDevice::new(device);
        gated.set_level(AccessLevel::Open);
        let mut volume = HfsVolume::mount_over(gated, image_read_only)?;
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
        total_device_blocks: u32,
    ) -> Result<Self, HfsError> {
        let mut gated = GatedDevice::new(device);
        gated.set_level(AccessLevel::Open);
        let mut volume = HfsVolume::format_over(gated, vol_name, vol_num, bootable, total_device_blocks)?;
        volume.device.borrow_mut().set_level(AccessLevel::Open);
        Ok(volume)
    }

    /// Flushes, drops every open-file bookkeeping entry, and gates the
    /// device shut — the terminal FileAccess/Raw→Disposed transition of
    /// spec §4.8's lifecycle. A caller's own still-held `FileDescriptor`s
    /// keep working until they explicitly `flush`/`invalidate`; this only
    /// guarantees no *new* volume operation succeeds afterward.
    pub fn close_all(&mut self) -> Result<(), HfsError> {
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

/// Reads HFS's on-disk allocation bitmap, starting at block 3. Bit-set
/// means "in use", matching `ClumpBitmap`'s own "true == in use" meaning
/// directly — no inversion needed (contrast ProDOS, which inverts).
fn read_volume_bitmap<D: ChunkDevice>(
    device: &mut D,
    num_alloc_blocks: u32,
) -> Result<ClumpBitmap, HfsError> {
    const BITMAP_START_BLOCK: u32 = 3;
    let bytes_needed = num_alloc_blocks.div_ceil(8) as usize;
    let blocks_needed = bytes_needed.div_ceil(512) as u32;
    let mut raw = vec![0u8; blocks_needed as usize * 512];
    for i in 0..blocks_needed {
        let mut block = [0u8; 512];
        device
            .read_block(BITMAP_START_BLOCK + i, &mut block)
            .map_err(paleofs_core::Error::from)?;
        raw[i as usize * 512..(i as usize + 1) * 512].copy_from_slice(&block);
    }
    let mut bits = Vec::with_capacity(num_alloc_blocks as usize);
    for i in 0..num_alloc_blocks {
        let byte = raw[(i / 8) as usize];
        bits.push(byte & (0x80 >> (i % 8)) != 0);
    }
    Ok(ClumpBitmap::from_bits(bits, 4096))
}

/// Writes back the allocation-bitmap pages touched since the last flush,
/// in HFS's "bit set ⇒ in use" polarity. `ClumpBitmap`'s 4096-bit pages
/// are exactly one 512-byte device block each, so each dirty page maps to
/// exactly one block write.
fn write_volume_bitmap<D: ChunkDevice>(
    device: &Rc<RefCell<D>>,
    bitmap: &mut ClumpBitmap,
) -> Result<(), HfsError> {
    const BITMAP_START_BLOCK: u32 = 3;
    let total_bits = bitmap.len();
    let dirty: Vec<usize> = bitmap.dirty_pages().collect();
    for page in dirty {
        let base_bit = page as u32 * 4096;
        let mut raw = [0u8; 512];
        for i in 0..4096u32 {
            let bit = base_bit + i;
            if bit >= total_bits {
                break;
            }
            if bitmap.is_used(bit) {
                raw[(i / 8) as usize] |= 0x80 >> (i % 8);
            }
        }
        device
            .borrow_mut()
            .write_block(BITMAP_START_BLOCK + page as u32, &raw)
            .map_err(paleofs_core::Error::from)?;
    }
    bitmap.clear_dirty();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extents::ExtentDescriptor;
    use crate::mdb::{MasterDirectoryBlock, VolumeAttributes, MDB_BLOCK, MDB_SIGNATURE};
    use crate::time::HfsTime;
    use paleofs_core::MemoryDevice;

    /// Builds a tiny formatted volume: MDB + on-disk bitmap written
    /// directly, catalog/extents B*-trees formatted through the same
    /// `MetadataFile`/`ClumpBitmap` wiring `HfsVolume::mount` uses.
    fn format_volume(total_device_blocks: u32) -> MemoryDevice {
        let alloc_block_start = 6u32;
        let num_alloc_blocks = total_device_blocks - alloc_block_start;

        let mut device = MemoryDevice::zeroed(total_device_blocks);

        let catalog_extents = {
            let mut r = ExtentRecord::default();
            r.0[0] = ExtentDescriptor {
                start_block: 0,
                block_count: 2,
            };
            r
        };
        let extents_extents = {
            let mut r = ExtentRecord::default();
            r.0[0] = ExtentDescriptor {
                start_block: 2,
                block_count: 2,
            };
            r
        };

        let mdb = MasterDirectoryBlock {
            signature: MDB_SIGNATURE,
            create_date: HfsTime(0),
            modify_date: HfsTime(0),
            backup_date: HfsTime(0),
            attributes: VolumeAttributes::UNMOUNTED_CLEANLY,
            file_count: 0,
            directory_count: 1,
            alloc_block_start: alloc_block_start as u16,
            block_size: 512,
            total_blocks: num_alloc_blocks as u16,
            clump_size: 512,
            next_alloc_hint: 4,
            next_catalog_id: FIRST_USER_CNID,
            free_blocks: num_alloc_blocks as u16 - 4,
            volume_name: "Test".into(),
            catalog_file_extents: catalog_extents,
            catalog_file_size: 2 * 512,
            extents_file_extents: extents_extents,
            extents_file_size: 2 * 512,
        };
        let mut block = [0u8; 512];
        mdb.serialize(&mut block);
        device.write_block(MDB_BLOCK, &block).unwrap();

        // On-disk bitmap: mark alloc blocks 0..4 used (catalog + extents
        // files), bit-set meaning "in use" as HFS stores it.
        let mut bitmap_block = [0u8; 512];
        bitmap_block[0] = 0b1111_0000;
        device.write_block(3, &bitmap_block).unwrap();

        let device = Rc::new(RefCell::new(device));
        let format_bitmap = Rc::new(RefCell::new(ClumpBitmap::from_bits(
            {
                let mut bits = vec![false; num_alloc_blocks as usize];
                bits[0..4].fill(true);
                bits
            },
            4096,
        )));

        let catalog_store = MetadataFile::new(
            device.clone(),
            format_bitmap.clone(),
            alloc_block_start,
            1,
            &catalog_extents,
        );
        BTree::<CatalogKey, _>::format(catalog_store, 37, 2).unwrap();

        let extents_store = MetadataFile::new(
            device.clone(),
            format_bitmap.clone(),
            alloc_block_start,
            1,
            &extents_extents,
        );
        BTree::<ExtentKey, _>::format(extents_store, 8, 2).unwrap();

        Rc::try_unwrap(device).ok().unwrap().into_inner()
    }

    #[test]
    fn mount_reads_mdb_and_detects_unclean_flag() {
        let device = format_volume(64);
        let volume = HfsVolume::mount(device, false).unwrap();
        assert_eq!(volume.mdb().volume_name, "Test");
        assert!(volume.notes().is_empty());
    }

    #[test]
    fn create_entry_round_trips_through_thread_record() {
        let device = format_volume(64);
        let mut volume = HfsVolume::mount(device, false).unwrap();
        let cnid = volume.create_entry(ROOT_DIR_ID, "Memo", false).unwrap();
        let thread = volume.resolve_thread(cnid).unwrap();
        assert_eq!(thread.parent_cnid, ROOT_DIR_ID);
        assert_eq!(thread.name, "Memo");
    }

    #[test]
    fn list_children_finds_created_entries_and_skips_threads() {
        let device = format_volume(64);
        let mut volume = HfsVolume::mount(device, false).unwrap();
        volume.create_entry(ROOT_DIR_ID, "Alpha", false).unwrap();
        volume.create_entry(ROOT_DIR_ID, "Beta", true).unwrap();
        let children = volume.list_children(ROOT_DIR_ID).unwrap();
        let names: Vec<_> = children.iter().map(|(n, _)| n.clone()).collect();
        assert!(names.contains(&"Alpha".to_string()));
        assert!(names.contains(&"Beta".to_string()));
    }

    #[test]
    fn create_entry_bumps_parent_valence() {
        let device = format_volume(64);
        let mut volume = HfsVolume::mount(device, false).unwrap();
        let sub_cnid = volume.create_entry(ROOT_DIR_ID, "Sub", true).unwrap();
        volume.create_entry(sub_cnid, "Inner", false).unwrap();
        let info = volume.directory_record(sub_cnid).unwrap().unwrap();
        assert_eq!(info.valence, 1);
    }

    #[test]
    fn fork_write_flush_and_reopen_round_trips_through_catalog() {
        let device = format_volume(64);
        let mut volume = HfsVolume::mount(device, false).unwrap();
        let cnid = volume.create_entry(ROOT_DIR_ID, "Memo", false).unwrap();
        let entry = volume.register_entry(cnid, ROOT_DIR_ID, "Memo".to_string(), false);

        {
            let mut fd = volume
                .open_fork(entry, cnid, Part::DataFork, Mode::ReadWrite)
                .unwrap();
            fd.write(b"hello hfs").unwrap();
            fd.flush().unwrap();
            fd.invalidate();
        }
        volume.release_fork(entry, Part::DataFork, Mode::ReadWrite);

        let mut fd = volume
            .open_fork(entry, cnid, Part::DataFork, Mode::ReadOnly)
            .unwrap();
        assert_eq!(fd.eof(), 9);
        let mut buf = [0u8; 9];
        fd.read(&mut buf).unwrap();
        assert_eq!(&buf, b"hello hfs");
        fd.invalidate();
        volume.release_fork(entry, Part::DataFork, Mode::ReadOnly);
    }

    #[test]
    fn delete_file_frees_extents_and_drops_valence() {
        let device = format_volume(64);
        let mut volume = HfsVolume::mount(device, false).unwrap();
        let sub_cnid = volume.create_entry(ROOT_DIR_ID, "Sub", true).unwrap();
        let cnid = volume.create_entry(sub_cnid, "Memo", false).unwrap();
        let entry = volume.register_entry(cnid, sub_cnid, "Memo".to_string(), false);

        {
            let mut fd = volume
                .open_fork(entry, cnid, Part::DataFork, Mode::ReadWrite)
                .unwrap();
            fd.write(b"junk").unwrap();
            fd.flush().unwrap();
            fd.invalidate();
        }
        volume.release_fork(entry, Part::DataFork, Mode::ReadWrite);

        volume.delete_file(entry).unwrap();
        assert_eq!(volume.directory_record(sub_cnid).unwrap().unwrap().valence, 0);
        assert!(volume.resolve_thread(cnid).is_err());
    }

    #[test]
    fn format_then_mount_round_trips_through_close_all() {
        let device = MemoryDevice::zeroed(64);
        let mut volume = HfsVolume::format(device, "Formatted", 1, false, 64).unwrap();
        let cnid = volume.create_entry(ROOT_DIR_ID, "Doc", false).unwrap();
        assert_eq!(volume.get_vol_dir_entry().unwrap().valence, 1);
        volume.close_all().unwrap();
        assert_eq!(volume.mode(), FsMode::Disposed);

        let raw = volume.into_device();
        let mut reopened = HfsVolume::mount(raw, false).unwrap();
        let thread = reopened.resolve_thread(cnid).unwrap();
        assert_eq!(thread.name, "Doc");
    }
}
