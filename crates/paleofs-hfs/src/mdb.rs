//! HFS Master Directory Block (spec §6).
//!
//! Lives at logical block 2 (signature `0x4244`), replicated at
//! `last_block - 1`. Carries the volume's free/total block counts, clump
//! size, next-CNID hint, and embedded extent records for the catalog and
//! extents-overflow files.

use crate::error::HfsError;
use crate::extents::ExtentRecord;
use crate::time::HfsTime;

pub const MDB_SIGNATURE: u16 = 0x4244;
pub const MDB_BLOCK: u32 = 2;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VolumeAttributes: u16 {
        /// Bit 8: volume was unmounted cleanly.
        const UNMOUNTED_CLEANLY = 1 << 8;
        const HARDWARE_LOCK = 1 << 7;
        const SOFTWARE_LOCK = 1 << 15;
    }
}

#[derive(Debug, Clone)]
pub struct MasterDirectoryBlock {
    pub signature: u16,
    pub create_date: HfsTime,
    pub modify_date: HfsTime,
    pub backup_date: HfsTime,
    pub attributes: VolumeAttributes,
    pub file_count: u32,
    pub directory_count: u32,
    pub alloc_block_start: u16,
    pub block_size: u32,
    pub total_blocks: u16,
    pub clump_size: u32,
    pub next_alloc_hint: u16,
    pub next_catalog_id: u32,
    pub free_blocks: u16,
    pub volume_name: String,
    pub catalog_file_extents: ExtentRecord,
    pub catalog_file_size: u32,
    pub extents_file_extents: ExtentRecord,
    pub extents_file_size: u32,
}

impl MasterDirectoryBlock {
    pub fn parse(block: &[u8; 512]) -> Result<Self, HfsError> {
        let signature = u16::from_be_bytes([block[0], block[1]]);
        if signature != MDB_SIGNATURE {
            return Err(HfsError::BadSignature(signature));
        }
        let name_len = block[0x3A] as usize;
        if name_len > 27 {
            return Err(HfsError::Corrupt("volume name length out of range"));
        }
        let volume_name =
            String::from_utf8_lossy(&block[0x3B..0x3B + name_len]).into_owned();

        Ok(Self {
            signature,
            create_date: HfsTime(u32::from_be_bytes(block[0x02..0x06].try_into().unwrap())),
            modify_date: HfsTime(u32::from_be_bytes(block[0x06..0x0A].try_into().unwrap())),
            backup_date: HfsTime(u32::from_be_bytes(block[0x0A..0x0E].try_into().unwrap())),
            attributes: VolumeAttributes::from_bits_truncate(u16::from_be_bytes(
                block[0x0E..0x10].try_into().unwrap(),
            )),
            file_count: u32::from(u16::from_be_bytes(block[0x10..0x12].try_into().unwrap())),
            directory_count: u32::from(u16::from_be_bytes(block[0x12..0x14].try_into().unwrap())),
            alloc_block_start: u16::from_be_bytes(block[0x14..0x16].try_into().unwrap()),
            block_size: u32::from_be_bytes(block[0x16..0x1A].try_into().unwrap()),
            total_blocks: u16::from_be_bytes(block[0x1A..0x1C].try_into().unwrap()),
            clump_size: u32::from_be_bytes(block[0x1C..0x20].try_into().unwrap()),
            next_alloc_hint: u16::from_be_bytes(block[0x20..0x22].try_into().unwrap()),
            next_catalog_id: u32::from_be_bytes(block[0x22..0x26].try_into().unwrap()),
            free_blocks: u16::from_be_bytes(block[0x26..0x28].try_into().unwrap()),
            volume_name,
            catalog_file_extents: ExtentRecord::parse(&block[0x56..0x62].try_into().unwrap()),
            catalog_file_size: u32::from_be_bytes(block[0x52..0x56].try_into().unwrap()),
            extents_file_extents: ExtentRecord::parse(&block[0x4A..0x56].try_into().unwrap()),
            extents_file_size: u32::from_be_bytes(block[0x46..0x4A].try_into().unwrap()),
        })
    }

    pub fn serialize(&self, block: &mut [u8; 512]) {
        block.fill(0);
        block[0..2].copy_from_slice(&self.signature.to_be_bytes());
        block[0x02..0x06].copy_from_slice(&self.create_date.0.to_be_bytes());
        block[0x06..0x0A].copy_from_slice(&self.modify_date.0.to_be_bytes());
        block[0x0A..0x0E].copy_from_slice(&self.backup_date.0.to_be_bytes());
        block[0x0E..0x10].copy_from_slice(&self.attributes.bits().to_be_bytes());
        block[0x10..0x12].copy_from_slice(&(self.file_count as u16).to_be_bytes());
        block[0x12..0x14].copy_from_slice(&(self.directory_count as u16).to_be_bytes());
        block[0x14..0x16].copy_from_slice(&self.alloc_block_start.to_be_bytes());
        block[0x16..0x1A].copy_from_slice(&self.block_size.to_be_bytes());
        block[0x1A..0x1C].copy_from_slice(&self.total_blocks.to_be_bytes());
        block[0x1C..0x20].copy_from_slice(&self.clump_size.to_be_bytes());
        block[0x20..0x22].copy_from_slice(&self.next_alloc_hint.to_be_bytes());
        block[0x22..0x26].copy_from_slice(&self.next_catalog_id.to_be_bytes());
        block[0x26..0x28].copy_from_slice(&self.free_blocks.to_be_bytes());
        let name_bytes = self.volume_name.as_bytes();
        let len = name_bytes.len().min(27);
        block[0x3A] = len as u8;
        block[0x3B..0x3B + len].copy_from_slice(&name_bytes[..len]);
        block[0x46..0x4A].copy_from_slice(&self.extents_file_size.to_be_bytes());
        self.extents_file_extents
            .serialize(&mut block[0x4A..0x56].try_into().unwrap());
        block[0x52..0x56].copy_from_slice(&self.catalog_file_size.to_be_bytes());
        self.catalog_file_extents
            .serialize(&mut block[0x56..0x62].try_into().unwrap());
    }

    pub fn is_unmounted_cleanly(&self) -> bool {
        self.attributes.contains(VolumeAttributes::UNMOUNTED_CLEANLY)
    }

    pub fn alternate_mdb_block(&self) -> u32 {
        self.total_blocks as u32 - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MasterDirectoryBlock {
        MasterDirectoryBlock {
            signature: MDB_SIGNATURE,
            create_date: HfsTime(1000),
            modify_date: HfsTime(2000),
            backup_date: HfsTime(0),
            attributes: VolumeAttributes::UNMOUNTED_CLEANLY,
            file_count: 3,
            directory_count: 1,
            alloc_block_start: 5,
            block_size: 1024,
            total_blocks: 400,
            clump_size: 4096,
            next_alloc_hint: 10,
            next_catalog_id: 20,
            free_blocks: 300,
            volume_name: "TestVol".into(),
            catalog_file_extents: ExtentRecord::default(),
            catalog_file_size: 8192,
            extents_file_extents: ExtentRecord::default(),
            extents_file_size: 1024,
        }
    }

    #[test]
    fn round_trips_through_bytes() {
        let mdb = sample();
        let mut block = [0u8; 512];
        mdb.serialize(&mut block);
        let parsed = MasterDirectoryBlock::parse(&block).unwrap();
        assert_eq!(parsed.volume_name, "TestVol");
        assert_eq!(parsed.total_blocks, 400);
        assert!(parsed.is_unmounted_cleanly());
    }

    #[test]
    fn rejects_bad_signature() {
        let block = [0u8; 512];
        assert!(matches!(
            MasterDirectoryBlock::parse(&block),
            Err(HfsError::BadSignature(0))
        ));
    }
}
