//! ProDOS volume/subdirectory headers and file entries (spec §6): fixed
//! 39-byte (`0x27`) entries, 13 per 512-byte directory block, blocks
//! linked forward/backward by a 4-byte header at the start of each block.

use crate::error::ProdosError;
use crate::time::ProdosTime;

pub const ENTRY_LENGTH: usize = 0x27;
pub const ENTRIES_PER_BLOCK: usize = 13;
pub const VOLUME_DIR_BLOCK: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Deleted,
    Seedling,
    Sapling,
    Tree,
    PascalArea,
    Extended,
    Directory,
    SubdirHeader,
    VolumeHeader,
    Unknown(u8),
}

impl StorageType {
    pub fn from_nibble(n: u8) -> Self {
        match n {
            0x0 => Self::Deleted,
            0x1 => Self::Seedling,
            0x2 => Self::Sapling,
            0x3 => Self::Tree,
            0x4 => Self::PascalArea,
            0x5 => Self::Extended,
            0xD => Self::Directory,
            0xE => Self::SubdirHeader,
            0xF => Self::VolumeHeader,
            other => Self::Unknown(other),
        }
    }

    pub fn to_nibble(self) -> u8 {
        match self {
            Self::Deleted => 0x0,
            Self::Seedling => 0x1,
            Self::Sapling => 0x2,
            Self::Tree => 0x3,
            Self::PascalArea => 0x4,
            Self::Extended => 0x5,
            Self::Directory => 0xD,
            Self::SubdirHeader => 0xE,
            Self::VolumeHeader => 0xF,
            Self::Unknown(n) => n,
        }
    }

    pub fn is_directory_like(self) -> bool {
        matches!(self, Self::Directory)
    }
}

/// 4-byte link header at the start of every directory block (volume
/// directory and subdirectory blocks alike).
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockLinks {
    pub prev_block: u16,
    pub next_block: u16,
}

impl BlockLinks {
    pub fn parse(block: &[u8; 512]) -> Self {
        Self {
            prev_block: u16::from_le_bytes([block[0], block[1]]),
            next_block: u16::from_le_bytes([block[2], block[3]]),
        }
    }

    pub fn serialize(self, block: &mut [u8; 512]) {
        block[0..2].copy_from_slice(&self.prev_block.to_le_bytes());
        block[2..4].copy_from_slice(&self.next_block.to_le_bytes());
    }
}

fn read_name(bytes: &[u8], name_length: u8) -> String {
    let len = (name_length as usize).min(15);
    String::from_utf8_lossy(&bytes[..len]).into_owned()
}

fn write_name(name: &str, out: &mut [u8; 15]) -> u8 {
    let bytes = name.as_bytes();
    let len = bytes.len().min(15);
    out[..len].copy_from_slice(&bytes[..len]);
    len as u8
}

/// The volume directory header: first entry of block 2.
#[derive(Debug, Clone)]
pub struct VolumeHeader {
    pub volume_name: String,
    pub creation: ProdosTime,
    pub access: u8,
    pub entry_length: u8,
    pub entries_per_block: u8,
    pub file_count: u16,
    pub bit_map_pointer: u16,
    pub total_blocks: u16,
}

impl VolumeHeader {
    pub fn parse(record: &[u8; ENTRY_LENGTH]) -> Result<Self, ProdosError> {
        let storage_and_len = record[0];
        if StorageType::from_nibble(storage_and_len >> 4) != StorageType::VolumeHeader {
            return Err(ProdosError::BadVolumeHeader(VOLUME_DIR_BLOCK));
        }
        let name_length = storage_and_len & 0x0F;
        Ok(Self {
            volume_name: read_name(&record[1..16], name_length),
            creation: ProdosTime::from_bytes(&record[0x18..0x1C].try_into().unwrap()),
            access: record[0x1E],
            entry_length: record[0x1F],
            entries_per_block: record[0x20],
            file_count: u16::from_le_bytes([record[0x21], record[0x22]]),
            bit_map_pointer: u16::from_le_bytes([record[0x23], record[0x24]]),
            total_blocks: u16::from_le_bytes([record[0x25], record[0x26]]),
        })
    }

    pub fn serialize(&self) -> [u8; ENTRY_LENGTH] {
        let mut out = [0u8; ENTRY_LENGTH];
        let mut name_bytes = [0u8; 15];
        let name_len = write_name(&self.volume_name, &mut name_bytes);
        out[0] = (StorageType::VolumeHeader.to_nibble() << 4) | (name_len & 0x0F);
        out[1..16].copy_from_slice(&name_bytes);
        out[0x18..0x1C].copy_from_slice(&self.creation.to_bytes());
        out[0x1E] = self.access;
        out[0x1F] = self.entry_length;
        out[0x20] = self.entries_per_block;
        out[0x21..0x23].copy_from_slice(&self.file_count.to_le_bytes());
        out[0x23..0x25].copy_from_slice(&self.bit_map_pointer.to_le_bytes());
        out[0x25..0x27].copy_from_slice(&self.total_blocks.to_le_bytes());
        out
    }
}

/// A subdirectory's own header entry, occupying the first slot of its key
/// block, pointing back to the parent entry that names it.
#[derive(Debug, Clone)]
pub struct SubdirHeader {
    pub dir_name: String,
    pub creation: ProdosTime,
    pub access: u8,
    pub entry_length: u8,
    pub entries_per_block: u8,
    pub file_count: u16,
    pub parent_pointer: u16,
    pub parent_entry_number: u8,
    pub parent_entry_length: u8,
}

impl SubdirHeader {
    pub fn parse(record: &[u8; ENTRY_LENGTH]) -> Result<Self, ProdosError> {
        let storage_and_len = record[0];
        if StorageType::from_nibble(storage_and_len >> 4) != StorageType::SubdirHeader {
            return Err(ProdosError::Corrupt("expected subdirectory header entry"));
        }
        let name_length = storage_and_len & 0x0F;
        Ok(Self {
            dir_name: read_name(&record[1..16], name_length),
            creation: ProdosTime::from_bytes(&record[0x18..0x1C].try_into().unwrap()),
            access: record[0x1E],
            entry_length: record[0x1F],
            entries_per_block: record[0x20],
            file_count: u16::from_le_bytes([record[0x21], record[0x22]]),
            parent_pointer: u16::from_le_bytes([record[0x23], record[0x24]]),
            parent_entry_number: record[0x25],
            parent_entry_length: record[0x26],
        })
    }

    pub fn serialize(&self) -> [u8; ENTRY_LENGTH] {
        let mut out = [0u8; ENTRY_LENGTH];
        let mut name_bytes = [0u8; 15];
        let name_len = write_name(&self.dir_name, &mut name_bytes);
        out[0] = (StorageType::SubdirHeader.to_nibble() << 4) | (name_len & 0x0F);
        out[1..16].copy_from_slice(&name_bytes);
        out[0x10] = 0x75; // fixed per the ProDOS 8 Technical Reference
        out[0x18..0x1C].copy_from_slice(&self.creation.to_bytes());
        out[0x1E] = self.access;
        out[0x1F] = self.entry_length;
        out[0x20] = self.entries_per_block;
        out[0x21..0x23].copy_from_slice(&self.file_count.to_le_bytes());
        out[0x23..0x25].copy_from_slice(&self.parent_pointer.to_le_bytes());
        out[0x25] = self.parent_entry_number;
        out[0x26] = self.parent_entry_length;
        out
    }
}

/// A normal file or directory reference entry.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub storage_type: StorageType,
    pub name: String,
    pub file_type: u8,
    pub key_pointer: u16,
    pub blocks_used: u16,
    pub eof: u32,
    pub creation: ProdosTime,
    pub access: u8,
    pub aux_type: u16,
    pub last_mod: ProdosTime,
    pub header_pointer: u16,
}

impl Default for FileEntry {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Deleted,
            name: String::new(),
            file_type: 0,
            key_pointer: 0,
            blocks_used: 0,
            eof: 0,
            creation: ProdosTime::default(),
            access: 0xC3,
            aux_type: 0,
            last_mod: ProdosTime::default(),
            header_pointer: 0,
        }
    }
}

impl FileEntry {
    pub fn is_deleted(&self) -> bool {
        matches!(self.storage_type, StorageType::Deleted)
    }

    pub fn parse(record: &[u8; ENTRY_LENGTH]) -> Self {
        let storage_and_len = record[0];
        let storage_type = StorageType::from_nibble(storage_and_len >> 4);
        let name_length = storage_and_len & 0x0F;
        let eof = u32::from_le_bytes([record[0x15], record[0x16], record[0x17], 0]);
        Self {
            storage_type,
            name: read_name(&record[1..16], name_length),
            file_type: record[0x10],
            key_pointer: u16::from_le_bytes([record[0x11], record[0x12]]),
            blocks_used: u16::from_le_bytes([record[0x13], record[0x14]]),
            eof,
            creation: ProdosTime::from_bytes(&record[0x18..0x1C].try_into().unwrap()),
            access: record[0x1E],
            aux_type: u16::from_le_bytes([record[0x1F], record[0x20]]),
            last_mod: ProdosTime::from_bytes(&record[0x21..0x25].try_into().unwrap()),
            header_pointer: u16::from_le_bytes([record[0x25], record[0x26]]),
        }
    }

    pub fn serialize(&self) -> [u8; ENTRY_LENGTH] {
        let mut out = [0u8; ENTRY_LENGTH];
        let mut name_bytes = [0u8; 15];
        let name_len = write_name(&self.name, &mut name_bytes);
        out[0] = (self.storage_type.to_nibble() << 4) | (name_len & 0x0F);
        out[1..16].copy_from_slice(&name_bytes);
        out[0x10] = self.file_type;
        out[0x11..0x13].copy_from_slice(&self.key_pointer.to_le_bytes());
        out[0x13..0x15].copy_from_slice(&self.blocks_used.to_le_bytes());
        out[0x15..0x18].copy_from_slice(&self.eof.to_le_bytes()[..3]);
        out[0x18..0x1C].copy_from_slice(&self.creation.to_bytes());
        out[0x1E] = self.access;
        out[0x1F..0x21].copy_from_slice(&self.aux_type.to_le_bytes());
        out[0x21..0x25].copy_from_slice(&self.last_mod.to_bytes());
        out[0x25..0x27].copy_from_slice(&self.header_pointer.to_le_bytes());
        out
    }
}

/// Slices a 512-byte directory block into its link header and 13 fixed
/// 39-byte entry records (4 + 13*39 = 511; the trailing byte is unused).
pub fn entries(block: &[u8; 512]) -> (BlockLinks, [[u8; ENTRY_LENGTH]; ENTRIES_PER_BLOCK]) {
    let links = BlockLinks::parse(block);
    let mut out = [[0u8; ENTRY_LENGTH]; ENTRIES_PER_BLOCK];
    for (i, slot) in out.iter_mut().enumerate() {
        let off = 4 + i * ENTRY_LENGTH;
        slot.copy_from_slice(&block[off..off + ENTRY_LENGTH]);
    }
    (links, out)
}

pub fn write_block(links: BlockLinks, records: &[[u8; ENTRY_LENGTH]; ENTRIES_PER_BLOCK]) -> [u8; 512] {
    let mut block = [0u8; 512];
    links.serialize(&mut block);
    for (i, record) in records.iter().enumerate() {
        let off = 4 + i * ENTRY_LENGTH;
        block[off..off + ENTRY_LENGTH].copy_from_slice(record);
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_header_round_trips() {
        let header = VolumeHeader {
            volume_name: "MYDISK".into(),
            creation: ProdosTime::default(),
            access: 0xE3,
            entry_length: ENTRY_LENGTH as u8,
            entries_per_block: ENTRIES_PER_BLOCK as u8,
            file_count: 4,
            bit_map_pointer: 6,
            total_blocks: 1600,
        };
        let bytes = header.serialize();
        let parsed = VolumeHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.volume_name, "MYDISK");
        assert_eq!(parsed.total_blocks, 1600);
        assert_eq!(parsed.bit_map_pointer, 6);
    }

    #[test]
    fn subdir_header_round_trips() {
        let header = SubdirHeader {
            dir_name: "DOCS".into(),
            creation: ProdosTime::default(),
            access: 0xE3,
            entry_length: ENTRY_LENGTH as u8,
            entries_per_block: ENTRIES_PER_BLOCK as u8,
            file_count: 1,
            parent_pointer: 2,
            parent_entry_number: 3,
            parent_entry_length: ENTRY_LENGTH as u8,
        };
        let bytes = header.serialize();
        let parsed = SubdirHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.dir_name, "DOCS");
        assert_eq!(parsed.parent_pointer, 2);
        assert_eq!(parsed.parent_entry_number, 3);
    }

    #[test]
    fn file_entry_round_trips_eof_and_dates() {
        let mut entry = FileEntry {
            storage_type: StorageType::Sapling,
            name: "HELLO.TXT".into(),
            file_type: 0x04,
            key_pointer: 10,
            blocks_used: 3,
            eof: 70000,
            ..Default::default()
        };
        entry.last_mod = ProdosTime::from_naive(
            chrono::NaiveDate::from_ymd_opt(1990, 2, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
        );
        let bytes = entry.serialize();
        let parsed = FileEntry::parse(&bytes);
        assert_eq!(parsed.name, "HELLO.TXT");
        assert_eq!(parsed.eof, 70000);
        assert_eq!(parsed.key_pointer, 10);
        assert_eq!(parsed.last_mod, entry.last_mod);
    }

    #[test]
    fn directory_block_slices_thirteen_entries() {
        let links = BlockLinks { prev_block: 0, next_block: 5 };
        let mut records = [[0u8; ENTRY_LENGTH]; ENTRIES_PER_BLOCK];
        records[1][0] = (StorageType::Seedling.to_nibble() << 4) | 3;
        let block = write_block(links, &records);
        let (parsed_links, parsed_records) = entries(&block);
        assert_eq!(parsed_links.next_block, 5);
        assert_eq!(parsed_records[1][0] >> 4, StorageType::Seedling.to_nibble());
    }
}
