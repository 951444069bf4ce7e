//! Binary II and AppleSingle/AppleDouble header layouts (spec §6). Both are
//! read-only here — the "hard part" of these formats is the record
//! layout, not a stream codec, so there is nothing for `flate2`/
//! `crc32fast` to do.

use crate::error::{ArchiveError, Result};

pub const BINARY2_SIGNATURE: [u8; 3] = [0x0A, b'G', b'L'];
pub const BINARY2_RECORD_SIZE: usize = 128;

/// One 128-byte Binary II record header preceding a (possibly padded)
/// file's data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary2Header {
    pub access: u8,
    pub file_type: u8,
    pub aux_type: u16,
    pub storage_type: u8,
    pub blocks_used: u16,
    pub mod_date: u16,
    pub mod_time: u16,
    pub eof: u32,
    pub name: String,
    pub num_files_remaining: u16,
}

impl Binary2Header {
    pub fn parse(bytes: &[u8; BINARY2_RECORD_SIZE]) -> Result<Self> {
        if bytes[0..3] != BINARY2_SIGNATURE {
            return Err(ArchiveError::BadSignature {
                expected: &BINARY2_SIGNATURE,
                found: bytes[0..3].to_vec(),
            });
        }
        let name_len = bytes[17] as usize;
        if name_len > 15 {
            return Err(ArchiveError::Corrupt("binary ii name length out of range"));
        }
        let name = String::from_utf8_lossy(&bytes[18..18 + name_len]).into_owned();
        Ok(Self {
            access: bytes[4],
            file_type: bytes[5],
            aux_type: u16::from_le_bytes([bytes[6], bytes[7]]),
            storage_type: bytes[8],
            blocks_used: u16::from_le_bytes([bytes[9], bytes[10]]),
            mod_date: u16::from_le_bytes([bytes[11], bytes[12]]),
            mod_time: u16::from_le_bytes([bytes[13], bytes[14]]),
            eof: u32::from_le_bytes([bytes[33], bytes[34], bytes[35], 0]),
            name,
            num_files_remaining: u16::from_le_bytes([bytes[37], bytes[38]]),
        })
    }

    pub fn serialize(&self) -> [u8; BINARY2_RECORD_SIZE] {
        let mut out = [0u8; BINARY2_RECORD_SIZE];
        out[0..3].copy_from_slice(&BINARY2_SIGNATURE);
        out[4] = self.access;
        out[5] = self.file_type;
        out[6..8].copy_from_slice(&self.aux_type.to_le_bytes());
        out[8] = self.storage_type;
        out[9..11].copy_from_slice(&self.blocks_used.to_le_bytes());
        out[11..13].copy_from_slice(&self.mod_date.to_le_bytes());
        out[13..15].copy_from_slice(&self.mod_time.to_le_bytes());
        let name_bytes = self.name.as_bytes();
        let len = name_bytes.len().min(15);
        out[17] = len as u8;
        out[18..18 + len].copy_from_slice(&name_bytes[..len]);
        let eof = self.eof.to_le_bytes();
        out[33..36].copy_from_slice(&eof[0..3]);
        out[37..39].copy_from_slice(&self.num_files_remaining.to_le_bytes());
        out
    }

    /// Total on-stream size of the data following this header, rounded up
    /// to the 128-byte boundary Binary II pads every file to.
    pub fn padded_data_len(&self) -> usize {
        (self.eof as usize).div_ceil(BINARY2_RECORD_SIZE) * BINARY2_RECORD_SIZE
    }
}

pub const APPLESINGLE_MAGIC: u32 = 0x0005_1600;
pub const APPLEDOUBLE_MAGIC: u32 = 0x0005_1607;
const VERSION_1: u32 = 0x0001_0000;
const VERSION_2: u32 = 0x0002_0000;
pub const HEADER_SIZE: usize = 26;
pub const ENTRY_DESCRIPTOR_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApleFlavor {
    Single,
    Double,
}

/// Well-known AppleSingle/AppleDouble entry IDs (there is no exhaustive
/// registry check here — unknown IDs just pass through as raw ranges).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryId {
    DataFork,
    ResourceFork,
    RealName,
    Comment,
    FileDatesInfo,
    FinderInfo,
    ProdosFileInfo,
    Other(u32),
}

impl EntryId {
    fn from_u32(id: u32) -> Self {
        match id {
            1 => EntryId::DataFork,
            2 => EntryId::ResourceFork,
            3 => EntryId::RealName,
            4 => EntryId::Comment,
            8 => EntryId::FileDatesInfo,
            9 => EntryId::FinderInfo,
            11 => EntryId::ProdosFileInfo,
            other => EntryId::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryDescriptor {
    pub id: EntryId,
    pub offset: u32,
    pub length: u32,
}

#[derive(Debug, Clone)]
pub struct AppleSingleHeader {
    pub flavor: ApleFlavor,
    pub entries: Vec<EntryDescriptor>,
}

impl AppleSingleHeader {
    /// Parses the fixed 26-byte header plus the entry descriptor list that
    /// immediately follows it (spec §6: "26-byte header; entry descriptor
    /// list").
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(ArchiveError::Corrupt("applesingle header truncated"));
        }
        let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let flavor = match magic {
            APPLESINGLE_MAGIC => ApleFlavor::Single,
            APPLEDOUBLE_MAGIC => ApleFlavor::Double,
            _ => {
                return Err(ArchiveError::BadSignature {
                    expected: b"\x00\x05\x16\x00 or \x00\x05\x16\x07",
                    found: bytes[0..4].to_vec(),
                })
            }
        };
        let version = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != VERSION_1 && version != VERSION_2 {
            return Err(ArchiveError::UnsupportedVersion(version));
        }
        let num_entries = u16::from_be_bytes([bytes[24], bytes[25]]) as usize;
        let mut entries = Vec::with_capacity(num_entries);
        let mut off = HEADER_SIZE;
        for _ in 0..num_entries {
            if off + ENTRY_DESCRIPTOR_SIZE > bytes.len() {
                return Err(ArchiveError::Corrupt("applesingle entry list truncated"));
            }
            let id = u32::from_be_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]]);
            let offset = u32::from_be_bytes([
                bytes[off + 4],
                bytes[off + 5],
                bytes[off + 6],
                bytes[off + 7],
            ]);
            let length = u32::from_be_bytes([
                bytes[off + 8],
                bytes[off + 9],
                bytes[off + 10],
                bytes[off + 11],
            ]);
            entries.push(EntryDescriptor {
                id: EntryId::from_u32(id),
                offset,
                length,
            });
            off += ENTRY_DESCRIPTOR_SIZE;
        }
        Ok(Self { flavor, entries })
    }

    pub fn data_fork<'a>(&self, stream: &'a [u8]) -> Option<&'a [u8]> {
        self.entries
            .iter()
            .find(|e| e.id == EntryId::DataFork)
            .map(|e| &stream[e.offset as usize..(e.offset + e.length) as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_binary2() -> Binary2Header {
        Binary2Header {
            access: 0xC3,
            file_type: 0x04,
            aux_type: 0,
            storage_type: 1,
            blocks_used: 2,
            mod_date: 0,
            mod_time: 0,
            eof: 512,
            name: "HELLO.TXT".to_string(),
            num_files_remaining: 0,
        }
    }

    #[test]
    fn binary2_header_round_trips() {
        let header = sample_binary2();
        let bytes = header.serialize();
        let parsed = Binary2Header::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.padded_data_len(), 512);
    }

    #[test]
    fn binary2_rejects_bad_signature() {
        let mut bytes = sample_binary2().serialize();
        bytes[0] = 0;
        assert!(matches!(
            Binary2Header::parse(&bytes),
            Err(ArchiveError::BadSignature { .. })
        ));
    }

    #[test]
    fn applesingle_header_finds_data_fork() {
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&APPLESINGLE_MAGIC.to_be_bytes());
        bytes[4..8].copy_from_slice(&VERSION_1.to_be_bytes());
        bytes[24..26].copy_from_slice(&1u16.to_be_bytes());
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&(HEADER_SIZE as u32 + ENTRY_DESCRIPTOR_SIZE as u32).to_be_bytes());
        bytes.extend_from_slice(&5u32.to_be_bytes());
        bytes.extend_from_slice(b"hello");

        let header = AppleSingleHeader::parse(&bytes).unwrap();
        assert_eq!(header.flavor, ApleFlavor::Single);
        assert_eq!(header.data_fork(&bytes), Some(&b"hello"[..]));
    }
}
