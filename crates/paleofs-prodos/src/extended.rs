//! ProDOS extended (GS/OS) key block: fuses a data fork and a resource
//! fork under one directory entry via a dedicated 512-byte block holding
//! two fork descriptors plus optional Finder info (spec §3 "ProDOS
//! extended info block").

use crate::directory::StorageType;

/// One fork's storage description, identical in shape to the leading
/// fields of a normal [`crate::directory::FileEntry`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ForkDescriptor {
    pub storage_type: u8,
    pub key_pointer: u16,
    pub blocks_used: u16,
    pub eof: u32,
}

impl ForkDescriptor {
    fn parse(bytes: &[u8]) -> Self {
        Self {
            storage_type: bytes[0] >> 4,
            key_pointer: u16::from_le_bytes([bytes[1], bytes[2]]),
            blocks_used: u16::from_le_bytes([bytes[3], bytes[4]]),
            eof: u32::from_le_bytes([bytes[5], bytes[6], bytes[7], 0]),
        }
    }

    fn serialize(self, bytes: &mut [u8]) {
        bytes[0] = self.storage_type << 4;
        bytes[1..3].copy_from_slice(&self.key_pointer.to_le_bytes());
        bytes[3..5].copy_from_slice(&self.blocks_used.to_le_bytes());
        bytes[5..8].copy_from_slice(&self.eof.to_le_bytes()[..3]);
    }

    pub fn storage_kind(self) -> StorageType {
        StorageType::from_nibble(self.storage_type)
    }
}

/// HFS-style type/creator tag GS/OS attaches to an extended file; kept
/// separate from [`ForkDescriptor`] since only the data fork half of the
/// key block carries it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinderInfo {
    pub file_type: u32,
    pub creator: [u8; 4],
    pub flags: u16,
}

impl FinderInfo {
    fn parse(bytes: &[u8]) -> Self {
        Self {
            file_type: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
            creator: bytes[4..8].try_into().unwrap(),
            flags: u16::from_be_bytes(bytes[8..10].try_into().unwrap()),
        }
    }

    fn serialize(self, bytes: &mut [u8]) {
        bytes[0..4].copy_from_slice(&self.file_type.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.creator);
        bytes[8..10].copy_from_slice(&self.flags.to_be_bytes());
    }
}

/// The extended key block itself: data-fork descriptor at offset 0,
/// resource-fork descriptor at offset 0x100, with each half's trailing
/// bytes free for the optional Finder-info payload.
#[derive(Debug, Clone, Default)]
pub struct ExtendedKeyBlock {
    pub data: ForkDescriptor,
    pub rsrc: ForkDescriptor,
    pub finder_info: Option<FinderInfo>,
}

impl ExtendedKeyBlock {
    pub fn parse(block: &[u8; 512]) -> Self {
        let data = ForkDescriptor::parse(&block[0x00..0x08]);
        let rsrc = ForkDescriptor::parse(&block[0x100..0x108]);
        let has_finder_info = block[0x08] != 0 || block[0x09..0x12].iter().any(|b| *b != 0);
        let finder_info = has_finder_info.then(|| FinderInfo::parse(&block[0x08..0x12]));
        Self { data, rsrc, finder_info }
    }

    pub fn serialize(&self) -> [u8; 512] {
        let mut block = [0u8; 512];
        self.data.serialize(&mut block[0x00..0x08]);
        self.rsrc.serialize(&mut block[0x100..0x108]);
        if let Some(info) = self.finder_info {
            info.serialize(&mut block[0x08..0x12]);
        }
        block
    }

    /// The invariant from spec §3: `blocks_used == data + rsrc + 1` (the
    /// key block itself), `eof == 512`.
    pub fn blocks_used(&self) -> u16 {
        self.data.blocks_used + self.rsrc.blocks_used + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_key_block_round_trips_both_forks() {
        let mut xkb = ExtendedKeyBlock {
            data: ForkDescriptor {
                storage_type: StorageType::Sapling.to_nibble(),
                key_pointer: 20,
                blocks_used: 5,
                eof: 2000,
            },
            rsrc: ForkDescriptor {
                storage_type: StorageType::Seedling.to_nibble(),
                key_pointer: 30,
                blocks_used: 1,
                eof: 100,
            },
            finder_info: None,
        };
        xkb.finder_info = Some(FinderInfo {
            file_type: 0x54455854,
            creator: *b"CWIE",
            flags: 0,
        });
        let bytes = xkb.serialize();
        let parsed = ExtendedKeyBlock::parse(&bytes);
        assert_eq!(parsed.data.key_pointer, 20);
        assert_eq!(parsed.rsrc.eof, 100);
        assert_eq!(parsed.finder_info.unwrap().creator, *b"CWIE");
        assert_eq!(parsed.blocks_used(), 5 + 1 + 1);
    }
}
