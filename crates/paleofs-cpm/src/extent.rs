//! CP/M extent chain (spec §3 "CP/M extent chain"): one 32-byte directory
//! entry per extent, linked to its file by matching (user, name,
//! extension); extent-number gives order, sparse extents are permitted.

pub const RECORD_SIZE: usize = 128;
pub const ALLOC_BLOCK_SIZE: usize = 1024;
pub const RECORDS_PER_ALLOC_BLOCK: usize = ALLOC_BLOCK_SIZE / RECORD_SIZE;
pub const RECORDS_PER_EXTENT: usize = 128;
pub const BLOCKS_PER_EXTENT: usize = 16;
pub const DIR_ENTRY_SIZE: usize = 32;
pub const DELETED_USER: u8 = 0xE5;

/// Identifies a file independent of any one extent: CP/M has no
/// directory hierarchy, only a flat namespace partitioned by user number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    pub user: u8,
    pub name: [u8; 8],
    pub ext: [u8; 3],
}

impl FileId {
    /// Trimmed, flag-bit-masked "NAME.EXT" form for display. CP/M stores
    /// read-only/system/archive flags in the high bit of the extension
    /// (and sometimes name) bytes, so those bits are masked off here.
    pub fn display_name(&self) -> String {
        let name: String = self
            .name
            .iter()
            .map(|b| (b & 0x7F) as char)
            .collect::<String>()
            .trim_end()
            .to_string();
        let ext: String = self
            .ext
            .iter()
            .map(|b| (b & 0x7F) as char)
            .collect::<String>()
            .trim_end()
            .to_string();
        if ext.is_empty() {
            name
        } else {
            format!("{name}.{ext}")
        }
    }
}

/// One 32-byte directory entry: one extent of one file's data.
#[derive(Debug, Clone, Copy)]
pub struct ExtentRecord {
    pub user: u8,
    pub name: [u8; 8],
    pub ext: [u8; 3],
    pub extent_lo: u8,
    pub s1: u8,
    pub extent_hi: u8,
    pub record_count: u8,
    pub blocks: [u8; BLOCKS_PER_EXTENT],
}

impl ExtentRecord {
    pub fn parse(bytes: &[u8; DIR_ENTRY_SIZE]) -> Self {
        let mut name = [0u8; 8];
        name.copy_from_slice(&bytes[1..9]);
        let mut ext = [0u8; 3];
        ext.copy_from_slice(&bytes[9..12]);
        let mut blocks = [0u8; BLOCKS_PER_EXTENT];
        blocks.copy_from_slice(&bytes[16..32]);
        Self {
            user: bytes[0],
            name,
            ext,
            extent_lo: bytes[12],
            s1: bytes[13],
            extent_hi: bytes[14],
            record_count: bytes[15],
            blocks,
        }
    }

    pub fn serialize(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut out = [0u8; DIR_ENTRY_SIZE];
        out[0] = self.user;
        out[1..9].copy_from_slice(&self.name);
        out[9..12].copy_from_slice(&self.ext);
        out[12] = self.extent_lo;
        out[13] = self.s1;
        out[14] = self.extent_hi;
        out[15] = self.record_count;
        out[16..32].copy_from_slice(&self.blocks);
        out
    }

    pub fn is_deleted(&self) -> bool {
        self.user == DELETED_USER
    }

    pub fn id(&self) -> FileId {
        FileId { user: self.user, name: self.name, ext: self.ext }
    }

    /// Logical extent number: low 5 bits from `extent_lo`, high bits from
    /// `extent_hi` shifted up (spec §3's "extent-number provides order").
    pub fn extent_number(&self) -> u32 {
        (self.extent_lo as u32 & 0x1F) | ((self.extent_hi as u32) << 5)
    }

    pub fn set_extent_number(&mut self, n: u32) {
        self.extent_lo = (n & 0x1F) as u8;
        self.extent_hi = (n >> 5) as u8;
    }

    /// Bytes of real data this extent's `record_count` claims, used to
    /// derive a file's logical length from its highest extent.
    pub fn claimed_bytes(&self) -> u64 {
        self.record_count as u64 * RECORD_SIZE as u64
    }

    pub fn new_for(id: FileId, extent_number: u32) -> Self {
        let mut rec = Self {
            user: id.user,
            name: id.name,
            ext: id.ext,
            extent_lo: 0,
            s1: 0,
            extent_hi: 0,
            record_count: 0,
            blocks: [0; BLOCKS_PER_EXTENT],
        };
        rec.set_extent_number(extent_number);
        rec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extent_record_round_trips() {
        let mut rec = ExtentRecord::new_for(
            FileId { user: 0, name: *b"HELLO   ", ext: *b"TXT" },
            33,
        );
        rec.record_count = 10;
        rec.blocks[0] = 5;
        let bytes = rec.serialize();
        let parsed = ExtentRecord::parse(&bytes);
        assert_eq!(parsed.extent_number(), 33);
        assert_eq!(parsed.id().display_name(), "HELLO.TXT");
        assert_eq!(parsed.blocks[0], 5);
    }

    #[test]
    fn deleted_user_marks_entry_free() {
        let mut rec = ExtentRecord::new_for(FileId { user: 0, name: [0x20; 8], ext: [0x20; 3] }, 0);
        rec.user = DELETED_USER;
        assert!(rec.is_deleted());
    }
}
