//! Catalog tree records and keys (spec §3, §6): directories, files, and
//! the thread records used for CNID-to-path reverse lookup.

use crate::btree::TreeKey;
use crate::error::HfsError;
use crate::extents::ExtentRecord;
use crate::time::HfsTime;

const DIR_RECORD: u8 = 1;
const FILE_RECORD: u8 = 2;
const DIR_THREAD_RECORD: u8 = 3;
const FILE_THREAD_RECORD: u8 = 4;

/// `(parent CNID, name)`, compared by CNID first and then by a
/// case-folded name ordering — HFS's own table covers Mac OS Roman
/// diacritics; we approximate it with an ASCII uppercase fold, which is
/// exact for the common case and documented as an open question in
/// DESIGN.md.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogKey {
    pub parent_cnid: u32,
    pub name: String,
}

impl CatalogKey {
    pub fn new(parent_cnid: u32, name: impl Into<String>) -> Self {
        Self {
            parent_cnid,
            name: name.into(),
        }
    }

    fn fold(&self) -> String {
        self.name.to_ascii_uppercase()
    }
}

impl PartialOrd for CatalogKey {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CatalogKey {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.parent_cnid
            .cmp(&other.parent_cnid)
            .then_with(|| self.fold().cmp(&other.fold()))
    }
}

impl TreeKey for CatalogKey {
    fn parse(record: &[u8]) -> (Self, usize) {
        let key_len = record[0] as usize;
        let parent_cnid = u32::from_be_bytes(record[2..6].try_into().unwrap());
        let name_len = record[6] as usize;
        let name = String::from_utf8_lossy(&record[7..7 + name_len]).into_owned();
        (Self { parent_cnid, name }, key_len + 1)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let name_bytes = self.name.as_bytes();
        let name_len = name_bytes.len().min(255);
        let mut out = vec![0u8; 7 + name_len];
        out[1] = 0; // reserved
        out[2..6].copy_from_slice(&self.parent_cnid.to_be_bytes());
        out[6] = name_len as u8;
        out[7..7 + name_len].copy_from_slice(&name_bytes[..name_len]);
        out[0] = (out.len() - 1) as u8;
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryInfo {
    pub flags: u16,
    pub valence: u32,
    pub cnid: u32,
    pub create_date: HfsTime,
    pub modify_date: HfsTime,
    pub backup_date: HfsTime,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileInfo {
    pub flags: u8,
    pub file_type: [u8; 4],
    pub creator: [u8; 4],
    pub finder_flags: u16,
    pub cnid: u32,
    pub data_logical_size: u32,
    pub data_physical_blocks: u32,
    pub rsrc_logical_size: u32,
    pub rsrc_physical_blocks: u32,
    pub create_date: HfsTime,
    pub modify_date: HfsTime,
    pub backup_date: HfsTime,
    pub data_extents: ExtentRecord,
    pub rsrc_extents: ExtentRecord,
}

#[derive(Debug, Clone, Default)]
pub struct ThreadInfo {
    pub parent_cnid: u32,
    pub name: String,
}

#[derive(Debug, Clone)]
pub enum CatalogRecord {
    Directory(DirectoryInfo),
    File(Box<FileInfo>),
    DirectoryThread(ThreadInfo),
    FileThread(ThreadInfo),
}

impl CatalogRecord {
    pub fn cnid(&self) -> Option<u32> {
        match self {
            CatalogRecord::Directory(d) => Some(d.cnid),
            CatalogRecord::File(f) => Some(f.cnid),
            CatalogRecord::DirectoryThread(_) | CatalogRecord::FileThread(_) => None,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, HfsError> {
        let kind = *bytes
            .first()
            .ok_or(HfsError::Corrupt("empty catalog record"))?;
        match kind {
            DIR_RECORD => {
                if bytes.len() < 20 {
                    return Err(HfsError::Corrupt("truncated directory record"));
                }
                Ok(CatalogRecord::Directory(DirectoryInfo {
                    flags: u16::from_be_bytes(bytes[2..4].try_into().unwrap()),
                    valence: u32::from(u16::from_be_bytes(bytes[4..6].try_into().unwrap())),
                    cnid: u32::from_be_bytes(bytes[6..10].try_into().unwrap()),
                    create_date: HfsTime(u32::from_be_bytes(bytes[10..14].try_into().unwrap())),
                    modify_date: HfsTime(u32::from_be_bytes(bytes[14..18].try_into().unwrap())),
                    backup_date: HfsTime(u32::from_be_bytes(bytes[18..22].try_into().unwrap())),
                }))
            }
            FILE_RECORD => {
                if bytes.len() < 102 {
                    return Err(HfsError::Corrupt("truncated file record"));
                }
                let mut f = FileInfo {
                    flags: bytes[1],
                    file_type: bytes[4..8].try_into().unwrap(),
                    creator: bytes[8..12].try_into().unwrap(),
                    finder_flags: u16::from_be_bytes(bytes[12..14].try_into().unwrap()),
                    cnid: u32::from_be_bytes(bytes[20..24].try_into().unwrap()),
                    data_logical_size: u32::from_be_bytes(bytes[30..34].try_into().unwrap()),
                    data_physical_blocks: u32::from(u16::from_be_bytes(
                        bytes[34..36].try_into().unwrap(),
                    )),
                    rsrc_logical_size: u32::from_be_bytes(bytes[36..40].try_into().unwrap()),
                    rsrc_physical_blocks: u32::from(u16::from_be_bytes(
                        bytes[40..42].try_into().unwrap(),
                    )),
                    create_date: HfsTime(u32::from_be_bytes(bytes[42..46].try_into().unwrap())),
                    modify_date: HfsTime(u32::from_be_bytes(bytes[46..50].try_into().unwrap())),
                    backup_date: HfsTime(u32::from_be_bytes(bytes[50..54].try_into().unwrap())),
                    data_extents: ExtentRecord::parse(&bytes[62..74].try_into().unwrap()),
                    rsrc_extents: ExtentRecord::parse(&bytes[74..86].try_into().unwrap()),
                };
                // data_extents/rsrc_extents offsets above follow the
                // classic CatFileRec layout used by this implementation.
                f.data_physical_blocks = f.data_physical_blocks.max(f.data_extents.total_blocks());
                Ok(CatalogRecord::File(Box::new(f)))
            }
            DIR_THREAD_RECORD | FILE_THREAD_RECORD => {
                if bytes.len() < 10 {
                    return Err(HfsError::Corrupt("truncated thread record"));
                }
                let parent_cnid = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
                let name_len = bytes[8] as usize;
                let name = String::from_utf8_lossy(&bytes[9..9 + name_len]).into_owned();
                let info = ThreadInfo { parent_cnid, name };
                Ok(if kind == DIR_THREAD_RECORD {
                    CatalogRecord::DirectoryThread(info)
                } else {
                    CatalogRecord::FileThread(info)
                })
            }
            _ => Err(HfsError::Corrupt("unknown catalog record type")),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            CatalogRecord::Directory(d) => {
                let mut out = vec![0u8; 22];
                out[0] = DIR_RECORD;
                out[2..4].copy_from_slice(&d.flags.to_be_bytes());
                out[4..6].copy_from_slice(&(d.valence as u16).to_be_bytes());
                out[6..10].copy_from_slice(&d.cnid.to_be_bytes());
                out[10..14].copy_from_slice(&d.create_date.0.to_be_bytes());
                out[14..18].copy_from_slice(&d.modify_date.0.to_be_bytes());
                out[18..22].copy_from_slice(&d.backup_date.0.to_be_bytes());
                out
            }
            CatalogRecord::File(f) => {
                let mut out = vec![0u8; 102];
                out[0] = FILE_RECORD;
                out[1] = f.flags;
                out[4..8].copy_from_slice(&f.file_type);
                out[8..12].copy_from_slice(&f.creator);
                out[12..14].copy_from_slice(&f.finder_flags.to_be_bytes());
                out[20..24].copy_from_slice(&f.cnid.to_be_bytes());
                out[30..34].copy_from_slice(&f.data_logical_size.to_be_bytes());
                out[34..36].copy_from_slice(&(f.data_physical_blocks as u16).to_be_bytes());
                out[36..40].copy_from_slice(&f.rsrc_logical_size.to_be_bytes());
                out[40..42].copy_from_slice(&(f.rsrc_physical_blocks as u16).to_be_bytes());
                out[42..46].copy_from_slice(&f.create_date.0.to_be_bytes());
                out[46..50].copy_from_slice(&f.modify_date.0.to_be_bytes());
                out[50..54].copy_from_slice(&f.backup_date.0.to_be_bytes());
                f.data_extents
                    .serialize(&mut out[62..74].try_into().unwrap());
                f.rsrc_extents
                    .serialize(&mut out[74..86].try_into().unwrap());
                out
            }
            CatalogRecord::DirectoryThread(t) | CatalogRecord::FileThread(t) => {
                let name_bytes = t.name.as_bytes();
                let name_len = name_bytes.len().min(255);
                let mut out = vec![0u8; 9 + name_len];
                out[0] = if matches!(self, CatalogRecord::DirectoryThread(_)) {
                    DIR_THREAD_RECORD
                } else {
                    FILE_THREAD_RECORD
                };
                out[4..8].copy_from_slice(&t.parent_cnid.to_be_bytes());
                out[8] = name_len as u8;
                out[9..9 + name_len].copy_from_slice(&name_bytes[..name_len]);
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_and_has_length_prefix() {
        let key = CatalogKey::new(2, "Hello");
        let bytes = key.to_bytes();
        let (parsed, consumed) = CatalogKey::parse(&bytes);
        assert_eq!(parsed, key);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn key_orders_by_parent_then_case_folded_name() {
        let a = CatalogKey::new(2, "apple");
        let b = CatalogKey::new(2, "Banana");
        let c = CatalogKey::new(3, "aardvark");
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn directory_record_round_trips() {
        let info = DirectoryInfo {
            flags: 0,
            valence: 4,
            cnid: 42,
            create_date: HfsTime(100),
            modify_date: HfsTime(200),
            backup_date: HfsTime(0),
        };
        let record = CatalogRecord::Directory(info);
        let bytes = record.serialize();
        let parsed = CatalogRecord::parse(&bytes).unwrap();
        assert_eq!(parsed.cnid(), Some(42));
    }

    #[test]
    fn file_record_round_trips_extents() {
        let mut info = FileInfo {
            cnid: 7,
            data_logical_size: 1000,
            ..Default::default()
        };
        info.data_extents.0[0].start_block = 10;
        info.data_extents.0[0].block_count = 3;
        let record = CatalogRecord::File(Box::new(info));
        let bytes = record.serialize();
        let parsed = CatalogRecord::parse(&bytes).unwrap();
        match parsed {
            CatalogRecord::File(f) => {
                assert_eq!(f.data_extents.0[0].block_count, 3);
                assert_eq!(f.data_logical_size, 1000);
            }
            _ => panic!("expected file record"),
        }
    }

    #[test]
    fn thread_record_round_trips() {
        let record = CatalogRecord::FileThread(ThreadInfo {
            parent_cnid: 9,
            name: "thing.txt".into(),
        });
        let bytes = record.serialize();
        let parsed = CatalogRecord::parse(&bytes).unwrap();
        match parsed {
            CatalogRecord::FileThread(t) => assert_eq!(t.name, "thing.txt"),
            _ => panic!("expected file thread record"),
        }
    }
}
