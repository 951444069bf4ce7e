//! ZIP local/central header parsing (spec §6). Read-only: extracting a
//! stored or deflated entry delegates to `flate2`, but there is no
//! central-directory writer here, so `ZipArchive::commit_transaction`
//! only ever reports that rewriting isn't supported (spec §1's archive
//! non-goal; only GZip gets a real rewrite path — see [`crate::gzip`]).

use std::io::Read;

use flate2::read::DeflateDecoder;

use crate::error::{ArchiveError, Result};
use crate::transaction::{PartOp, TransactionState};

pub const LOCAL_FILE_HEADER_SIG: [u8; 4] = *b"PK\x03\x04";
pub const CENTRAL_DIRECTORY_SIG: [u8; 4] = *b"PK\x01\x02";
pub const DATA_DESCRIPTOR_SIG: [u8; 4] = *b"PK\x07\x08";
pub const END_OF_CENTRAL_DIR_SIG: [u8; 4] = *b"PK\x05\x06";

const LANGUAGE_ENCODING_FLAG: u16 = 1 << 11;

fn decode_name(bytes: &[u8], flags: u16) -> String {
    if flags & LANGUAGE_ENCODING_FLAG != 0 {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        // CP437 decoding: every byte below 0x80 is ASCII-identical; the
        // high half is a non-goal (spec §1's character-encoding-tables
        // exclusion), so it round-trips as Latin-1 instead of the exact
        // CP437 glyphs.
        bytes.iter().map(|&b| b as char).collect()
    }
}

#[derive(Debug, Clone)]
pub struct LocalFileHeader {
    pub flags: u16,
    pub method: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name: String,
    pub extra_len: u16,
}

impl LocalFileHeader {
    pub const FIXED_SIZE: usize = 30;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::FIXED_SIZE || bytes[0..4] != LOCAL_FILE_HEADER_SIG {
            return Err(ArchiveError::BadSignature {
                expected: &LOCAL_FILE_HEADER_SIG,
                found: bytes.get(0..4).unwrap_or(&[]).to_vec(),
            });
        }
        let flags = u16::from_le_bytes([bytes[6], bytes[7]]);
        let method = u16::from_le_bytes([bytes[8], bytes[9]]);
        let crc32 = u32::from_le_bytes([bytes[14], bytes[15], bytes[16], bytes[17]]);
        let compressed_size = u32::from_le_bytes([bytes[18], bytes[19], bytes[20], bytes[21]]);
        let uncompressed_size = u32::from_le_bytes([bytes[22], bytes[23], bytes[24], bytes[25]]);
        let name_len = u16::from_le_bytes([bytes[26], bytes[27]]) as usize;
        let extra_len = u16::from_le_bytes([bytes[28], bytes[29]]);
        if bytes.len() < Self::FIXED_SIZE + name_len {
            return Err(ArchiveError::Corrupt("zip local file header name truncated"));
        }
        let name = decode_name(&bytes[Self::FIXED_SIZE..Self::FIXED_SIZE + name_len], flags);
        Ok(Self {
            flags,
            method,
            crc32,
            compressed_size,
            uncompressed_size,
            name,
            extra_len,
        })
    }

    pub fn total_header_len(&self) -> usize {
        Self::FIXED_SIZE + self.name.len() + self.extra_len as usize
    }
}

#[derive(Debug, Clone)]
pub struct CentralDirectoryFileHeader {
    pub flags: u16,
    pub method: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name: String,
    pub local_header_offset: u32,
}

impl CentralDirectoryFileHeader {
    pub const FIXED_SIZE: usize = 46;

    pub fn parse(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < Self::FIXED_SIZE || bytes[0..4] != CENTRAL_DIRECTORY_SIG {
            return Err(ArchiveError::BadSignature {
                expected: &CENTRAL_DIRECTORY_SIG,
                found: bytes.get(0..4).unwrap_or(&[]).to_vec(),
            });
        }
        let flags = u16::from_le_bytes([bytes[8], bytes[9]]);
        let method = u16::from_le_bytes([bytes[10], bytes[11]]);
        let crc32 = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        let compressed_size = u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
        let uncompressed_size = u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);
        let name_len = u16::from_le_bytes([bytes[28], bytes[29]]) as usize;
        let extra_len = u16::from_le_bytes([bytes[30], bytes[31]]) as usize;
        let comment_len = u16::from_le_bytes([bytes[32], bytes[33]]) as usize;
        let local_header_offset = u32::from_le_bytes([bytes[42], bytes[43], bytes[44], bytes[45]]);
        let total = Self::FIXED_SIZE + name_len + extra_len + comment_len;
        if bytes.len() < total {
            return Err(ArchiveError::Corrupt("zip central directory entry truncated"));
        }
        let name = decode_name(&bytes[Self::FIXED_SIZE..Self::FIXED_SIZE + name_len], flags);
        Ok((
            Self {
                flags,
                method,
                crc32,
                compressed_size,
                uncompressed_size,
                name,
                local_header_offset,
            },
            total,
        ))
    }
}

/// A data descriptor trailing a streamed (bit-3) entry — crc and sizes
/// that weren't known when the local file header was written.
#[derive(Debug, Clone, Copy)]
pub struct DataDescriptor {
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
}

impl DataDescriptor {
    /// 16 bytes including the optional signature, or 12 without it —
    /// callers peek the first four bytes to tell which they have.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let has_sig = bytes.len() >= 4 && bytes[0..4] == DATA_DESCRIPTOR_SIG;
        let start = if has_sig { 4 } else { 0 };
        if bytes.len() < start + 12 {
            return Err(ArchiveError::Corrupt("zip data descriptor truncated"));
        }
        Ok(Self {
            crc32: u32::from_le_bytes([bytes[start], bytes[start + 1], bytes[start + 2], bytes[start + 3]]),
            compressed_size: u32::from_le_bytes([
                bytes[start + 4],
                bytes[start + 5],
                bytes[start + 6],
                bytes[start + 7],
            ]),
            uncompressed_size: u32::from_le_bytes([
                bytes[start + 8],
                bytes[start + 9],
                bytes[start + 10],
                bytes[start + 11],
            ]),
        })
    }
}

/// Method 0 (stored) or 8 (deflated) only — the two methods `flate2` can
/// actually help with.
pub fn inflate_entry(method: u16, compressed: &[u8]) -> Result<Vec<u8>> {
    match method {
        0 => Ok(compressed.to_vec()),
        8 => {
            let mut decoder = DeflateDecoder::new(compressed);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| ArchiveError::Core(paleofs_core::Error::Io(e.to_string())))?;
            Ok(out)
        }
        _ => Err(ArchiveError::Corrupt("unsupported zip compression method")),
    }
}

/// A parsed central directory, with the transaction bookkeeping from
/// spec §5 layered over it. `commit_transaction` here always fails —
/// rewriting a ZIP needs a full central-directory rebuild this crate
/// doesn't implement — but `cancel_transaction` and the "reads refused
/// while open" rule work identically to [`crate::gzip::GzipArchive`].
pub struct ZipArchive {
    entries: Vec<CentralDirectoryFileHeader>,
    transaction: TransactionState,
}

impl ZipArchive {
    pub fn from_central_directory_entries(entries: Vec<CentralDirectoryFileHeader>) -> Self {
        Self {
            entries,
            transaction: TransactionState::default(),
        }
    }

    pub fn list_entries(&self) -> Result<Vec<&str>> {
        self.transaction.require_closed_for_read()?;
        Ok(self.entries.iter().map(|e| e.name.as_str()).collect())
    }

    pub fn start_transaction(&mut self) -> Result<()> {
        self.transaction.start().map_err(Into::into)
    }

    pub fn add_part(&mut self, name: &str, data: Vec<u8>) -> Result<()> {
        self.transaction
            .push(PartOp::Add {
                name: name.to_string(),
                data,
            })
            .map_err(Into::into)
    }

    pub fn delete_part(&mut self, name: &str) -> Result<()> {
        self.transaction
            .push(PartOp::Delete {
                name: name.to_string(),
            })
            .map_err(Into::into)
    }

    pub fn cancel_transaction(&mut self) {
        self.transaction.cancel();
    }

    pub fn commit_transaction(&mut self) -> Result<()> {
        // Discard the queued ops either way; a failed commit still closes
        // the transaction, same as a cancel would.
        let _ = self.transaction.take_for_commit()?;
        Err(ArchiveError::Corrupt("zip central-directory rewriting is not implemented"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_local_header(name: &str) -> Vec<u8> {
        let mut out = vec![0u8; LocalFileHeader::FIXED_SIZE];
        out[0..4].copy_from_slice(&LOCAL_FILE_HEADER_SIG);
        out[8..10].copy_from_slice(&8u16.to_le_bytes()); // deflate
        out[26..28].copy_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out
    }

    #[test]
    fn local_file_header_round_trips_name_and_method() {
        let bytes = sample_local_header("HELLO.TXT");
        let header = LocalFileHeader::parse(&bytes).unwrap();
        assert_eq!(header.name, "HELLO.TXT");
        assert_eq!(header.method, 8);
        assert_eq!(header.total_header_len(), bytes.len());
    }

    #[test]
    fn stored_entries_pass_through_unchanged() {
        let data = b"no compression here".to_vec();
        let out = inflate_entry(0, &data).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn transaction_cancel_leaves_no_pending_ops() {
        let mut archive = ZipArchive::from_central_directory_entries(vec![]);
        archive.start_transaction().unwrap();
        archive.add_part("new.txt", b"data".to_vec()).unwrap();
        archive.cancel_transaction();
        assert!(archive.list_entries().unwrap().is_empty());
        assert!(archive.start_transaction().is_ok());
    }
}
