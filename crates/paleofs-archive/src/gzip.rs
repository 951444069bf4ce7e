//! GZip member parsing and the one archive kind whose transaction
//! discipline (spec §5) actually rewrites bytes on commit — a `.gz`
//! stream is just one or more independent deflate members back to back,
//! so rewriting it needs no central-directory reconstruction.

use std::io::{Read, Write};

use flate2::write::DeflateEncoder;
use flate2::{read::DeflateDecoder, Compression};

use crate::error::{ArchiveError, Result};
use crate::transaction::{PartOp, TransactionState};

const MAGIC: [u8; 3] = [0x1F, 0x8B, 0x08];
const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;

#[derive(Debug, Clone)]
pub struct GzipMember {
    pub name: Option<String>,
    pub mtime: u32,
    pub data: Vec<u8>,
}

fn read_cstring(bytes: &[u8], start: usize) -> Result<(String, usize)> {
    let end = bytes[start..]
        .iter()
        .position(|&b| b == 0)
        .ok_or(ArchiveError::Corrupt("gzip name/comment missing terminator"))?;
    Ok((
        String::from_utf8_lossy(&bytes[start..start + end]).into_owned(),
        start + end + 1,
    ))
}

/// Parses one member starting at `bytes[0]`, returning it plus how many
/// bytes it consumed so callers can find the next member in a
/// concatenated stream.
pub fn parse_member(bytes: &[u8]) -> Result<(GzipMember, usize)> {
    if bytes.len() < 18 || bytes[0..3] != MAGIC {
        return Err(ArchiveError::BadSignature {
            expected: &MAGIC,
            found: bytes.get(0..3).unwrap_or(&[]).to_vec(),
        });
    }
    let flags = bytes[3];
    let mtime = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let mut pos = 10;

    if flags & FEXTRA != 0 {
        let xlen = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]) as usize;
        pos += 2 + xlen;
    }
    let name = if flags & FNAME != 0 {
        let (name, next) = read_cstring(bytes, pos)?;
        pos = next;
        Some(name)
    } else {
        None
    };
    if flags & FCOMMENT != 0 {
        let (_, next) = read_cstring(bytes, pos)?;
        pos = next;
    }
    if flags & FHCRC != 0 {
        pos += 2;
    }

    // The trailer (crc32 + isize) is the last 8 bytes of this member; the
    // deflate stream fills everything in between. `flate2`'s decoder stops
    // at the end of the deflate block on its own, so feed it the whole
    // remainder and measure what it actually consumed.
    let mut decoder = DeflateDecoder::new(&bytes[pos..]);
    let mut data = Vec::new();
    decoder.read_to_end(&mut data)?;
    let consumed = decoder.total_in() as usize;
    let trailer_start = pos + consumed;
    if trailer_start + 8 > bytes.len() {
        return Err(ArchiveError::Corrupt("gzip trailer truncated"));
    }
    let expected_crc = u32::from_le_bytes([
        bytes[trailer_start],
        bytes[trailer_start + 1],
        bytes[trailer_start + 2],
        bytes[trailer_start + 3],
    ]);
    let computed_crc = crc32fast::hash(&data);
    if expected_crc != computed_crc {
        return Err(ArchiveError::CrcMismatch {
            expected: expected_crc,
            computed: computed_crc,
        });
    }
    let total_len = trailer_start + 8;
    Ok((GzipMember { name, mtime, data }, total_len))
}

pub fn serialize_member(member: &GzipMember) -> Result<Vec<u8>> {
    let mut flags = 0u8;
    if member.name.is_some() {
        flags |= FNAME;
    }
    let mut out = Vec::with_capacity(member.data.len() / 2 + 32);
    out.extend_from_slice(&MAGIC);
    out.push(flags);
    out.extend_from_slice(&member.mtime.to_le_bytes());
    out.push(0); // XFL: no compression-level hint recorded
    out.push(0xFF); // OS: unknown, matches gzip's portable default
    if let Some(name) = &member.name {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
    }

    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&member.data)?;
    let compressed = encoder.finish()?;
    out.extend_from_slice(&compressed);

    out.extend_from_slice(&crc32fast::hash(&member.data).to_le_bytes());
    out.extend_from_slice(&(member.data.len() as u32).to_le_bytes());
    Ok(out)
}

impl From<std::io::Error> for ArchiveError {
    fn from(err: std::io::Error) -> Self {
        ArchiveError::Core(paleofs_core::Error::Io(err.to_string()))
    }
}

/// A `.gz` stream held as its parsed members, with `paleofs_archive`'s
/// transaction discipline layered over it (spec §5). This is the one
/// archive kind in this crate where `commit_transaction` actually
/// rewrites the stream rather than just bookkeeping the ops.
pub struct GzipArchive {
    members: Vec<GzipMember>,
    transaction: TransactionState,
}

impl GzipArchive {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut members = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let (member, consumed) = parse_member(&bytes[offset..])?;
            members.push(member);
            offset += consumed;
        }
        Ok(Self {
            members,
            transaction: TransactionState::default(),
        })
    }

    pub fn list_members(&self) -> Result<Vec<String>> {
        self.transaction.require_closed_for_read()?;
        Ok(self
            .members
            .iter()
            .enumerate()
            .map(|(i, m)| m.name.clone().unwrap_or_else(|| i.to_string()))
            .collect())
    }

    pub fn read_member(&self, name: &str) -> Result<&[u8]> {
        self.transaction.require_closed_for_read()?;
        self.members
            .iter()
            .find(|m| m.name.as_deref() == Some(name))
            .map(|m| m.data.as_slice())
            .ok_or_else(|| ArchiveError::NoSuchPart(name.to_string()))
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

    pub fn rename_part(&mut self, from: &str, to: &str) -> Result<()> {
        self.transaction
            .push(PartOp::Rename {
                from: from.to_string(),
                to: to.to_string(),
            })
            .map_err(Into::into)
    }

    pub fn cancel_transaction(&mut self) {
        self.transaction.cancel();
    }

    pub fn commit_transaction(&mut self, out: &mut dyn Write) -> Result<()> {
        let ops = self.transaction.take_for_commit()?;
        for op in ops {
            match op {
                PartOp::Add { name, data } => {
                    self.members.retain(|m| m.name.as_deref() != Some(name.as_str()));
                    self.members.push(GzipMember {
                        name: Some(name),
                        mtime: 0,
                        data,
                    });
                }
                PartOp::Delete { name } => {
                    self.members.retain(|m| m.name.as_deref() != Some(name.as_str()));
                }
                PartOp::Rename { from, to } => {
                    if let Some(member) = self.members.iter_mut().find(|m| m.name.as_deref() == Some(from.as_str())) {
                        member.name = Some(to);
                    }
                }
            }
        }
        for member in &self.members {
            let bytes = serialize_member(member)?;
            out.write_all(&bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_round_trips() {
        let member = GzipMember {
            name: Some("hello.txt".to_string()),
            mtime: 0,
            data: b"hello, world".to_vec(),
        };
        let bytes = serialize_member(&member).unwrap();
        let (parsed, consumed) = parse_member(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed.name, member.name);
        assert_eq!(parsed.data, member.data);
    }

    #[test]
    fn corrupt_trailer_crc_is_rejected() {
        let member = GzipMember {
            name: None,
            mtime: 0,
            data: b"some payload".to_vec(),
        };
        let mut bytes = serialize_member(&member).unwrap();
        // The crc32 occupies the 8 bytes before the trailing isize field.
        let crc_start = bytes.len() - 8;
        bytes[crc_start] ^= 0xFF;
        assert!(matches!(parse_member(&bytes), Err(ArchiveError::CrcMismatch { .. })));
    }

    #[test]
    fn transaction_rollback_leaves_archive_unchanged() {
        let member = GzipMember {
            name: Some("a.txt".to_string()),
            mtime: 0,
            data: b"original".to_vec(),
        };
        let original_bytes = serialize_member(&member).unwrap();
        let mut archive = GzipArchive::parse(&original_bytes).unwrap();

        archive.start_transaction().unwrap();
        archive.add_part("b.txt", b"new file".to_vec()).unwrap();
        archive.cancel_transaction();

        assert_eq!(archive.list_members().unwrap(), vec!["a.txt".to_string()]);
        let mut replay = Vec::new();
        // No open transaction remains; committing an empty one is a no-op
        // rewrite that must reproduce the original single member.
        archive.start_transaction().unwrap();
        archive.commit_transaction(&mut replay).unwrap();
        assert_eq!(replay, original_bytes);
    }
}
