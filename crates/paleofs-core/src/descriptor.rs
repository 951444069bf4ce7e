//! The generic file descriptor state machine (spec §4.7) and the
//! open-file table that enforces shared-access rules ahead of it.
//!
//! Implemented once against [`ForkStorage`] and reused by every format
//! crate, rather than written three times — the one place this
//! reimplementation takes the spec's "generic" language as a literal
//! shared generic implementation.

use crate::arena::EntryId;
use crate::error::{Error, Result};
use std::collections::HashMap;

pub const MAX_FILE_LEN: u64 = 1 << 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Part {
    DataFork,
    RsrcFork,
    RawData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    Begin,
    Current,
    End,
    Data,
    Hole,
}

/// What a filesystem's per-fork storage model must supply so this shared
/// engine can do Read/Write/Seek/SetLength without knowing whether it is
/// walking a B*-tree (HFS) or an index-tree (ProDOS).
pub trait ForkStorage {
    fn block_size(&self) -> usize;
    /// Resolves a logical block index within the fork to a device block
    /// number, or `None` for a sparse hole.
    fn resolve_block(&mut self, index: u64) -> Result<Option<u32>>;
    /// Allocates backing storage for `index`, growing the model (and
    /// possibly promoting its storage type) if needed. Must leave the
    /// model's prior state untouched on failure (spec §4.7 write
    /// contract).
    fn allocate_block(&mut self, index: u64) -> Result<u32>;
    fn read_device_block(&mut self, device_block: u32, buf: &mut [u8]) -> Result<()>;
    fn write_device_block(&mut self, device_block: u32, buf: &[u8]) -> Result<()>;
    fn fill_byte(&self) -> u8;
    fn eof(&self) -> u64;
    fn set_eof(&mut self, eof: u64);
    /// Frees blocks from the tail down to (but not including) `index`.
    fn truncate_from(&mut self, index: u64) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// One open fork. `entry`/`part` identify what's open for the purposes of
/// the open-file table; `storage` is the format-specific resolver.
pub struct FileDescriptor<S: ForkStorage> {
    entry: EntryId,
    part: Part,
    mode: Mode,
    mark: u64,
    storage: S,
    valid: bool,
}

impl<S: ForkStorage> FileDescriptor<S> {
    pub fn new(entry: EntryId, part: Part, mode: Mode, storage: S) -> Self {
        Self {
            entry,
            part,
            mode,
            mark: 0,
            storage,
            valid: true,
        }
    }

    pub fn entry(&self) -> EntryId {
        self.entry
    }

    pub fn part(&self) -> Part {
        self.part
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn mark(&self) -> u64 {
        self.mark
    }

    pub fn eof(&self) -> u64 {
        self.storage.eof()
    }

    fn check_valid(&self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(Error::Disposed)
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_valid()?;
        let eof = self.storage.eof();
        if self.mark >= eof || buf.is_empty() {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(eof - self.mark) as usize;
        let block_size = self.storage.block_size();
        let mut done = 0usize;
        let mut scratch = vec![0u8; block_size];
        while done < n {
            let pos = self.mark + done as u64;
            let block_index = pos / block_size as u64;
            let block_off = (pos % block_size as u64) as usize;
            let take = (block_size - block_off).min(n - done);
            match self.storage.resolve_block(block_index)? {
                Some(device_block) => {
                    self.storage.read_device_block(device_block, &mut scratch)?;
                    buf[done..done + take].copy_from_slice(&scratch[block_off..block_off + take]);
                }
                None => {
                    buf[done..done + take].fill(self.storage.fill_byte());
                }
            }
            done += take;
        }
        self.mark += done as u64;
        Ok(done)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check_valid()?;
        if self.mode == Mode::ReadOnly {
            return Err(Error::ReadOnly);
        }
        if self.mark + buf.len() as u64 > MAX_FILE_LEN {
            return Err(Error::InvalidArg("write would exceed MAX_FILE_LEN"));
        }
        let block_size = self.storage.block_size();
        let mut done = 0usize;
        let mut scratch = vec![0u8; block_size];
        while done < buf.len() {
            let pos = self.mark + done as u64;
            let block_index = pos / block_size as u64;
            let block_off = (pos % block_size as u64) as usize;
            let take = (block_size - block_off).min(buf.len() - done);

            let device_block = match self.storage.resolve_block(block_index)? {
                Some(db) => db,
                None => self.storage.allocate_block(block_index)?,
            };

            if block_off == 0 && take == block_size {
                self.storage
                    .write_device_block(device_block, &buf[done..done + take])?;
            } else {
                self.storage.read_device_block(device_block, &mut scratch)?;
                scratch[block_off..block_off + take].copy_from_slice(&buf[done..done + take]);
                self.storage.write_device_block(device_block, &scratch)?;
            }
            done += take;
        }
        self.mark += done as u64;
        if self.mark > self.storage.eof() {
            self.storage.set_eof(self.mark);
        }
        Ok(done)
    }

    pub fn seek(&mut self, offset: i64, origin: SeekOrigin) -> Result<u64> {
        self.check_valid()?;
        let eof = self.storage.eof();
        let new_mark = match origin {
            SeekOrigin::Begin => checked_offset(0, offset)?,
            SeekOrigin::Current => checked_offset(self.mark, offset)?,
            SeekOrigin::End => checked_offset(eof, offset)?,
            SeekOrigin::Data | SeekOrigin::Hole => {
                let start = checked_offset(0, offset)?;
                self.seek_data_or_hole(start, origin == SeekOrigin::Data)?
            }
        };
        if new_mark > MAX_FILE_LEN {
            return Err(Error::InvalidArg("seek past MAX_FILE_LEN"));
        }
        self.mark = new_mark;
        Ok(self.mark)
    }

    fn seek_data_or_hole(&mut self, start: u64, want_data: bool) -> Result<u64> {
        let block_size = self.storage.block_size() as u64;
        let eof = self.storage.eof();
        let mut pos = (start / block_size) * block_size;
        while pos < eof {
            let is_data = self.storage.resolve_block(pos / block_size)?.is_some();
            if is_data == want_data {
                return Ok(pos.max(start));
            }
            pos += block_size;
        }
        Ok(eof)
    }

    pub fn set_length(&mut self, new_eof: u64) -> Result<()> {
        self.check_valid()?;
        if self.mode == Mode::ReadOnly {
            return Err(Error::ReadOnly);
        }
        let old_eof = self.storage.eof();
        if new_eof < old_eof {
            let block_size = self.storage.block_size() as u64;
            let first_freed_block = new_eof.div_ceil(block_size);
            self.storage.truncate_from(first_freed_block)?;
            self.storage.set_eof(new_eof);
            self.storage.flush()?;
            return Ok(());
        }
        if new_eof == old_eof {
            return Ok(());
        }
        let block_size = self.storage.block_size() as u64;
        let last_needed_block = (new_eof.saturating_sub(1)) / block_size;
        let mut block = old_eof / block_size;
        while block <= last_needed_block {
            if self.storage.resolve_block(block)?.is_none() {
                if let Err(e) = self.storage.allocate_block(block) {
                    self.storage.set_eof(old_eof);
                    return Err(e);
                }
            }
            block += 1;
        }
        self.storage.set_eof(new_eof);
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.check_valid()?;
        self.storage.flush()
    }

    /// Marks the descriptor invalid without flushing — used by the
    /// finalizer-free teardown path (spec §4.7 "no finalizer I/O"): a
    /// still-open descriptor reaching teardown is an assertion failure in
    /// debug builds, never a hidden flush.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl<S: ForkStorage> Drop for FileDescriptor<S> {
    fn drop(&mut self) {
        debug_assert!(
            !self.valid,
            "FileDescriptor dropped without dispose(): flush-on-drop is not supported, \
             call dispose() explicitly before releasing the last handle"
        );
    }
}

fn checked_offset(base: u64, delta: i64) -> Result<u64> {
    let result = base as i64 + delta;
    if result < 0 {
        return Err(Error::InvalidArg("seek before start of file"));
    }
    Ok(result as u64)
}

/// Single point of truth for per-fork concurrency (spec §4.7/§5): one
/// writer xor many readers per (entry, part); raw access requires the
/// table to be empty.
#[derive(Default)]
pub struct OpenFileTable {
    writers: HashMap<(EntryId, Part), ()>,
    readers: HashMap<(EntryId, Part), u32>,
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty() && self.readers.is_empty()
    }

    pub fn try_acquire(&mut self, entry: EntryId, part: Part, mode: Mode) -> Result<()> {
        let key = (entry, part);
        match mode {
            Mode::ReadWrite => {
                if self.writers.contains_key(&key) || self.readers.get(&key).copied().unwrap_or(0) > 0 {
                    return Err(Error::OpenConflict);
                }
                self.writers.insert(key, ());
            }
            Mode::ReadOnly => {
                if self.writers.contains_key(&key) {
                    return Err(Error::OpenConflict);
                }
                *self.readers.entry(key).or_insert(0) += 1;
            }
        }
        Ok(())
    }

    pub fn release(&mut self, entry: EntryId, part: Part, mode: Mode) {
        let key = (entry, part);
        match mode {
            Mode::ReadWrite => {
                self.writers.remove(&key);
            }
            Mode::ReadOnly => {
                if let Some(count) = self.readers.get_mut(&key) {
                    *count -= 1;
                    if *count == 0 {
                        self.readers.remove(&key);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemFork {
        data: Vec<u8>,
        block_size: usize,
        eof: u64,
        allocated: Vec<bool>,
    }

    impl MemFork {
        fn new(block_size: usize, blocks: usize) -> Self {
            Self {
                data: vec![0u8; block_size * blocks],
                block_size,
                eof: 0,
                allocated: vec![false; blocks],
            }
        }
    }

    impl ForkStorage for MemFork {
        fn block_size(&self) -> usize {
            self.block_size
        }
        fn resolve_block(&mut self, index: u64) -> Result<Option<u32>> {
            let i = index as usize;
            if i < self.allocated.len() && self.allocated[i] {
                Ok(Some(i as u32))
            } else {
                Ok(None)
            }
        }
        fn allocate_block(&mut self, index: u64) -> Result<u32> {
            let i = index as usize;
            if i >= self.allocated.len() {
                return Err(Error::DiskFull);
            }
            self.allocated[i] = true;
            Ok(i as u32)
        }
        fn read_device_block(&mut self, block: u32, buf: &mut [u8]) -> Result<()> {
            let off = block as usize * self.block_size;
            buf.copy_from_slice(&self.data[off..off + self.block_size]);
            Ok(())
        }
        fn write_device_block(&mut self, block: u32, buf: &[u8]) -> Result<()> {
            let off = block as usize * self.block_size;
            self.data[off..off + self.block_size].copy_from_slice(buf);
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
        fn truncate_from(&mut self, index: u64) -> Result<()> {
            for i in index as usize..self.allocated.len() {
                self.allocated[i] = false;
            }
            Ok(())
        }
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn entry(i: u32) -> EntryId {
        EntryId::from_raw(i, 0)
    }

    #[test]
    fn write_then_read_round_trips() {
        let storage = MemFork::new(512, 8);
        let mut fd = FileDescriptor::new(entry(1), Part::DataFork, Mode::ReadWrite, storage);
        fd.write(b"hello world").unwrap();
        fd.seek(0, SeekOrigin::Begin).unwrap();
        let mut buf = [0u8; 11];
        let n = fd.read(&mut buf).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
        fd.invalidate();
    }

    #[test]
    fn sparse_read_returns_fill_byte() {
        let storage = MemFork::new(512, 8);
        let mut fd = FileDescriptor::new(entry(1), Part::DataFork, Mode::ReadWrite, storage);
        fd.set_length(1024).unwrap();
        let mut buf = [0xFFu8; 512];
        fd.seek(0, SeekOrigin::Begin).unwrap();
        fd.read(&mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
        fd.invalidate();
    }

    #[test]
    fn seek_past_eof_then_read_returns_zero() {
        let storage = MemFork::new(512, 8);
        let mut fd = FileDescriptor::new(entry(1), Part::DataFork, Mode::ReadWrite, storage);
        fd.write(b"abc").unwrap();
        fd.seek(100, SeekOrigin::Begin).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(fd.read(&mut buf).unwrap(), 0);
        fd.invalidate();
    }

    #[test]
    fn set_length_grow_failure_preserves_eof() {
        let storage = MemFork::new(512, 2);
        let mut fd = FileDescriptor::new(entry(1), Part::DataFork, Mode::ReadWrite, storage);
        fd.write(b"abc").unwrap();
        let old_eof = fd.eof();
        assert!(fd.set_length(10_000).is_err());
        assert_eq!(fd.eof(), old_eof);
        fd.invalidate();
    }

    #[test]
    fn open_file_table_exclusion() {
        let mut table = OpenFileTable::new();
        table
            .try_acquire(entry(1), Part::DataFork, Mode::ReadWrite)
            .unwrap();
        assert!(matches!(
            table.try_acquire(entry(1), Part::DataFork, Mode::ReadWrite),
            Err(Error::OpenConflict)
        ));
        assert!(matches!(
            table.try_acquire(entry(1), Part::DataFork, Mode::ReadOnly),
            Err(Error::OpenConflict)
        ));
    }

    #[test]
    fn open_file_table_allows_many_readers() {
        let mut table = OpenFileTable::new();
        table
            .try_acquire(entry(1), Part::DataFork, Mode::ReadOnly)
            .unwrap();
        table
            .try_acquire(entry(1), Part::DataFork, Mode::ReadOnly)
            .unwrap();
        assert!(matches!(
            table.try_acquire(entry(1), Part::DataFork, Mode::ReadWrite),
            Err(Error::OpenConflict)
        ));
    }
}
