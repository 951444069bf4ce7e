//! Clump allocator bitmap (spec §4.3).
//!
//! One bit per allocation block. The meaning of "set" is inverted between
//! HFS (bit set ⇒ in use) and ProDOS (bit clear ⇒ in use); this type
//! always treats `true` as "in use" and leaves the inversion to the
//! format-specific (de)serializer that reads/writes the bitmap blocks.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start: u32,
    pub count: u32,
}

#[derive(Debug, Clone)]
pub struct ClumpBitmap {
    bits: Vec<bool>,
    free_blocks: u32,
    /// Tracks which backing (on-disk) blocks of the bitmap have been
    /// touched since the last flush, so a flush only rewrites dirty pages.
    dirty_pages: Vec<bool>,
    bits_per_page: usize,
}

impl ClumpBitmap {
    pub fn new(total_blocks: u32, bits_per_page: usize) -> Self {
        let pages = total_blocks as usize / bits_per_page + 1;
        Self {
            bits: vec![false; total_blocks as usize],
            free_blocks: total_blocks,
            dirty_pages: vec![false; pages],
            bits_per_page,
        }
    }

    pub fn from_bits(bits: Vec<bool>, bits_per_page: usize) -> Self {
        let free_blocks = bits.iter().filter(|b| !**b).count() as u32;
        let pages = bits.len() / bits_per_page + 1;
        Self {
            bits,
            free_blocks,
            dirty_pages: vec![false; pages],
            bits_per_page,
        }
    }

    pub fn len(&self) -> u32 {
        self.bits.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn free_blocks(&self) -> u32 {
        self.free_blocks
    }

    pub fn calc_free_blocks(&self) -> u32 {
        self.bits.iter().filter(|b| !**b).count() as u32
    }

    pub fn is_used(&self, block: u32) -> bool {
        self.bits.get(block as usize).copied().unwrap_or(true)
    }

    fn mark(&mut self, block: u32, used: bool) {
        let idx = block as usize;
        if idx >= self.bits.len() {
            return;
        }
        if self.bits[idx] != used {
            self.free_blocks = if used {
                self.free_blocks - 1
            } else {
                self.free_blocks + 1
            };
        }
        self.bits[idx] = used;
        let page = idx / self.bits_per_page;
        if page < self.dirty_pages.len() {
            self.dirty_pages[page] = true;
        }
    }

    pub fn dirty_pages(&self) -> impl Iterator<Item = usize> + '_ {
        self.dirty_pages
            .iter()
            .enumerate()
            .filter(|(_, d)| **d)
            .map(|(i, _)| i)
    }

    pub fn clear_dirty(&mut self) {
        self.dirty_pages.iter_mut().for_each(|d| *d = false);
    }

    /// Finds and marks used the largest contiguous run up to `clump`
    /// blocks, per §4.3's algorithm: back up from `search_start` past any
    /// trailing free blocks (to coalesce with a just-trimmed region), scan
    /// forward recording the best free run seen, wrap once, and stop early
    /// on an exact match. Fails with `DiskFull` if no free block exists.
    pub fn alloc_blocks(&mut self, clump: u32, search_start: u32) -> Result<Extent> {
        if clump == 0 {
            return Err(Error::InvalidArg("clump size must be >= 1"));
        }
        if self.bits.is_empty() {
            return Err(Error::DiskFull);
        }
        let len = self.bits.len() as u32;
        let mut start = search_start.min(len.saturating_sub(1));
        while start > 0 && !self.is_used(start - 1) {
            start -= 1;
        }

        let mut best: Option<Extent> = None;
        let mut scan = start;
        let mut wrapped = false;
        loop {
            if scan >= len {
                if wrapped {
                    break;
                }
                wrapped = true;
                scan = 0;
                if scan == start {
                    break;
                }
            }
            if wrapped && scan >= start {
                break;
            }
            if self.is_used(scan) {
                scan += 1;
                continue;
            }
            let run_start = scan;
            let mut run_len = 0u32;
            while scan < len && run_len < clump && !self.is_used(scan) {
                run_len += 1;
                scan += 1;
            }
            let candidate = Extent {
                start: run_start,
                count: run_len,
            };
            let improves = match best {
                None => true,
                Some(b) => candidate.count > b.count,
            };
            if improves {
                best = Some(candidate);
            }
            if run_len == clump {
                break;
            }
        }

        match best {
            Some(extent) if extent.count > 0 => {
                for b in extent.start..extent.start + extent.count {
                    self.mark(b, true);
                }
                Ok(extent)
            }
            _ => Err(Error::DiskFull),
        }
    }

    pub fn release_blocks(&mut self, extent: Extent) {
        for b in extent.start..extent.start + extent.count {
            self.mark(b, false);
        }
    }

    pub fn mark_used(&mut self, block: u32) {
        self.mark(block, true);
    }

    pub fn mark_free(&mut self, block: u32) {
        self.mark(block, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_first_equal_length_run() {
        let mut bm = ClumpBitmap::new(16, 4096);
        let ext = bm.alloc_blocks(3, 0).unwrap();
        assert_eq!(ext, Extent { start: 0, count: 3 });
        assert_eq!(bm.free_blocks(), 13);
    }

    #[test]
    fn search_start_in_used_region_scans_forward_no_backup() {
        let mut bm = ClumpBitmap::new(16, 4096);
        bm.mark_used(0);
        bm.mark_used(1);
        let ext = bm.alloc_blocks(2, 1).unwrap();
        assert_eq!(ext.start, 2);
    }

    #[test]
    fn disk_full_when_no_space() {
        let mut bm = ClumpBitmap::new(2, 4096);
        bm.mark_used(0);
        bm.mark_used(1);
        assert!(matches!(bm.alloc_blocks(1, 0), Err(Error::DiskFull)));
    }

    #[test]
    fn release_restores_free_count() {
        let mut bm = ClumpBitmap::new(8, 4096);
        let ext = bm.alloc_blocks(4, 0).unwrap();
        bm.release_blocks(ext);
        assert_eq!(bm.free_blocks(), 8);
    }
}
