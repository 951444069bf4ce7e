//! Volume-usage tracker (spec §4.2).
//!
//! Single-pass verification during mount: for each file the scan walks its
//! allocation structure and calls [`VolumeUsageMap::alloc_chunk`]. The
//! tracker records the first owner of a chunk; any subsequent owner
//! triggers a recorded conflict on both parties, but ownership of the slot
//! never changes hands (tie-break: first assignment wins).

use crate::arena::EntryId;

/// Identifies the owner of a tracked chunk. `System` covers volume
/// metadata (MDB, bitmap, B*-tree nodes) that isn't itself a file entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    System,
    Entry(EntryId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Unmarked,
    Marked { owner: Owner },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UsageAnalysis {
    pub marked_used: usize,
    pub unused_marked: usize,
    pub not_marked_used: usize,
    pub conflicts: usize,
}

/// A conflict recorded when a second owner touches an already-marked chunk.
#[derive(Debug, Clone, Copy)]
pub struct Conflict {
    pub chunk: u32,
    pub first_owner: Owner,
    pub second_owner: Owner,
}

pub struct VolumeUsageMap {
    slots: Vec<Slot>,
    conflicts: Vec<Conflict>,
}

impl VolumeUsageMap {
    pub fn new(num_chunks: usize) -> Self {
        Self {
            slots: vec![Slot::Unmarked; num_chunks],
            conflicts: Vec::new(),
        }
    }

    pub fn num_chunks(&self) -> usize {
        self.slots.len()
    }

    /// Marks a chunk in use without recording an owner (system metadata
    /// the scanner doesn't attribute to a specific file entry).
    pub fn mark_in_use(&mut self, chunk: u32) {
        self.set_usage(chunk, Owner::System);
    }

    /// Marks a chunk in use under `owner`, recording (not overwriting) a
    /// conflict if the chunk already has a different owner.
    pub fn set_usage(&mut self, chunk: u32, owner: Owner) {
        let idx = chunk as usize;
        if idx >= self.slots.len() {
            return;
        }
        match self.slots[idx] {
            Slot::Unmarked => self.slots[idx] = Slot::Marked { owner },
            Slot::Marked { owner: first } if first != owner => {
                self.conflicts.push(Conflict {
                    chunk,
                    first_owner: first,
                    second_owner: owner,
                });
            }
            Slot::Marked { .. } => {}
        }
    }

    /// Combined mark + set, as the spec names it: `alloc_chunk(block,
    /// entry)`.
    pub fn alloc_chunk(&mut self, chunk: u32, owner: EntryId) {
        self.set_usage(chunk, Owner::Entry(owner));
    }

    pub fn free_chunk(&mut self, chunk: u32) {
        let idx = chunk as usize;
        if idx < self.slots.len() {
            self.slots[idx] = Slot::Unmarked;
        }
    }

    pub fn is_used(&self, chunk: u32) -> bool {
        matches!(self.slots.get(chunk as usize), Some(Slot::Marked { .. }))
    }

    pub fn owner(&self, chunk: u32) -> Option<Owner> {
        match self.slots.get(chunk as usize) {
            Some(Slot::Marked { owner }) => Some(*owner),
            _ => None,
        }
    }

    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }

    /// Cross-references the tracker's marks against an independent
    /// bitmap-derived "is used" predicate (e.g. the on-disk volume
    /// bitmap), returning the four disjoint counts §8 property 7 checks.
    pub fn analyze(&self, disk_marked_used: impl Fn(u32) -> bool) -> UsageAnalysis {
        let mut result = UsageAnalysis {
            conflicts: self.conflicts.len(),
            ..Default::default()
        };
        for i in 0..self.slots.len() {
            let scan_used = self.is_used(i as u32);
            let disk_used = disk_marked_used(i as u32);
            match (scan_used, disk_used) {
                (true, true) => result.marked_used += 1,
                (true, false) => result.not_marked_used += 1,
                (false, true) => result.unused_marked += 1,
                (false, false) => {}
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::EntryId;

    #[test]
    fn first_owner_wins_and_conflict_recorded() {
        let mut map = VolumeUsageMap::new(4);
        let a = EntryId::from_raw(1, 0);
        let b = EntryId::from_raw(2, 0);
        map.alloc_chunk(0, a);
        map.alloc_chunk(0, b);
        assert_eq!(map.owner(0), Some(Owner::Entry(a)));
        assert_eq!(map.conflicts().len(), 1);
    }

    #[test]
    fn analyze_counts_are_disjoint() {
        let mut map = VolumeUsageMap::new(4);
        map.mark_in_use(0);
        let analysis = map.analyze(|chunk| chunk == 1);
        assert_eq!(analysis.marked_used, 1);
        assert_eq!(analysis.unused_marked, 1);
        assert_eq!(analysis.not_marked_used, 0);
    }
}
