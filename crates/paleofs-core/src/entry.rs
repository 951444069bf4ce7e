//! Shared file-entry flag bookkeeping (spec §3 "File entry").
//!
//! Format crates define their own entry struct with format-specific
//! fields (catalog keys, dirent bytes, …) but embed [`EntryFlags`] for the
//! validity/damaged/dubious bookkeeping common to all of them, and
//! implement [`Dubious`] so the volume-usage tracker's conflict reporting
//! (§4.2) can mark an entry dubious without knowing its concrete type.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryState: u8 {
        /// Cleared when the entry is deleted or its parent is invalidated.
        const VALID   = 0b0001;
        /// Set when on-disk structure for this entry is known corrupt;
        /// both reads and writes are refused while set.
        const DAMAGED = 0b0010;
        /// Set by a conflict (two owners of one chunk) or a bad link;
        /// reads remain permitted, writes are refused.
        const DUBIOUS = 0b0100;
    }
}

impl Default for EntryState {
    fn default() -> Self {
        EntryState::VALID
    }
}

/// Implemented by every format's file-entry type so the volume-usage
/// tracker can call `add_conflict` without a format-specific dependency.
pub trait Dubious {
    fn add_conflict(&mut self);
    fn is_dubious(&self) -> bool;
}

/// A minimal default implementation formats can embed verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryFlags {
    pub state: EntryState,
}

impl EntryFlags {
    pub fn new() -> Self {
        Self {
            state: EntryState::VALID,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state.contains(EntryState::VALID)
    }

    pub fn invalidate(&mut self) {
        self.state.remove(EntryState::VALID);
    }

    pub fn is_damaged(&self) -> bool {
        self.state.contains(EntryState::DAMAGED)
    }

    pub fn mark_damaged(&mut self) {
        self.state.insert(EntryState::DAMAGED);
    }
}

impl Dubious for EntryFlags {
    fn add_conflict(&mut self) {
        self.state.insert(EntryState::DUBIOUS);
    }

    fn is_dubious(&self) -> bool {
        self.state.contains(EntryState::DUBIOUS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_marks_dubious_without_clearing_valid() {
        let mut flags = EntryFlags::new();
        flags.add_conflict();
        assert!(flags.is_dubious());
        assert!(flags.is_valid());
    }
}
