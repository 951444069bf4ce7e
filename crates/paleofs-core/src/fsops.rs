//! The shared `check_file_access` gate (spec §4.8) that every "modify"
//! operation runs through before touching an entry.

use crate::descriptor::{Mode, OpenFileTable, Part};
use crate::error::{Error, Result};
use crate::entry::EntryFlags;

/// Spec §4.8's Closed→Raw→FileAccess→Disposed lifecycle. `Closed` itself
/// has no member here: it is represented by the absence of a mounted
/// volume (pre-`mount`) or, for a gated device, by
/// [`crate::gate::AccessLevel::Closed`] — there is nothing for a `FsMode`
/// value to mean before a volume object exists to hold one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsMode {
    Raw,
    FileAccess,
    /// Terminal state after `close_all()`; every subsequent file-access
    /// check fails with `Disposed` regardless of entry state.
    Disposed,
}

/// Parameters `check_file_access` needs from the calling filesystem.
pub struct AccessCheck<'a> {
    pub fs_mode: FsMode,
    pub image_read_only: bool,
    pub entry_flags: &'a EntryFlags,
    pub want_write: bool,
    pub entry_belongs_to_this_fs: bool,
}

/// Mirrors spec §4.8's shared gate: fails with `Disposed`, `WrongMode`,
/// `ReadOnly`, `NotPartOfThisFs`, `Damaged`, or `DubiousAndWriting` as
/// appropriate, in that priority order.
pub fn check_file_access(check: &AccessCheck) -> Result<()> {
    if check.fs_mode == FsMode::Disposed {
        return Err(Error::Disposed);
    }
    if !check.entry_flags.is_valid() {
        return Err(Error::Disposed);
    }
    if check.fs_mode != FsMode::FileAccess {
        return Err(Error::WrongMode("operation requires file-access mode"));
    }
    if !check.entry_belongs_to_this_fs {
        return Err(Error::NotPartOfThisFs);
    }
    if check.want_write && check.image_read_only {
        return Err(Error::ReadOnly);
    }
    if check.entry_flags.is_damaged() {
        return Err(Error::Damaged);
    }
    if check.want_write && check.entry_flags.is_dubious() {
        return Err(Error::DubiousAndWriting);
    }
    Ok(())
}

/// Thin wrapper tying the open-file table check into the same call site,
/// since `open_file` needs both checks before minting a descriptor.
pub fn check_open(
    table: &mut OpenFileTable,
    entry: crate::arena::EntryId,
    part: Part,
    mode: Mode,
) -> Result<()> {
    table.try_acquire(entry, part, mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryFlags;

    #[test]
    fn raw_mode_rejects_write_ops() {
        let flags = EntryFlags::new();
        let check = AccessCheck {
            fs_mode: FsMode::Raw,
            image_read_only: false,
            entry_flags: &flags,
            want_write: true,
            entry_belongs_to_this_fs: true,
        };
        assert!(matches!(check_file_access(&check), Err(Error::WrongMode(_))));
    }

    #[test]
    fn dubious_entry_rejects_write_but_not_read() {
        let mut flags = EntryFlags::new();
        flags.add_conflict();
        let mut check = AccessCheck {
            fs_mode: FsMode::FileAccess,
            image_read_only: false,
            entry_flags: &flags,
            want_write: true,
            entry_belongs_to_this_fs: true,
        };
        assert!(matches!(
            check_file_access(&check),
            Err(Error::DubiousAndWriting)
        ));
        check.want_write = false;
        assert!(check_file_access(&check).is_ok());
    }
}
