//! The shared transaction discipline archive formats follow (spec §5):
//! `start_transaction → Add/DeletePart/rename → commit_transaction` or
//! `cancel_transaction`. Only one transaction is ever open at a time, and
//! reads are refused while it is.

use paleofs_core::Error;

/// A pending mutation queued inside an open transaction.
pub enum PartOp {
    Add { name: String, data: Vec<u8> },
    Delete { name: String },
    Rename { from: String, to: String },
}

/// Shared open/closed bookkeeping for a transactional archive. Archive
/// types embed this rather than re-deriving the "only one at a time"
/// check themselves.
#[derive(Default)]
pub struct TransactionState {
    ops: Option<Vec<PartOp>>,
}

impl TransactionState {
    pub fn is_open(&self) -> bool {
        self.ops.is_some()
    }

    pub fn start(&mut self) -> paleofs_core::Result<()> {
        if self.is_open() {
            return Err(Error::OpenConflict);
        }
        self.ops = Some(Vec::new());
        Ok(())
    }

    pub fn push(&mut self, op: PartOp) -> paleofs_core::Result<()> {
        self.ops.as_mut().ok_or(Error::WrongMode("no open transaction"))?.push(op);
        Ok(())
    }

    /// Drops every queued op — and, with it, every `PartSource` payload
    /// handed to `Add` — without applying any of them (spec §5: "a cancel
    /// disposes any `IPartSource` handed in").
    pub fn cancel(&mut self) {
        self.ops = None;
    }

    /// Takes the queued ops for `commit_transaction` to apply, closing the
    /// transaction regardless of whether the caller goes on to succeed.
    pub fn take_for_commit(&mut self) -> paleofs_core::Result<Vec<PartOp>> {
        self.ops.take().ok_or(Error::WrongMode("no open transaction"))
    }

    pub fn require_closed_for_read(&self) -> paleofs_core::Result<()> {
        if self.is_open() {
            return Err(Error::OpenConflict);
        }
        Ok(())
    }
}
