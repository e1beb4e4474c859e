//! Mailbox identifiers.
//!
//! An identifier packs two fields into a `u32`:
//!
//! ```text
//!  31        20 19                     0
//! ┌────────────┬────────────────────────┐
//! │ process id │      local index       │
//! └────────────┴────────────────────────┘
//! ```
//!
//! The process-id field is handed out by the Coordinator; the local index
//! is a slot in the owning process's mailbox table. Masking an identifier
//! with [`COORD_MASK`] yields the owning process's range.

use crate::error::{ItcError, Result};

/// Mask selecting the process-id field.
pub const COORD_MASK: u32 = 0xFFF0_0000;

/// Bit position of the process-id field.
pub const COORD_SHIFT: u32 = 20;

/// Range reserved for the Coordinator process.
pub const COORD_RANGE: u32 = 0xFFF0_0000;

/// Highest process-id value the Coordinator may hand out.
pub const MAX_PROCESSES: u32 = 0xFFE;

/// Range of the process with the given process-id value.
pub const fn range_for(process: u32) -> u32 {
    process << COORD_SHIFT
}

/// Local-index mask for a table of `count` mailboxes.
///
/// The count is rounded up to the next power of two minus one. The mask
/// must not reach into the process-id field.
pub fn local_mask_for(count: usize) -> Result<u32> {
    if count == 0 {
        return Err(ItcError::InvalidArgument(
            "mailbox count must be at least 1".to_string(),
        ));
    }

    let mask = count
        .checked_next_power_of_two()
        .map(|p| p - 1)
        .and_then(|m| u32::try_from(m).ok())
        .ok_or_else(|| ItcError::InvalidArgument(format!("mailbox count {} too large", count)))?;

    if mask & COORD_MASK != 0 {
        return Err(ItcError::InvalidArgument(format!(
            "mailbox count {} overlaps the process-id field",
            count
        )));
    }
    Ok(mask)
}

/// Identifier of a mailbox, unique across every process on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MailboxId(u32);

impl MailboxId {
    /// The "no mailbox" identifier.
    pub const NONE: MailboxId = MailboxId(0);

    /// Build an identifier from a process range and a local index.
    pub const fn new(range: u32, index: u32) -> Self {
        Self(range | index)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// The range of the process owning this mailbox.
    pub const fn process_range(self, coord_mask: u32) -> u32 {
        self.0 & coord_mask
    }

    /// The index of this mailbox in its owner's table.
    pub const fn local_index(self, local_mask: u32) -> u32 {
        self.0 & local_mask
    }
}

impl std::fmt::Display for MailboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
