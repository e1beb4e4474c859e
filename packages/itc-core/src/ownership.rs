//! Thread-local mailbox ownership.
//!
//! Each thread keeps a list of [`OwnedMailbox`] guards, at most one per
//! [`crate::Itc`] context. Dropping a guard tears its mailbox down, so
//! `delete_mailbox` and thread exit (including unwinding) share one path.

use std::cell::RefCell;
use std::sync::{Arc, Weak};

use crate::error::{ItcError, Result};
use crate::itc::Shared;
use crate::mbox_id::MailboxId;

struct OwnedMailbox {
    shared: Weak<Shared>,
    id: MailboxId,
}

impl OwnedMailbox {
    fn belongs_to(&self, shared: &Arc<Shared>) -> bool {
        Weak::as_ptr(&self.shared) == Arc::as_ptr(shared)
    }
}

impl Drop for OwnedMailbox {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.teardown(self.id);
        }
    }
}

thread_local! {
    static OWNED: RefCell<Vec<OwnedMailbox>> = const { RefCell::new(Vec::new()) };
}

/// The mailbox the calling thread owns in `shared`.
pub(crate) fn owned(shared: &Arc<Shared>) -> Option<MailboxId> {
    OWNED
        .try_with(|owned| {
            owned
                .borrow()
                .iter()
                .find(|o| o.belongs_to(shared))
                .map(|o| o.id)
        })
        .ok()
        .flatten()
}

/// Record that the calling thread owns `id`.
pub(crate) fn register(shared: &Arc<Shared>, id: MailboxId) -> Result<()> {
    OWNED
        .try_with(|owned| {
            let mut owned = owned.borrow_mut();
            // Guards of dropped contexts have nothing left to tear down.
            owned.retain(|o| o.shared.strong_count() > 0);
            owned.push(OwnedMailbox {
                shared: Arc::downgrade(shared),
                id,
            });
        })
        .map_err(|_| ItcError::InvalidArgument("calling thread is exiting".to_string()))
}

/// Drop the calling thread's guard for `id`, tearing the mailbox down.
/// Returns false when the thread does not own `id`.
pub(crate) fn release(shared: &Arc<Shared>, id: MailboxId) -> bool {
    let guard = OWNED
        .try_with(|owned| {
            let mut owned = owned.borrow_mut();
            let pos = owned
                .iter()
                .position(|o| o.id == id && o.belongs_to(shared))?;
            Some(owned.swap_remove(pos))
        })
        .ok()
        .flatten();

    // Teardown runs outside the borrow.
    match guard {
        Some(guard) => {
            drop(guard);
            true
        }
        None => false,
    }
}
