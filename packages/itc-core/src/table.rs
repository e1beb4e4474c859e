//! The process-wide mailbox table.
//!
//! Slots are allocated once at init and reused. The free list and the
//! per-process name index each have their own lock; mailboxes lock
//! individually, so unrelated mailboxes never contend.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{ItcError, Result};
use crate::mailbox::Mailbox;
use crate::mbox_id::MailboxId;

#[derive(Debug)]
pub(crate) struct MailboxTable {
    range: u32,
    coord_mask: u32,
    local_mask: u32,
    slots: Vec<Mailbox>,
    free: Mutex<VecDeque<usize>>,
    names: Mutex<HashMap<String, MailboxId>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MailboxTable {
    pub(crate) fn new(range: u32, coord_mask: u32, local_mask: u32, count: usize) -> Self {
        let slots = (0..count).map(|_| Mailbox::new()).collect();
        Self {
            range,
            coord_mask,
            local_mask,
            slots,
            free: Mutex::new((0..count).collect()),
            names: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn range(&self) -> u32 {
        self.range
    }

    pub(crate) fn coord_mask(&self) -> u32 {
        self.coord_mask
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn id_of(&self, index: usize) -> MailboxId {
        MailboxId::new(self.range, index as u32)
    }

    fn index_of(&self, id: MailboxId) -> Option<usize> {
        if id.is_none() || id.process_range(self.coord_mask) != self.range {
            return None;
        }
        if id.as_raw() & !(self.coord_mask | self.local_mask) != 0 {
            return None;
        }
        let index = id.local_index(self.local_mask) as usize;
        (index < self.slots.len()).then_some(index)
    }

    /// The slot of a mailbox of this process, whatever its state.
    pub(crate) fn lookup(&self, id: MailboxId) -> Option<&Mailbox> {
        self.index_of(id).map(|index| &self.slots[index])
    }

    pub(crate) fn acquire(&self) -> Option<usize> {
        lock(&self.free).pop_front()
    }

    pub(crate) fn release(&self, id: MailboxId) {
        if let Some(index) = self.index_of(id) {
            lock(&self.free).push_back(index);
        }
    }

    pub(crate) fn reserve_name(&self, name: &str, id: MailboxId) -> Result<()> {
        let mut names = lock(&self.names);
        if names.contains_key(name) {
            return Err(ItcError::NameInUse(name.to_string()));
        }
        names.insert(name.to_string(), id);
        Ok(())
    }

    pub(crate) fn release_name(&self, name: &str) {
        lock(&self.names).remove(name);
    }

    pub(crate) fn find_by_name(&self, name: &str) -> Option<MailboxId> {
        lock(&self.names).get(name).copied()
    }

    pub(crate) fn in_use_count(&self) -> usize {
        self.slots.len() - lock(&self.free).len()
    }
}
