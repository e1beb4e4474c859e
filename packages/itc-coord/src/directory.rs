//! The host-wide name directory.
//!
//! All access goes through one lock, so the no-duplicate-names invariant
//! holds across concurrent inserts and removals.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use itc_core::MailboxId;

/// Directory integrity violations. These point at a bug in a peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("name {name:?} is already registered to {existing}")]
    Duplicate { name: String, existing: MailboxId },

    #[error("name {0:?} is not registered")]
    Missing(String),

    #[error("name {name:?} belongs to {registered}, not {claimed}")]
    Mismatch {
        name: String,
        registered: MailboxId,
        claimed: MailboxId,
    },
}

#[derive(Debug, Default)]
pub struct NameDirectory {
    entries: Mutex<BTreeMap<String, MailboxId>>,
}

impl NameDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, MailboxId>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, name: &str, id: MailboxId) -> Result<(), DirectoryError> {
        let mut entries = self.entries();
        if let Some(existing) = entries.get(name) {
            return Err(DirectoryError::Duplicate {
                name: name.to_string(),
                existing: *existing,
            });
        }
        entries.insert(name.to_string(), id);
        Ok(())
    }

    /// Remove `name` if it is registered to `id`.
    pub fn remove(&self, name: &str, id: MailboxId) -> Result<(), DirectoryError> {
        let mut entries = self.entries();
        match entries.get(name) {
            None => Err(DirectoryError::Missing(name.to_string())),
            Some(registered) if *registered != id => Err(DirectoryError::Mismatch {
                name: name.to_string(),
                registered: *registered,
                claimed: id,
            }),
            Some(_) => {
                entries.remove(name);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<MailboxId> {
        self.entries().get(name).copied()
    }

    /// Drop every entry whose mailbox lives in `range`. Returns the removed
    /// names.
    pub fn purge_range(&self, range: u32, coord_mask: u32) -> Vec<String> {
        let mut purged = Vec::new();
        self.entries().retain(|name, id| {
            let keep = id.process_range(coord_mask) != range;
            if !keep {
                purged.push(name.clone());
            }
            keep
        });
        purged
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itc_core::{range_for, COORD_MASK};

    fn id(process: u32, index: u32) -> MailboxId {
        MailboxId::new(range_for(process), index)
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let dir = NameDirectory::new();
        dir.insert("svc", id(1, 0)).unwrap();
        assert_eq!(
            dir.insert("svc", id(2, 0)),
            Err(DirectoryError::Duplicate {
                name: "svc".to_string(),
                existing: id(1, 0)
            })
        );
        assert_eq!(dir.lookup("svc"), Some(id(1, 0)));
    }

    #[test]
    fn remove_checks_owner() {
        let dir = NameDirectory::new();
        dir.insert("svc", id(1, 0)).unwrap();
        assert!(matches!(
            dir.remove("svc", id(1, 1)),
            Err(DirectoryError::Mismatch { .. })
        ));
        dir.remove("svc", id(1, 0)).unwrap();
        assert_eq!(
            dir.remove("svc", id(1, 0)),
            Err(DirectoryError::Missing("svc".to_string()))
        );
        assert!(dir.is_empty());
    }

    #[test]
    fn purge_removes_only_that_range() {
        let dir = NameDirectory::new();
        dir.insert("a", id(1, 0)).unwrap();
        dir.insert("b", id(1, 3)).unwrap();
        dir.insert("c", id(2, 0)).unwrap();

        let mut purged = dir.purge_range(range_for(1), COORD_MASK);
        purged.sort();
        assert_eq!(purged, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.lookup("c"), Some(id(2, 0)));
    }
}
