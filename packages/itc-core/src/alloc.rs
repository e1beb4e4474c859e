//! Message memory accounting.
//!
//! Every live message holds a [`Lease`] on the process allocator. With the
//! `Malloc` scheme the lease only tracks usage; with the `Pool` scheme the
//! sum of all leases is capped and allocation fails once the cap is hit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ItcError, Result};

/// How message buffers are allocated.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum AllocScheme {
    /// Plain heap allocation, limited only by the system.
    #[default]
    Malloc,
    /// Heap allocation capped at `bytes` across all live messages.
    Pool { bytes: usize },
}

/// Process-wide allocator handing out leases.
#[derive(Debug)]
pub(crate) struct Allocator {
    limit: Option<usize>,
    used: Arc<AtomicUsize>,
}

impl Allocator {
    pub(crate) fn new(scheme: &AllocScheme) -> Self {
        let limit = match scheme {
            AllocScheme::Malloc => None,
            AllocScheme::Pool { bytes } => Some(*bytes),
        };
        Self {
            limit,
            used: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reserve `bytes` from the budget.
    pub(crate) fn lease(&self, bytes: usize) -> Result<Lease> {
        match self.limit {
            None => {
                self.used.fetch_add(bytes, Ordering::Relaxed);
            }
            Some(limit) => {
                self.used
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                        used.checked_add(bytes).filter(|total| *total <= limit)
                    })
                    .map_err(|_| ItcError::OutOfMemory(bytes))?;
            }
        }

        Ok(Lease {
            bytes,
            used: Arc::clone(&self.used),
        })
    }

    /// Bytes currently held by live messages.
    pub(crate) fn in_use(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}

/// A reservation returned to the allocator on drop.
#[derive(Debug)]
pub(crate) struct Lease {
    bytes: usize,
    used: Arc<AtomicUsize>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.used.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}
