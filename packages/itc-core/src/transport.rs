//! Transport backends.
//!
//! The core keeps an ordered list of backends: the in-process transport
//! first, then the process-external ones. `send` walks the list until a
//! backend claims the destination; `receive` asks each backend in turn for
//! a message queued for the mailbox.

use std::path::Path;
use std::sync::Weak;

use crate::error::{Result, SendError};
use crate::mailbox::{Filter, MailboxQueue};
use crate::mbox_id::MailboxId;
use crate::message::Message;

/// What the Coordinator assigned to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorInfo {
    /// This process's identifier range.
    pub my_range: u32,
    /// Mask selecting the process-id field.
    pub coord_mask: u32,
    /// The Coordinator's name-server mailbox, [`MailboxId::NONE`] when
    /// running without a Coordinator.
    pub coord_id: MailboxId,
}

/// Per-process parameters handed to [`Transport::init`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Setup<'a> {
    pub my_range: u32,
    pub coord_mask: u32,
    pub mailbox_count: usize,
    pub socket_dir: &'a Path,
}

/// The outcome of [`Transport::send`].
#[derive(Debug)]
pub(crate) enum Delivery {
    /// The backend accepted the message.
    Delivered,
    /// The destination is not reachable through this backend; the next
    /// backend gets the message.
    NotMine(Message),
    /// The backend owns the destination but delivery failed.
    Failed(SendError),
}

/// Entry points a transport uses to hand inbound messages to the core.
pub(crate) trait LocalSink: Send + Sync {
    /// Allocate a message for an inbound frame.
    fn allocate(&self, kind: u32, size: usize) -> Result<Message>;

    /// Deliver a fully-addressed message to a mailbox of this process.
    fn deliver(&self, message: Message) -> std::result::Result<(), SendError>;
}

/// A delivery mechanism.
///
/// Hooks a backend does not need keep their default.
pub(crate) trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Perform the Coordinator handshake. `None` when this backend cannot.
    fn locate_coordinator(&self) -> Option<Result<CoordinatorInfo>> {
        None
    }

    fn init(&self, _setup: &Setup<'_>, _sink: Weak<dyn LocalSink>) -> Result<()> {
        Ok(())
    }

    /// Tear down. The core only calls this with no mailbox open.
    fn exit(&self) {}

    fn create_mailbox(&self, _id: MailboxId, _name: &str) -> Result<()> {
        Ok(())
    }

    fn delete_mailbox(&self, _id: MailboxId) {}

    /// Attempt delivery to `to`. `dest` is the locked destination queue when
    /// `to` belongs to this process.
    fn send(&self, message: Message, to: MailboxId, dest: Option<&mut MailboxQueue>) -> Delivery;

    /// Take one pending message for `queue` accepted by `filter`.
    fn receive(&self, _queue: &mut MailboxQueue, _filter: &Filter<'_>) -> Option<Message> {
        None
    }

    /// Largest payload this backend carries.
    fn max_message_size(&self) -> usize;
}
