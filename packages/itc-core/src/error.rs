//! Error types for the ITC core.
//!
//! Every public operation returns one of these. [`ItcError::category`]
//! sorts them into configuration, exhaustion, integrity, transient and
//! fatal failures so callers can decide whether to retry, log or abort.

use thiserror::Error;

use crate::mbox_id::MailboxId;
use crate::message::Message;
use crate::wire::WireError;

/// Broad classification of an [`ItcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Wrong arguments or calling a context in the wrong state.
    Configuration,
    /// A bounded resource ran out (memory, mailbox slots, process slots).
    Exhaustion,
    /// A caller or peer broke the protocol; always worth logging.
    Integrity,
    /// Expected during startup races; retrying later may succeed.
    Transient,
    /// The OS refused a primitive the runtime cannot work without.
    Fatal,
}

/// Errors returned by the ITC core.
#[derive(Debug, Error)]
pub enum ItcError {
    /// The context has been shut down with `exit`.
    #[error("ITC is not initialized")]
    NotInitialized,

    /// An argument was out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The calling thread already owns a mailbox in this context.
    #[error("calling thread already owns mailbox {0}")]
    AlreadyOwned(MailboxId),

    /// The calling thread owns no mailbox in this context.
    #[error("calling thread owns no mailbox")]
    NoMailbox,

    /// The mailbox is not the calling thread's own mailbox.
    #[error("mailbox {0} is not owned by the calling thread")]
    NotOwner(MailboxId),

    /// The mailbox slot is not in use.
    #[error("mailbox {0} is not active")]
    NotActiveMailbox(MailboxId),

    /// Mailbox names are limited to [`crate::MAX_NAME_LEN`] bytes.
    #[error("mailbox name is {len} bytes, maximum is {max}")]
    NameTooLong { len: usize, max: usize },

    /// Another mailbox of this process already uses the name.
    #[error("mailbox name already in use: {0}")]
    NameInUse(String),

    /// Every slot of the mailbox table is in use.
    #[error("no free mailbox slots")]
    NoFreeSlots,

    /// The Coordinator has no free process slot for this process.
    #[error("coordinator has no free process slots")]
    NoProcessSlot,

    /// `exit` was called while mailboxes were still open.
    #[error("{0} mailboxes are still open")]
    MailboxesOpen(usize),

    /// Requested payload exceeds what every transport can carry.
    #[error("message size {size} exceeds maximum {max}")]
    InvalidSize { size: usize, max: usize },

    /// The allocator could not satisfy the request.
    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),

    /// The trailing sentinel of a message was damaged.
    #[error("corrupt message: {0}")]
    CorruptMessage(String),

    /// Sending to one's own mailbox would deadlock a receiver.
    #[error("sending to own mailbox {0} would deadlock")]
    SendToSelf(MailboxId),

    /// No transport recognised the destination.
    #[error("no transport knows destination {0}")]
    UnknownDestination(MailboxId),

    /// The destination process has not opened its channel yet.
    #[error("receiver {0} has not opened its channel yet")]
    ReceiverNotReady(MailboxId),

    /// A message was addressed to another namespace but no gateway is set.
    #[error("no gateway for namespace {0:?}")]
    NoGateway(String),

    /// Malformed bytes on a socket.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// An I/O error from the OS.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ItcError {
    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        use std::io::ErrorKind;

        match self {
            ItcError::NotInitialized
            | ItcError::InvalidArgument(_)
            | ItcError::AlreadyOwned(_)
            | ItcError::NoMailbox
            | ItcError::NotOwner(_)
            | ItcError::NotActiveMailbox(_)
            | ItcError::NameTooLong { .. }
            | ItcError::NameInUse(_)
            | ItcError::MailboxesOpen(_)
            | ItcError::InvalidSize { .. }
            | ItcError::SendToSelf(_)
            | ItcError::NoGateway(_) => ErrorCategory::Configuration,
            ItcError::NoFreeSlots | ItcError::NoProcessSlot | ItcError::OutOfMemory(_) => {
                ErrorCategory::Exhaustion
            }
            ItcError::CorruptMessage(_) | ItcError::Wire(_) => ErrorCategory::Integrity,
            ItcError::UnknownDestination(_) | ItcError::ReceiverNotReady(_) => {
                ErrorCategory::Transient
            }
            ItcError::Io(e) => match e.kind() {
                ErrorKind::NotFound
                | ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::BrokenPipe
                | ErrorKind::WouldBlock
                | ErrorKind::TimedOut
                | ErrorKind::UnexpectedEof => ErrorCategory::Transient,
                _ => ErrorCategory::Fatal,
            },
        }
    }

    /// Whether this error is expected during startup races.
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

/// A failed `send`.
///
/// The message was not delivered, so ownership comes back to the caller,
/// who decides whether to retry or free it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SendError {
    error: ItcError,
    message: Message,
}

impl SendError {
    pub fn new(error: ItcError, message: Message) -> Self {
        Self { error, message }
    }

    /// The reason the send failed.
    pub fn error(&self) -> &ItcError {
        &self.error
    }

    /// Take the undelivered message back.
    pub fn into_message(self) -> Message {
        self.message
    }

    pub fn into_parts(self) -> (ItcError, Message) {
        (self.error, self.message)
    }
}

/// Result type alias for ITC operations.
pub type Result<T> = std::result::Result<T, ItcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        assert_eq!(ItcError::NoFreeSlots.category(), ErrorCategory::Exhaustion);
        assert_eq!(
            ItcError::CorruptMessage("x".into()).category(),
            ErrorCategory::Integrity
        );
        assert_eq!(
            ItcError::SendToSelf(MailboxId::from_raw(1)).category(),
            ErrorCategory::Configuration
        );
        assert!(ItcError::ReceiverNotReady(MailboxId::from_raw(1)).is_transient());
    }

    #[test]
    fn io_category_depends_on_kind() {
        let refused = ItcError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(refused.is_transient());

        let denied = ItcError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert_eq!(denied.category(), ErrorCategory::Fatal);
    }

    #[test]
    fn error_display() {
        let e = ItcError::NameTooLong { len: 300, max: 255 };
        assert!(e.to_string().contains("300"));
        assert!(e.to_string().contains("255"));

        let e = ItcError::NotOwner(MailboxId::from_raw(0x0010_0002));
        assert!(e.to_string().contains("0x00100002"));
    }
}
