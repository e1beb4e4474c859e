//! Boundary to the cross-host gateway.
//!
//! The gateway itself lives outside this crate. A process that hosts one
//! installs a [`Gateway`] with [`crate::Itc::set_gateway`]; `send` hands it
//! every message addressed to a namespace other than the local one.
//!
//! On the Coordinator side the gateway is a mailbox registered under
//! [`GATEWAY_MAILBOX_NAME`]. Locate requests that miss the local directory
//! are forwarded to it as [`crate::wire::GW_LOCATE_REQUEST`] messages.

use crate::error::SendError;
use crate::mbox_id::MailboxId;
use crate::message::Message;

/// Well-known name of the gateway's mailbox.
pub const GATEWAY_MAILBOX_NAME: &str = "itc_gateway";

/// Forwards messages to other hosts.
pub trait Gateway: Send + Sync {
    /// Forward `message` to mailbox `to` in `namespace`. The message header
    /// already carries sender and receiver. On failure the message comes
    /// back inside the error.
    fn forward(&self, namespace: &str, to: MailboxId, message: Message) -> Result<(), SendError>;
}
