//! # ITC Core
//!
//! Mailbox-based message passing between threads, and between processes on
//! the same host.
//!
//! ## Core Concepts
//!
//! ### Mailboxes
//!
//! A **mailbox** is a named endpoint owned by exactly one thread. A thread
//! creates at most one mailbox per [`Itc`] context; only that thread may
//! receive from it, send with it as the sender, or delete it. When the
//! thread exits the mailbox is torn down exactly as if it had been deleted.
//!
//! Every mailbox has a [`MailboxId`]. The high bits name the owning process
//! (a range handed out by the Coordinator), the low bits index the owner's
//! mailbox table, so an id alone tells the runtime where to deliver.
//!
//! ### Messages
//!
//! A [`Message`] is an owned buffer. `send` and `free` consume it, so
//! nothing can touch a message after handing it off. A failed send returns
//! it inside the [`SendError`].
//!
//! ### Transports
//!
//! Delivery goes through an ordered list of backends: in-process queues
//! first, then a Unix-socket transport for other processes. The first
//! backend that claims a destination decides the outcome.
//!
//! ### The Coordinator
//!
//! A separate process (see the `itc-coord` crate) assigns process ranges
//! and keeps the host-wide name directory. Mailbox creation and deletion
//! are reported to it; [`Itc::locate`] asks it to resolve names.
//!
//! ## Example
//!
//! ```ignore
//! use itc_core::{Itc, ItcConfig, Timeout};
//!
//! let itc = Itc::init(ItcConfig::from_env()?)?;
//! let me = itc.create_mailbox("client")?;
//!
//! let server = itc
//!     .locate("server", Timeout::Millis(1000), true)?
//!     .ok_or("server not running")?;
//!
//! let request = itc.alloc_with(0x100, b"hello")?;
//! itc.send(request, server.id, None, None)
//!     .map_err(|e| e.into_parts().0)?;
//!
//! if let Some(reply) = itc.receive(Timeout::Millis(1000))? {
//!     println!("{} bytes from {}", reply.size(), reply.sender());
//!     itc.free(reply)?;
//! }
//!
//! itc.delete_mailbox(me)?;
//! itc.exit()?;
//! ```

mod alloc;
mod config;
mod coord_client;
mod error;
mod gateway;
mod itc;
mod local;
mod lsock;
mod mailbox;
mod mbox_id;
mod message;
mod notify;
mod ownership;
pub mod paths;
mod table;
mod transport;
pub mod wire;

pub use crate::alloc::AllocScheme;
pub use config::{InitMode, ItcConfig, Timeout, DEFAULT_MAILBOX_COUNT, DEFAULT_SOCKET_DIR};
pub use error::{ErrorCategory, ItcError, Result, SendError};
pub use gateway::{Gateway, GATEWAY_MAILBOX_NAME};
pub use itc::{Itc, Located, STANDALONE_RANGE};
pub use mbox_id::{
    local_mask_for, range_for, MailboxId, COORD_MASK, COORD_RANGE, COORD_SHIFT, MAX_PROCESSES,
};
pub use message::{Message, MessageHeader, HEADER_SIZE, SENTINEL};
pub use notify::Notifier;
pub use transport::CoordinatorInfo;

/// Longest mailbox name in bytes.
pub const MAX_NAME_LEN: usize = 255;
