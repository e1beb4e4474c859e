//! # ITC Coordinator
//!
//! The host-wide service that every coordinated ITC process talks to. It
//!
//! - hands each process an identifier range over a two-step socket
//!   handshake, and reclaims the range when the process goes away,
//! - keeps the directory of mailbox names, fed by ADD and RMV messages,
//! - answers locate-by-name requests, optionally through a gateway.
//!
//! ```ignore
//! let coordinator = Coordinator::start(CoordConfig::default()).await?;
//! tokio::signal::ctrl_c().await?;
//! coordinator.shutdown().await?;
//! ```

mod config;
mod coordinator;
pub mod directory;
mod error;
mod name_server;
mod service;
pub mod slots;

pub use config::CoordConfig;
pub use coordinator::Coordinator;
pub use directory::{DirectoryError, NameDirectory};
pub use error::{CoordError, Result};
pub use name_server::NAME_SERVER_MAILBOX;
pub use slots::{SlotPools, SlotState};
