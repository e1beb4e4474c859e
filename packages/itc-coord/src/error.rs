//! Error types for the Coordinator.

use thiserror::Error;

use itc_core::ItcError;

/// Errors starting or running the Coordinator.
#[derive(Debug, Error)]
pub enum CoordError {
    /// The Coordinator's own ITC context failed.
    #[error("itc error: {0}")]
    Itc(#[from] ItcError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The configuration file is not valid JSON for [`crate::CoordConfig`].
    #[error("cannot parse configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// The name-server thread failed to start or stopped abnormally.
    #[error("name server: {0}")]
    NameServer(String),
}

/// Result type alias for Coordinator operations.
pub type Result<T> = std::result::Result<T, CoordError>;
