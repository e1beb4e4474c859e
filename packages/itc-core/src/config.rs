//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::alloc::AllocScheme;
use crate::error::{ItcError, Result};

/// Default directory holding the Coordinator's and transports' sockets.
pub const DEFAULT_SOCKET_DIR: &str = "/tmp/itc";

/// Default number of mailboxes per process.
pub const DEFAULT_MAILBOX_COUNT: usize = 64;

/// How a process joins the ITC world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitMode {
    /// Obtain a range from the Coordinator and run the local-socket
    /// transport alongside the in-process one.
    #[default]
    Coordinated,
    /// No Coordinator: a fixed range, in-process delivery only.
    Standalone,
}

/// Configuration for [`crate::Itc::init`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItcConfig {
    /// Size of the mailbox table.
    pub mailbox_count: usize,
    /// Namespace of this host. Sends naming another namespace go to the
    /// gateway.
    pub namespace: String,
    /// Directory where Unix sockets are created.
    pub socket_dir: PathBuf,
    pub alloc: AllocScheme,
    pub mode: InitMode,
}

impl Default for ItcConfig {
    fn default() -> Self {
        Self {
            mailbox_count: DEFAULT_MAILBOX_COUNT,
            namespace: String::new(),
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            alloc: AllocScheme::default(),
            mode: InitMode::default(),
        }
    }
}

impl ItcConfig {
    /// A standalone configuration with `mailbox_count` mailboxes.
    pub fn standalone(mailbox_count: usize) -> Self {
        Self {
            mailbox_count,
            mode: InitMode::Standalone,
            ..Self::default()
        }
    }

    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_alloc(mut self, alloc: AllocScheme) -> Self {
        self.alloc = alloc;
        self
    }

    /// Defaults overlaid with `ITC_SOCKET_DIR`, `ITC_NAMESPACE` and
    /// `ITC_MAILBOX_COUNT`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values from `lookup`, which maps variable names to values.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("ITC_SOCKET_DIR") {
            self.socket_dir = PathBuf::from(dir);
        }
        if let Some(ns) = lookup("ITC_NAMESPACE") {
            self.namespace = ns;
        }
        if let Some(count) = lookup("ITC_MAILBOX_COUNT") {
            self.mailbox_count = count.trim().parse().map_err(|_| {
                ItcError::InvalidArgument(format!("ITC_MAILBOX_COUNT is not a number: {count:?}"))
            })?;
        }
        Ok(())
    }
}

/// How long `receive` may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Return immediately.
    NoWait,
    /// Block until a message arrives.
    Forever,
    /// Block for at most this many milliseconds.
    Millis(u64),
}

impl Timeout {
    pub(crate) fn as_duration(self) -> Option<Duration> {
        match self {
            Timeout::NoWait => Some(Duration::ZERO),
            Timeout::Forever => None,
            Timeout::Millis(ms) => Some(Duration::from_millis(ms)),
        }
    }

    /// Milliseconds for the wire, saturating; `Forever` is `u32::MAX`.
    pub(crate) fn as_wire_millis(self) -> u32 {
        match self {
            Timeout::NoWait => 0,
            Timeout::Forever => u32::MAX,
            Timeout::Millis(ms) => u32::try_from(ms).unwrap_or(u32::MAX),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            Timeout::NoWait
        } else {
            Timeout::Millis(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = ItcConfig::default();
        assert_eq!(config.mailbox_count, DEFAULT_MAILBOX_COUNT);
        assert_eq!(config.mode, InitMode::Coordinated);
        assert_eq!(config.socket_dir, PathBuf::from(DEFAULT_SOCKET_DIR));
    }

    #[test]
    fn env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("ITC_SOCKET_DIR", "/run/itc"),
            ("ITC_NAMESPACE", "hosta"),
            ("ITC_MAILBOX_COUNT", "128"),
        ]
        .into_iter()
        .collect();

        let mut config = ItcConfig::default();
        config
            .apply_env(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.socket_dir, PathBuf::from("/run/itc"));
        assert_eq!(config.namespace, "hosta");
        assert_eq!(config.mailbox_count, 128);
    }

    #[test]
    fn env_overlay_rejects_bad_count() {
        let mut config = ItcConfig::default();
        let err = config
            .apply_env(|k| (k == "ITC_MAILBOX_COUNT").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ItcError::InvalidArgument(_)));
    }

    #[test]
    fn partial_json() {
        let config: ItcConfig =
            serde_json::from_str(r#"{"mailbox_count": 8, "mode": "standalone"}"#).unwrap();
        assert_eq!(config.mailbox_count, 8);
        assert_eq!(config.mode, InitMode::Standalone);
        assert_eq!(config.alloc, AllocScheme::Malloc);
    }

    #[test]
    fn timeout_conversions() {
        assert_eq!(Timeout::from(Duration::ZERO), Timeout::NoWait);
        assert_eq!(Timeout::from(Duration::from_millis(250)), Timeout::Millis(250));
        assert_eq!(Timeout::Forever.as_duration(), None);
        assert_eq!(Timeout::Forever.as_wire_millis(), u32::MAX);
        assert_eq!(Timeout::Millis(7).as_wire_millis(), 7);
    }
}
