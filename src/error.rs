//! Error taxonomy for the instance lifecycle core.
//!
//! Every variant is surfaced to the caller as-is; nothing in the core retries
//! internally. The HTTP layer maps each variant to a status code in
//! [`crate::server`].

use std::path::PathBuf;

use thiserror::Error;

pub type KeeperResult<T> = Result<T, KeeperError>;

#[derive(Debug, Error)]
pub enum KeeperError {
    /// Not enough free host memory to admit another session.
    #[error(
        "Not enough free RAM: {free_mb} MB free, {min_reserved_mb} MB reserved, \
         {in_flight} start(s) in flight, {per_instance_budget_mb} MB needed"
    )]
    CapacityExceeded {
        free_mb: u64,
        min_reserved_mb: u64,
        per_instance_budget_mb: u64,
        in_flight: u64,
    },

    #[error("launcher did not finish within {0} s")]
    LauncherTimeout(u64),

    /// The launcher exited non-zero (or could not be spawned). Carries its
    /// diagnostic output.
    #[error("Failed to start Jupyter: {0}")]
    LauncherFailure(String),

    #[error("launcher output unusable: {0}")]
    LauncherOutputMalformed(String),

    #[error("Instance not found: port {0}")]
    NotFound(u16),

    #[error("port {0} already has a tracked instance")]
    PortInUse(u16),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The registry file exists but cannot be parsed. Never treated as empty.
    #[error("registry {path} is corrupt: {source}")]
    CorruptState {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("password hashing failed: {0}")]
    Hash(String),
}

impl KeeperError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
