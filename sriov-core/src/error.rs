//! Error types for SR-IOV provisioning.
//!
//! All errors use `thiserror` so callers can match on the failure class and
//! still get a readable chain when the CLI reports them.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for provisioning operations.
pub type Result<T> = std::result::Result<T, SriovError>;

/// Main error type for SR-IOV provisioning.
#[derive(Error, Debug)]
pub enum SriovError {
    /// Reading, writing or verifying `sriov_numvfs` failed. Always fatal.
    #[error("{iface}: unable to configure numvfs: {reason}")]
    NumVfs { iface: String, reason: String },

    /// An external program failed after exhausting its retries.
    #[error("Command `{command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },

    /// A device never reached the expected state within its poll budget.
    #[error("{iface}: timeout waiting for {what}")]
    Timeout { iface: String, what: String },

    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unexpected content in {path:?}: {reason}")]
    SysfsParse { path: PathBuf, reason: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Kernel event monitor failed: {reason}")]
    Monitor { reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SriovError {
    /// Create an I/O error bound to the path that produced it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoError { path: path.into(), source }
    }

    /// True when the error came from an external command.
    ///
    /// Only call sites allowed to downgrade a failure look at this.
    pub fn is_command_failure(&self) -> bool {
        matches!(self, Self::CommandFailed { .. })
    }
}
