//! Error types for qvm.
//!
//! Probes never produce these: a missing ARP entry or an unanswered port is
//! "absence", not an error. `QvmError` is reserved for configuration
//! mistakes, missing VMs, refused destructive operations, exhausted waits and
//! failed external commands.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for qvm operations.
pub type Result<T> = std::result::Result<T, QvmError>;

#[derive(Error, Debug)]
pub enum QvmError {
    // Configuration errors: raised before any side effect.
    #[error("invalid VM name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("SSH public key not found at {path:?} (set ssh_key or QVM_SSH_KEY)")]
    MissingSshKey { path: PathBuf },

    #[error("unknown architecture: {arch} (expected x86_64, arm64 or i386)")]
    UnknownArchitecture { arch: String },

    #[error("invalid configuration value for {key}: {reason}")]
    InvalidConfig { key: String, reason: String },

    // Resource errors
    #[error("VM not found: {name}")]
    VmNotFound { name: String },

    #[error("VM already exists: {name}")]
    VmAlreadyExists { name: String },

    #[error("VM {name} is running; refusing to {operation} without --force")]
    VmRunning { name: String, operation: String },

    #[error("VM {name} is not running")]
    VmNotRunning { name: String },

    #[error("base image not found: {path:?}")]
    BaseImageMissing { path: PathBuf },

    // Bounded waits
    #[error("{what} within {bound}")]
    Timeout { what: String, bound: String },

    // External collaborators
    #[error("`{program}` failed: {detail}")]
    Command { program: String, detail: String },

    #[error("remote step `{step}` failed: {detail}")]
    Remote { step: String, detail: String },

    #[error("QMP: {0}")]
    Qmp(String),

    #[error("registry {path:?}: {reason}")]
    Registry { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl QvmError {
    pub(crate) fn command(program: &str, detail: impl Into<String>) -> Self {
        QvmError::Command {
            program: program.to_string(),
            detail: detail.into(),
        }
    }

    pub(crate) fn remote(step: &str, detail: impl Into<String>) -> Self {
        QvmError::Remote {
            step: step.to_string(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_the_bound() {
        let err = QvmError::Timeout {
            what: "VM alpha did not reach running state".to_string(),
            bound: "5 minutes".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "VM alpha did not reach running state within 5 minutes"
        );
    }
}
