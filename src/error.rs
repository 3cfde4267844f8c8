//! Error taxonomy - the kinds from spec section 7, not type names.
//!
//! Internal plumbing still uses `anyhow::Result` with `.context(...)` the
//! way the rest of this crate does; `AgentFsError` is the type library
//! operations resolve to at their public boundary so the CLI can map a
//! failure to the right exit code without re-parsing a message string.

use std::path::PathBuf;

use thiserror::Error;

/// One of the kinds from spec section 7.
#[derive(Debug, Error)]
pub enum AgentFsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("mount or unmount failed: {0}")]
    MountFailure(String),

    #[error("platform operation failed: {0}")]
    PlatformOperationFailure(String),

    #[error("verification failed: {summary}")]
    VerificationFailure {
        summary: String,
        differing_paths: Vec<PathBuf>,
    },

    #[error("recoverable corruption detected: {0}")]
    CorruptionRecoverable(String),

    #[error("unrecoverable corruption: {0}")]
    CorruptionFatal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentFsError {
    /// Exit code per spec section 6.
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentFsError::NotFound(msg) => {
                if msg.starts_with("checkpoint") {
                    4
                } else {
                    3
                }
            }
            AgentFsError::InvalidInput(_) => 2,
            AgentFsError::MountFailure(_) => 5,
            AgentFsError::Busy(_)
            | AgentFsError::PlatformOperationFailure(_)
            | AgentFsError::VerificationFailure { .. }
            | AgentFsError::CorruptionRecoverable(_)
            | AgentFsError::CorruptionFatal(_)
            | AgentFsError::Other(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentFsError>;
