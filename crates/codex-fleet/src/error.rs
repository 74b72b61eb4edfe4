//! Engine and orchestrator error types.

use thiserror::Error;

/// Failure delivered through a command's completion channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("not connected")]
    NotConnected,

    #[error("{0}")]
    Rejected(String),

    #[error("remote command exited with {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    #[error("request cancelled by reconnect or disconnect")]
    Cancelled,

    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
