use std::time::Duration;

use thiserror::Error;

use flsim_core::{LaunchError, SimError};

pub type ExecResult<T> = Result<T, ExecError>;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("non-zero exit code: {code}")]
    NonZeroExit { code: i32 },
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("killed by signal")]
    KilledBySignal,
    #[error("parent process {0} is gone")]
    ParentGone(u32),
    #[error("protocol violation: expected {expected}, got {got}")]
    Protocol { expected: &'static str, got: String },
    #[error("connection: {0}")]
    Conn(#[from] ConnError),
    #[error("simulator: {0}")]
    Sim(#[from] SimError),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::Io(e.to_string())
    }
}

/// Failures of a [`crate::WorkerConnection`].
#[derive(Error, Debug)]
pub enum ConnError {
    #[error("could not connect to {target} within {timeout:?}")]
    ConnectionTimeout { target: String, timeout: Duration },
    #[error("peer rejected the authentication token")]
    AuthRejected,
    #[error("connection closed")]
    Closed,
    #[error("codec: {0}")]
    Codec(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ConnError {
    fn from(e: serde_json::Error) -> Self {
        ConnError::Codec(e.to_string())
    }
}

impl From<ConnError> for LaunchError {
    fn from(e: ConnError) -> Self {
        LaunchError::Connection(e.to_string())
    }
}
