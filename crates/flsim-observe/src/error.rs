use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("unknown log format {0:?} (text, json or journald)")]
    InvalidFormat(String),
    #[error("journald output needs Linux and the `journald` feature")]
    JournaldUnavailable,
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
    #[error("logger setup failed: {0}")]
    Init(String),
    #[error("bad log filter {filter:?}: {reason}")]
    InvalidFilter { filter: String, reason: String },
    #[error("logger config {path}: {reason}")]
    ConfigFile { path: String, reason: String },
}
