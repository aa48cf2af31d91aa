//! Logging setup shared by the simulator's caller, supervisor and worker
//! processes.

mod config;
mod error;
mod format;
mod init;

pub use config::LoggerConfig;
pub use error::LoggerError;
pub use format::LoggerFormat;
pub use init::logger_init;
