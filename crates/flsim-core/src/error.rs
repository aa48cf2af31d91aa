use thiserror::Error;

use crate::runner::LaunchError;

pub type SimResult<T> = Result<T, SimError>;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid job definition: {0}")]
    InvalidJobDefinition(String),

    #[error("could not start the server app: {0}")]
    ServerStartupFailure(String),

    #[error("worker failure: {0}")]
    Launch(#[from] LaunchError),

    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("logger: {0}")]
    Logger(#[from] flsim_observe::LoggerError),
}

impl SimError {
    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        SimError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub(crate) fn json(path: impl AsRef<std::path::Path>, source: serde_json::Error) -> Self {
        SimError::Json {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Returns `true` for errors raised before any process is spawned.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            SimError::Configuration(_) | SimError::InvalidJobDefinition(_)
        )
    }
}
