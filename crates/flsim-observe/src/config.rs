use std::{fs, io::IsTerminal, path::Path};

use serde::{Deserialize, Serialize};

use crate::{error::LoggerError, format::LoggerFormat};

/// Logger settings.
///
/// The simulator writes this structure as `local/log_config.json` into every
/// participant workspace so that worker processes log the same way as the
/// supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub format: LoggerFormat,
    pub level: String,
    pub with_targets: bool,
    pub use_color: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        let use_color = cfg!(test) || std::io::stderr().is_terminal();
        Self {
            format: LoggerFormat::Text,
            level: "info".to_string(),
            with_targets: true,
            use_color,
        }
    }
}

impl LoggerConfig {
    pub fn load(path: &Path) -> Result<Self, LoggerError> {
        let raw = fs::read_to_string(path).map_err(|e| config_error(path, e))?;
        serde_json::from_str(&raw).map_err(|e| config_error(path, e))
    }

    pub fn save(&self, path: &Path) -> Result<(), LoggerError> {
        let raw = serde_json::to_string_pretty(self).map_err(|e| config_error(path, e))?;
        fs::write(path, raw).map_err(|e| config_error(path, e))
    }
}

fn config_error(path: &Path, e: impl std::fmt::Display) -> LoggerError {
    LoggerError::ConfigFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_keeps_level_and_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log_config.json");

        let cfg = LoggerConfig {
            format: LoggerFormat::Json,
            level: "flsim=debug".into(),
            ..Default::default()
        };
        cfg.save(&path).unwrap();

        let back = LoggerConfig::load(&path).unwrap();
        assert_eq!(back.format, LoggerFormat::Json);
        assert_eq!(back.level, "flsim=debug");
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log_config.json");
        std::fs::write(&path, r#"{"level":"warn"}"#).unwrap();

        let cfg = LoggerConfig::load(&path).unwrap();
        assert_eq!(cfg.level, "warn");
        assert_eq!(cfg.format, LoggerFormat::Text);
        assert!(cfg.with_targets);
    }

    #[test]
    fn load_missing_file_reports_path() {
        let err = LoggerConfig::load(Path::new("/nonexistent/log_config.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/log_config.json"));
    }
}
