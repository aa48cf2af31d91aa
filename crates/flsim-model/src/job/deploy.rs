use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::KeyValue;

/// Deployment arguments shared by every client of a run.
///
/// Each worker receives a copy rebased onto its own workspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployArgs {
    /// Simulator root, or the client workspace once rebased.
    pub workspace: PathBuf,
    pub job_id: String,
    pub config_folder: String,
    /// Client job config, relative to the app root.
    pub client_config: PathBuf,
    /// Environment config, relative to the app root.
    pub env: PathBuf,
    /// `host:port` of the simulated server root listener.
    pub sp_target: String,
    pub sp_scheme: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set: Vec<KeyValue>,
}

impl DeployArgs {
    /// Copy of these arguments with the workspace moved to `<workspace>/<client>`.
    pub fn rebased(&self, client: &str) -> DeployArgs {
        let mut out = self.clone();
        out.workspace = self.workspace.join(client);
        out
    }
}
