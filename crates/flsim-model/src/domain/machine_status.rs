use serde::{Deserialize, Serialize};

/// Engine state of the simulated server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MachineStatus {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
}
