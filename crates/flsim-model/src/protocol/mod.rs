//! Messages exchanged between a scheduler worker and a spawned worker process.
//!
//! Every frame on a worker connection carries exactly one [`WorkerMessage`].
//! The exchange after authentication is:
//!
//! 1. parent -> worker: `Startup`
//! 2. worker -> parent: `Status { stop }`
//! 3. worker -> parent: `EndRunClient { name }` (only when `stop`)
//! 4. parent -> worker: `Continue { proceed }`; on `false` both sides leave the loop,
//!    otherwise go back to 2.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{BuildContext, DeployArgs, SiteName};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    Hello { token: String },
    Welcome,
    Startup(StartupPayload),
    Status { stop: bool },
    EndRunClient { name: Option<SiteName> },
    Continue { proceed: bool },
}

impl WorkerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Hello { .. } => "hello",
            WorkerMessage::Welcome => "welcome",
            WorkerMessage::Startup(_) => "startup",
            WorkerMessage::Status { .. } => "status",
            WorkerMessage::EndRunClient { .. } => "endRunClient",
            WorkerMessage::Continue { .. } => "continue",
        }
    }
}

/// First payload a worker receives after the connection is authenticated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupPayload {
    pub client_config: Value,
    pub deploy_args: DeployArgs,
    pub build_ctx: BuildContext,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_encoding() {
        let json = serde_json::to_string(&WorkerMessage::Status { stop: true }).unwrap();
        assert_eq!(json, r#"{"type":"status","stop":true}"#);

        let msg: WorkerMessage =
            serde_json::from_str(r#"{"type":"endRunClient","name":null}"#).unwrap();
        assert_eq!(msg, WorkerMessage::EndRunClient { name: None });
        assert_eq!(msg.kind(), "endRunClient");
    }
}
