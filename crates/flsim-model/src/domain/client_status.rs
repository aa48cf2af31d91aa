use serde::{Deserialize, Serialize};

/// Lifecycle state of a simulated client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientStatus {
    /// Client identity exists but has not been handed to a scheduler.
    #[default]
    Created,
    /// Client is registered with the simulated server and can run tasks.
    Started,
    /// Client was torn down at the end of the run.
    Stopped,
}

impl ClientStatus {
    /// Returns `true` if the client may still be scheduled.
    pub fn is_active(&self) -> bool {
        matches!(self, ClientStatus::Started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_started_is_active() {
        assert!(ClientStatus::Started.is_active());
        assert!(!ClientStatus::Created.is_active());
        assert!(!ClientStatus::Stopped.is_active());
    }

    #[test]
    fn serde_uses_camel_case() {
        let json = serde_json::to_string(&ClientStatus::Stopped).unwrap();
        assert_eq!(json, r#""stopped""#);
    }
}
