use std::{
    sync::{Arc, Mutex, PoisonError},
    time::SystemTime,
};

use tracing::info;

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub at: SystemTime,
    pub site: String,
    pub action: String,
}

/// Records run lifecycle events.
///
/// Constructed by the supervisor and passed explicitly; there is no global auditor.
#[derive(Clone, Default)]
pub struct Auditor {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl Auditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, site: &str, action: &str) {
        info!(target: "flsim.audit", site, action, "audit");
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(AuditEvent {
                at: SystemTime::now(),
                site: site.to_string(),
                action: action.to_string(),
            });
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_event_log() {
        let auditor = Auditor::new();
        let other = auditor.clone();
        other.record("server", "run_started");

        let events = auditor.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "run_started");
    }
}
