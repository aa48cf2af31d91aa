use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use flsim_model::{ClientStatus, SiteName};

/// Where a client reaches the simulated server.
#[derive(Debug, Default)]
pub struct ClientEndpoint {
    pub root_url: String,
    pub parent_url: String,
    closed: AtomicBool,
}

impl ClientEndpoint {
    pub fn new(root_url: impl Into<String>, parent_url: impl Into<String>) -> Self {
        Self {
            root_url: root_url.into(),
            parent_url: parent_url.into(),
            closed: AtomicBool::new(false),
        }
    }

    /// Mark the endpoint closed. Returns `true` only for the first call.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Identity of one simulated client.
#[derive(Debug)]
pub struct Client {
    pub name: SiteName,
    pub token: String,
    pub endpoint: ClientEndpoint,
}

impl Client {
    pub fn new(name: impl Into<SiteName>, token: impl Into<String>, endpoint: ClientEndpoint) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
            endpoint,
        }
    }
}

/// Filesystem locations derived from the client name.
#[derive(Debug, Clone, Default)]
pub struct ClientPaths {
    /// `<simulator_root>/<client>`
    pub workspace: PathBuf,
    /// `<workspace>/simulate_job/app_<client>`
    pub app_root: PathBuf,
    /// `<app_root>/custom`
    pub custom_dir: PathBuf,
    /// `<workspace>/local/log_config.json`
    pub logging_config: PathBuf,
}

/// Scheduling record for one client.
///
/// Only reachable mutably through the scheduler's pool guard, so every
/// flag change happens under the shared lock.
#[derive(Debug)]
pub struct ClientSlot {
    client: Arc<Client>,
    paths: Arc<ClientPaths>,
    simulate_running: bool,
    finished: bool,
    status: ClientStatus,
}

impl ClientSlot {
    pub fn new(client: Client, paths: ClientPaths) -> Self {
        Self {
            client: Arc::new(client),
            paths: Arc::new(paths),
            simulate_running: false,
            finished: false,
            status: ClientStatus::Created,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.client.name
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn paths(&self) -> &Arc<ClientPaths> {
        &self.paths
    }

    pub fn status(&self) -> ClientStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ClientStatus) {
        self.status = status;
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.simulate_running
    }

    /// `true` once a task round reported that this client's work is done.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn mark_finished(&mut self) {
        self.finished = true;
    }

    /// Claim the slot for one worker. Fails if another worker holds it.
    pub fn try_acquire(&mut self) -> bool {
        if self.simulate_running {
            return false;
        }
        self.simulate_running = true;
        true
    }

    pub fn release(&mut self) {
        self.simulate_running = false;
    }

    /// Eligible for a regular task round: started, idle and not finished.
    pub fn is_schedulable(&self) -> bool {
        self.status.is_active() && !self.simulate_running && !self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(name: &str) -> ClientSlot {
        let client = Client::new(name, "token", ClientEndpoint::new("tcp://a", "tcp://b"));
        ClientSlot::new(client, ClientPaths::default())
    }

    #[test]
    fn acquire_is_exclusive_until_release() {
        let mut s = slot("site-1");
        assert!(s.try_acquire());
        assert!(!s.try_acquire());
        s.release();
        assert!(s.try_acquire());
    }

    #[test]
    fn schedulable_requires_started_idle_unfinished() {
        let mut s = slot("site-1");
        assert!(!s.is_schedulable());

        s.set_status(ClientStatus::Started);
        assert!(s.is_schedulable());

        s.try_acquire();
        assert!(!s.is_schedulable());
        s.release();

        s.mark_finished();
        assert!(!s.is_schedulable());
    }

    #[test]
    fn endpoint_close_is_idempotent() {
        let ep = ClientEndpoint::new("tcp://a", "tcp://b");
        assert!(ep.close());
        assert!(!ep.close());
        assert!(ep.is_closed());
    }
}
