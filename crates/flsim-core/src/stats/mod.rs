use std::{
    collections::BTreeMap,
    fs,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::Serialize;

use flsim_model::RunnerTask;

use crate::error::{SimError, SimResult};

/// Counters for one client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    pub workers_spawned: u64,
    pub task_rounds: u64,
    pub end_run_rounds: u64,
    pub failed_rounds: u64,
    pub busy_ms: u64,
}

#[derive(Debug, Default, Serialize)]
struct StatsInner {
    server_connections: u64,
    clients: BTreeMap<String, ClientStats>,
}

/// Run-wide performance counters, dumped as JSON when the server shuts down.
#[derive(Clone, Default)]
pub struct StatsPool {
    inner: Arc<Mutex<StatsInner>>,
}

impl StatsPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StatsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn worker_spawned(&self, client: &str) {
        self.lock()
            .clients
            .entry(client.to_string())
            .or_default()
            .workers_spawned += 1;
    }

    pub fn round_completed(&self, client: &str, task: RunnerTask, elapsed: Duration) {
        let mut inner = self.lock();
        let entry = inner.clients.entry(client.to_string()).or_default();
        match task {
            RunnerTask::TaskExec => entry.task_rounds += 1,
            RunnerTask::EndRun => entry.end_run_rounds += 1,
        }
        entry.busy_ms += elapsed.as_millis() as u64;
    }

    pub fn round_failed(&self, client: &str) {
        self.lock()
            .clients
            .entry(client.to_string())
            .or_default()
            .failed_rounds += 1;
    }

    pub fn connection_accepted(&self) {
        self.lock().server_connections += 1;
    }

    pub fn client(&self, client: &str) -> Option<ClientStats> {
        self.lock().clients.get(client).cloned()
    }

    pub fn server_connections(&self) -> u64 {
        self.lock().server_connections
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&*self.lock()).unwrap_or(serde_json::Value::Null)
    }

    /// Write the pool as pretty JSON, creating parent folders as needed.
    pub fn dump(&self, path: &Path) -> SimResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SimError::io(parent, e))?;
        }
        let raw = serde_json::to_string_pretty(&self.to_json()).map_err(|e| SimError::json(path, e))?;
        fs::write(path, raw).map_err(|e| SimError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_client() {
        let stats = StatsPool::new();
        stats.worker_spawned("site-1");
        stats.worker_spawned("site-1");
        stats.round_completed("site-1", RunnerTask::TaskExec, Duration::from_millis(5));
        stats.round_completed("site-1", RunnerTask::EndRun, Duration::from_millis(5));
        stats.round_failed("site-2");

        let s1 = stats.client("site-1").unwrap();
        assert_eq!(s1.workers_spawned, 2);
        assert_eq!(s1.task_rounds, 1);
        assert_eq!(s1.end_run_rounds, 1);
        assert_eq!(s1.busy_ms, 10);
        assert_eq!(stats.client("site-2").unwrap().failed_rounds, 1);
    }

    #[test]
    fn dump_creates_parent_folders() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server/pool_stats/simulator_cell_stats.json");

        let stats = StatsPool::new();
        stats.connection_accepted();
        stats.dump(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["server_connections"], 1);
    }
}
