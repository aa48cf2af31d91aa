//! Process-backed [`WorkerLauncher`]: one OS process per task round.

use std::{
    collections::HashMap,
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, trace, warn};

use flsim_core::{Client, LaunchError, LaunchRequest, WorkerLauncher, WorkerLink};
use flsim_model::{CUSTOM_PATH_VAR, RunnerTask, WorkerMessage};

use crate::{
    conn::WorkerConnection,
    error::ConnError,
    limits::{SpawnLimits, attach_limits},
    util::{kill_group, open_port},
};

/// Subcommand of the simulator binary that runs a client worker.
pub const WORKER_SUBCOMMAND: &str = "worker";

/// Time a worker gets to exit after its connection is closed.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Typed command line of a worker process.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    pub workspace: PathBuf,
    pub logging_config: PathBuf,
    pub client: String,
    pub token: String,
    pub port: u16,
    pub parent_pid: u32,
    pub simulator_root: PathBuf,
    pub root_url: String,
    pub parent_url: String,
    pub task: RunnerTask,
    pub gpu: Option<String>,
}

impl WorkerCommand {
    /// Arguments following the program name.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            WORKER_SUBCOMMAND.into(),
            "-o".into(),
            self.workspace.clone().into(),
            "--logging-config".into(),
            self.logging_config.clone().into(),
            "--client".into(),
            self.client.clone().into(),
            "--token".into(),
            self.token.clone().into(),
            "--port".into(),
            self.port.to_string().into(),
            "--parent-pid".into(),
            self.parent_pid.to_string().into(),
            "--simulator-root".into(),
            self.simulator_root.clone().into(),
            "--root-url".into(),
            self.root_url.clone().into(),
            "--parent-url".into(),
            self.parent_url.clone().into(),
            "--task-name".into(),
            self.task.as_str().into(),
        ];
        if let Some(gpu) = &self.gpu {
            args.push("--gpu".into());
            args.push(gpu.into());
        }
        args
    }
}

/// Environment additions for a worker process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerEnv {
    pub vars: Vec<(String, OsString)>,
}

impl WorkerEnv {
    /// Put `client_custom` first on the custom search path and drop `server_custom` from it.
    pub fn for_client(
        inherited: Option<OsString>,
        client_custom: &Path,
        server_custom: &Path,
        gpu: Option<&str>,
    ) -> Self {
        let mut paths = vec![client_custom.to_path_buf()];
        if let Some(current) = inherited {
            paths.extend(
                std::env::split_paths(&current)
                    .filter(|p| p != server_custom && p != client_custom && !p.as_os_str().is_empty()),
            );
        }
        let mut vars = Vec::new();
        match std::env::join_paths(&paths) {
            Ok(joined) => vars.push((CUSTOM_PATH_VAR.to_string(), joined)),
            Err(e) => warn!(target: "flsim.exec.proc", error = %e, "custom search path not set"),
        }
        if let Some(gpu) = gpu {
            vars.push(("CUDA_VISIBLE_DEVICES".to_string(), gpu.into()));
        }
        Self { vars }
    }
}

type LivePids = Arc<Mutex<HashMap<String, u32>>>;

/// Spawns `<program> worker ...` for every task round.
pub struct ProcessLauncher {
    program: PathBuf,
    limits: SpawnLimits,
    live: LivePids,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            limits: SpawnLimits::detached(),
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn live(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, req: LaunchRequest) -> Result<Box<dyn WorkerLink>, LaunchError> {
        let name = req.client.name.clone();
        let spawn_err = |reason: String| LaunchError::Spawn {
            client: name.clone(),
            reason,
        };

        let port = open_port().map_err(|e| spawn_err(format!("reserve port: {e}")))?;
        let command = WorkerCommand {
            workspace: req.paths.workspace.clone(),
            logging_config: req.paths.logging_config.clone(),
            client: name.clone(),
            token: req.client.token.clone(),
            port,
            parent_pid: std::process::id(),
            simulator_root: req.env.simulator_root.clone(),
            root_url: req.client.endpoint.root_url.clone(),
            parent_url: req.client.endpoint.parent_url.clone(),
            task: req.task,
            gpu: req.gpu.clone(),
        };
        let env = WorkerEnv::for_client(
            std::env::var_os(CUSTOM_PATH_VAR),
            &req.paths.custom_dir,
            &req.env.server_custom_dir,
            req.gpu.as_deref(),
        );

        let mut cmd = Command::new(&self.program);
        cmd.args(command.to_args())
            .envs(env.vars.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        attach_limits(&mut cmd, &self.limits);

        trace!(target: "flsim.exec.proc", client = %name, port, task = %req.task, "spawn worker");
        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_err(format!("{}: {e}", self.program.display())))?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_err("worker exited before it was tracked".into()))?;
        self.live().insert(name.clone(), pid);
        info!(target: "flsim.exec.proc", client = %name, pid, port, task = %req.task, gpu = ?req.gpu, "worker spawned");

        let conn = match WorkerConnection::open(format!("127.0.0.1:{port}"), &req.client.token, req.timeout).await {
            Ok(conn) => conn,
            Err(e) => {
                terminate(&mut child, pid).await;
                self.live().remove(&name);
                return Err(match e {
                    ConnError::ConnectionTimeout { timeout, .. } => {
                        LaunchError::WorkerStartupTimeout {
                            client: name,
                            timeout,
                        }
                    }
                    other => other.into(),
                });
            }
        };

        Ok(Box::new(ProcessWorker {
            client: name,
            conn,
            child,
            pid,
            live: Arc::clone(&self.live),
            done: false,
        }))
    }

    async fn release_client(&self, client: &Client) -> Result<(), LaunchError> {
        let Some(pid) = self.live().remove(&client.name) else {
            return Ok(());
        };
        debug!(target: "flsim.exec.proc", client = %client.name, pid, "killing leftover worker");
        kill_group(pid).map_err(|e| LaunchError::Teardown {
            client: client.name.clone(),
            reason: e.to_string(),
        })
    }
}

/// Kill the worker's process group and reap it.
async fn terminate(child: &mut Child, pid: u32) {
    if let Err(e) = kill_group(pid) {
        warn!(target: "flsim.exec.proc", pid, error = %e, "killpg failed");
        let _ = child.start_kill();
    }
    let _ = child.wait().await;
}

/// Link to one running worker process.
pub struct ProcessWorker {
    client: String,
    conn: WorkerConnection,
    child: Child,
    pid: u32,
    live: LivePids,
    done: bool,
}

#[async_trait]
impl WorkerLink for ProcessWorker {
    async fn send(&mut self, msg: WorkerMessage) -> Result<(), LaunchError> {
        self.conn.send(&msg).await.map_err(Into::into)
    }

    async fn recv(&mut self) -> Result<WorkerMessage, LaunchError> {
        self.conn.recv().await.map_err(Into::into)
    }

    async fn shutdown(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.conn.close().await;

        match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(target: "flsim.exec.proc", client = %self.client, pid = self.pid, %status, "worker exited")
            }
            Ok(Err(e)) => {
                warn!(target: "flsim.exec.proc", client = %self.client, error = %e, "wait failed");
                terminate(&mut self.child, self.pid).await;
            }
            Err(_) => {
                warn!(target: "flsim.exec.proc", client = %self.client, pid = self.pid, "worker did not exit; killing");
                terminate(&mut self.child, self.pid).await;
            }
        }
        // Helpers the worker started in its group die with it.
        let _ = kill_group(self.pid);

        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if live.get(&self.client) == Some(&self.pid) {
            live.remove(&self.client);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use flsim_core::{ClientEndpoint, ClientPaths, RoundEnv};

    use super::*;

    fn command() -> WorkerCommand {
        WorkerCommand {
            workspace: "/ws/site-1".into(),
            logging_config: "/ws/site-1/local/log_config.json".into(),
            client: "site-1".into(),
            token: "t".into(),
            port: 4000,
            parent_pid: 42,
            simulator_root: "/ws".into(),
            root_url: "tcp://127.0.0.1:1".into(),
            parent_url: "tcp://127.0.0.1:2".into(),
            task: RunnerTask::EndRun,
            gpu: None,
        }
    }

    fn flag<'a>(args: &'a [OsString], name: &str) -> Option<&'a OsString> {
        args.iter().position(|a| a == name).map(|i| &args[i + 1])
    }

    #[test]
    fn command_line_carries_every_flag() {
        let args = command().to_args();
        assert_eq!(args[0], "worker");
        assert_eq!(flag(&args, "-o").unwrap(), "/ws/site-1");
        assert_eq!(flag(&args, "--port").unwrap(), "4000");
        assert_eq!(flag(&args, "--parent-pid").unwrap(), "42");
        assert_eq!(flag(&args, "--task-name").unwrap(), "END_RUN");
        assert!(flag(&args, "--gpu").is_none());

        let args = WorkerCommand {
            gpu: Some("0,1".into()),
            ..command()
        }
        .to_args();
        assert_eq!(flag(&args, "--gpu").unwrap(), "0,1");
    }

    #[test]
    fn env_hides_server_custom_code() {
        let inherited = std::env::join_paths(["/srv/server/custom", "/opt/lib"]).unwrap();
        let env = WorkerEnv::for_client(
            Some(inherited),
            Path::new("/ws/site-1/custom"),
            Path::new("/srv/server/custom"),
            Some("1"),
        );
        let (key, value) = &env.vars[0];
        assert_eq!(key, CUSTOM_PATH_VAR);
        let paths: Vec<PathBuf> = std::env::split_paths(value).collect();
        assert_eq!(paths, vec![PathBuf::from("/ws/site-1/custom"), PathBuf::from("/opt/lib")]);
        assert_eq!(env.vars[1], ("CUDA_VISIBLE_DEVICES".to_string(), OsString::from("1")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn worker_that_never_connects_times_out_and_is_reaped() {
        let launcher = ProcessLauncher::new("sleep");
        let client = Arc::new(Client::new(
            "site-1",
            "token",
            ClientEndpoint::new("tcp://127.0.0.1:1", "tcp://127.0.0.1:2"),
        ));
        let req = LaunchRequest {
            client: Arc::clone(&client),
            paths: Arc::new(ClientPaths::default()),
            env: Arc::new(RoundEnv::default()),
            task: RunnerTask::TaskExec,
            gpu: None,
            timeout: Duration::from_millis(500),
        };

        let err = match launcher.launch(req).await {
            Ok(_) => panic!("sleep cannot speak the worker protocol"),
            Err(e) => e,
        };
        assert!(matches!(err, LaunchError::WorkerStartupTimeout { .. }));
        assert!(launcher.live().is_empty());
        launcher.release_client(&client).await.unwrap();
    }
}
