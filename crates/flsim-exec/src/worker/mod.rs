//! Reference client worker: the process side of one task round.
//!
//! The worker listens on the port it was given, authenticates the scheduler,
//! receives the startup payload and then runs the client app's configured
//! command once per round. Progress survives across worker processes in
//! `<client job dir>/progress.json`, so a client that is moved between
//! scheduler workers picks up where it left off.

use std::{
    fs,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, process::Command};
use tracing::{debug, info, instrument, warn};

use flsim_model::{
    CLIENT_JOB_CONFIG, CONFIG_FOLDER, JOB_NAME, RunnerTask, StartupPayload, WorkerMessage,
};

use crate::{
    conn::WorkerConnection,
    error::{ExecError, ExecResult},
    util::process_alive,
};

/// How long the worker waits for the scheduler to connect.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(60);

const PROGRESS_FILE: &str = "progress.json";

/// Parsed worker command line.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub workspace: PathBuf,
    pub logging_config: PathBuf,
    pub client: String,
    pub token: String,
    pub port: u16,
    /// `0` disables the parent liveness check.
    pub parent_pid: u32,
    pub simulator_root: PathBuf,
    pub root_url: String,
    pub parent_url: String,
    pub task: RunnerTask,
    pub gpu: Option<String>,
}

/// Client app settings read from `config/config_fed_client.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientAppConfig {
    /// Program run once per task round; rounds without a command only count.
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Task rounds until the client is done.
    pub rounds: u32,
    /// Program run for END_RUN.
    pub end_run_command: Option<String>,
    pub end_run_args: Vec<String>,
}

impl Default for ClientAppConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            rounds: 1,
            end_run_command: None,
            end_run_args: Vec::new(),
        }
    }
}

impl ClientAppConfig {
    /// Load from `path`; a missing file means the defaults.
    pub fn load(path: &Path) -> ExecResult<Self> {
        match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| ExecError::Io(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Progress {
    round: u32,
    end_run: bool,
}

impl Progress {
    fn load(path: &Path) -> Self {
        fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn save(&self, path: &Path) -> ExecResult<()> {
        let raw = serde_json::to_string(self).map_err(|e| ExecError::Io(e.to_string()))?;
        fs::write(path, raw)?;
        Ok(())
    }
}

/// Serve one task round and exit.
#[instrument(level = "debug", skip_all, fields(client = %args.client, task = %args.task))]
pub async fn run_worker(args: WorkerArgs) -> ExecResult<()> {
    let listener = TcpListener::bind(("127.0.0.1", args.port)).await?;
    let mut conn = WorkerConnection::accept(&listener, &args.token, ACCEPT_TIMEOUT).await?;
    drop(listener);

    let startup = match conn.recv().await? {
        WorkerMessage::Startup(payload) => payload,
        other => {
            return Err(ExecError::Protocol {
                expected: "startup",
                got: other.kind().to_string(),
            });
        }
    };
    let session = Session::new(&args, &startup)?;
    info!(target: "flsim.exec.worker", client = %args.client, task = %args.task, job_dir = %session.job_dir.display(), "worker session started");

    let result = session.serve(&args, &mut conn).await;
    conn.close().await;
    result
}

struct Session {
    job_dir: PathBuf,
    app_root: PathBuf,
    app: ClientAppConfig,
}

impl Session {
    fn new(args: &WorkerArgs, startup: &StartupPayload) -> ExecResult<Self> {
        let job_dir = startup.deploy_args.workspace.join(JOB_NAME);
        let app_root = job_dir.join(format!("app_{}", args.client));
        let config = if startup.deploy_args.client_config.as_os_str().is_empty() {
            app_root.join(CONFIG_FOLDER).join(CLIENT_JOB_CONFIG)
        } else {
            app_root.join(&startup.deploy_args.client_config)
        };
        let app = ClientAppConfig::load(&config)?;
        debug!(target: "flsim.exec.worker", config = %config.display(), rounds = app.rounds, "client app loaded");
        Ok(Self {
            job_dir,
            app_root,
            app,
        })
    }

    async fn serve(&self, args: &WorkerArgs, conn: &mut WorkerConnection) -> ExecResult<()> {
        let progress_file = self.job_dir.join(PROGRESS_FILE);
        loop {
            if args.parent_pid != 0 && !process_alive(args.parent_pid) {
                return Err(ExecError::ParentGone(args.parent_pid));
            }

            let mut progress = Progress::load(&progress_file);
            let stop = match args.task {
                RunnerTask::TaskExec => {
                    if progress.round < self.app.rounds {
                        self.run_round(args, progress.round).await?;
                        progress.round += 1;
                    }
                    let done = progress.round >= self.app.rounds;
                    if done && !progress.end_run {
                        self.run_end_run(args).await?;
                        progress.end_run = true;
                    }
                    done
                }
                RunnerTask::EndRun => {
                    if !progress.end_run {
                        self.run_end_run(args).await?;
                        progress.end_run = true;
                    }
                    true
                }
            };
            progress.save(&progress_file)?;

            conn.send(&WorkerMessage::Status { stop }).await?;
            if stop {
                conn.send(&WorkerMessage::EndRunClient {
                    name: Some(args.client.clone()),
                })
                .await?;
            }

            match conn.recv().await? {
                WorkerMessage::Continue { proceed: true } => continue,
                WorkerMessage::Continue { proceed: false } => return Ok(()),
                other => {
                    return Err(ExecError::Protocol {
                        expected: "continue",
                        got: other.kind().to_string(),
                    });
                }
            }
        }
    }

    async fn run_round(&self, args: &WorkerArgs, round: u32) -> ExecResult<()> {
        let Some(program) = &self.app.command else {
            return Ok(());
        };
        debug!(target: "flsim.exec.worker", client = %args.client, round, "task round");
        self.exec(program, &self.app.args, args, RunnerTask::TaskExec, round)
            .await
    }

    async fn run_end_run(&self, args: &WorkerArgs) -> ExecResult<()> {
        let Some(program) = &self.app.end_run_command else {
            return Ok(());
        };
        debug!(target: "flsim.exec.worker", client = %args.client, "end run");
        self.exec(program, &self.app.end_run_args, args, RunnerTask::EndRun, 0)
            .await
    }

    async fn exec(
        &self,
        program: &str,
        argv: &[String],
        args: &WorkerArgs,
        task: RunnerTask,
        round: u32,
    ) -> ExecResult<()> {
        let mut cmd = Command::new(program);
        cmd.args(argv)
            .current_dir(&self.app_root)
            .env("FLSIM_CLIENT", &args.client)
            .env("FLSIM_ROUND", round.to_string())
            .env("FLSIM_TASK", task.as_str())
            .env("FLSIM_SIMULATOR_ROOT", &args.simulator_root)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(gpu) = &args.gpu {
            cmd.env("FLSIM_GPU", gpu);
        }

        let status = cmd
            .status()
            .await
            .map_err(|e| ExecError::Spawn(format!("{program}: {e}")))?;
        if status.success() {
            return Ok(());
        }
        match status.code() {
            Some(code) => {
                warn!(target: "flsim.exec.worker", client = %args.client, program, code, "client command failed");
                Err(ExecError::NonZeroExit { code })
            }
            None => Err(ExecError::KilledBySignal),
        }
    }
}

#[cfg(test)]
mod tests {
    use flsim_model::{BuildContext, DeployArgs};

    use super::*;
    use crate::util::open_port;

    fn args(ws: &Path, port: u16) -> WorkerArgs {
        WorkerArgs {
            workspace: ws.join("site-1"),
            logging_config: ws.join("site-1/local/log_config.json"),
            client: "site-1".into(),
            token: "secret".into(),
            port,
            parent_pid: 0,
            simulator_root: ws.to_path_buf(),
            root_url: "tcp://127.0.0.1:1".into(),
            parent_url: "tcp://127.0.0.1:2".into(),
            task: RunnerTask::TaskExec,
            gpu: None,
        }
    }

    fn app_config(ws: &Path, json: &str) {
        let dir = ws.join("site-1/simulate_job/app_site-1/config");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config_fed_client.json"), json).unwrap();
    }

    fn startup(ws: &Path) -> WorkerMessage {
        WorkerMessage::Startup(StartupPayload {
            client_config: serde_json::json!({}),
            deploy_args: DeployArgs {
                workspace: ws.join("site-1"),
                client_config: "config/config_fed_client.json".into(),
                ..Default::default()
            },
            build_ctx: BuildContext::new(),
        })
    }

    async fn connect(port: u16) -> WorkerConnection {
        WorkerConnection::open(format!("127.0.0.1:{port}"), "secret", Duration::from_secs(10))
            .await
            .unwrap()
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_rounds_and_reports_end_run() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path();
        app_config(
            ws,
            r#"{"command":"sh","args":["-c","echo $FLSIM_ROUND >> rounds.txt"],"rounds":2}"#,
        );
        let port = open_port().unwrap();
        let worker = tokio::spawn(run_worker(args(ws, port)));

        let mut conn = connect(port).await;
        conn.send(&startup(ws)).await.unwrap();
        assert_eq!(conn.recv().await.unwrap(), WorkerMessage::Status { stop: false });
        conn.send(&WorkerMessage::Continue { proceed: true }).await.unwrap();
        assert_eq!(conn.recv().await.unwrap(), WorkerMessage::Status { stop: true });
        assert_eq!(
            conn.recv().await.unwrap(),
            WorkerMessage::EndRunClient {
                name: Some("site-1".into())
            }
        );
        conn.send(&WorkerMessage::Continue { proceed: false }).await.unwrap();
        worker.await.unwrap().unwrap();

        let app_root = ws.join("site-1/simulate_job/app_site-1");
        assert_eq!(fs::read_to_string(app_root.join("rounds.txt")).unwrap(), "0\n1\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn progress_survives_worker_restart() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path();
        app_config(ws, r#"{"rounds":2}"#);

        for expected_stop in [false, true] {
            let port = open_port().unwrap();
            let worker = tokio::spawn(run_worker(args(ws, port)));
            let mut conn = connect(port).await;
            conn.send(&startup(ws)).await.unwrap();
            assert_eq!(
                conn.recv().await.unwrap(),
                WorkerMessage::Status { stop: expected_stop }
            );
            if expected_stop {
                conn.recv().await.unwrap();
            }
            conn.send(&WorkerMessage::Continue { proceed: false }).await.unwrap();
            worker.await.unwrap().unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unexpected_first_message_is_a_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let port = open_port().unwrap();
        let worker = tokio::spawn(run_worker(args(dir.path(), port)));

        let mut conn = connect(port).await;
        conn.send(&WorkerMessage::Continue { proceed: true }).await.unwrap();
        assert!(matches!(
            worker.await.unwrap(),
            Err(ExecError::Protocol { expected: "startup", .. })
        ));
    }

    #[test]
    fn missing_app_config_means_single_round() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ClientAppConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(cfg, ClientAppConfig::default());
        assert_eq!(cfg.rounds, 1);
    }
}
