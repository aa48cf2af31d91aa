//! Run supervisor: workspace, job validation, server start and client scheduling.

use std::{path::PathBuf, sync::Arc, time::Duration};

use serde_json::Value;
use tokio::{sync::watch, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use flsim_model::{
    BuildContext, DEFAULT_MAX_CLIENTS, DEFAULT_WORKER_TIMEOUT_SECS, DeployArgs, KeyValue,
    MachineStatus, SERVER_SITE, SiteName, WORKER_TIMEOUT_VAR,
};
use flsim_observe::LoggerConfig;

use crate::{
    RunServices,
    deployer::SimulatorDeployer,
    error::{SimError, SimResult},
    gpu::{Budget, GpuProbe, NvidiaSmi, resolve_budget, split_clients},
    job::JobPackage,
    runner::{RoundEnv, WorkerLauncher},
    scheduler::{ClientScheduler, POLL_INTERVAL, SchedulerReport},
    server::{LocalServer, ServerApp, ServerContext},
    workspace::{SiteLayout, cleanup_workspace},
};

/// Run status codes reported by the supervisor process.
pub mod status {
    pub const OK: i32 = 0;
    pub const SETUP_FAILURE: i32 = 1;
    pub const RUN_FAILURE: i32 = 2;
    /// External interruption (Ctrl-C) of the caller.
    pub const INTERRUPTED: i32 = -9;
}

/// User-facing simulator options.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub job_folder: PathBuf,
    pub workspace: PathBuf,
    /// Explicit client names; wins over `n_clients`.
    pub clients: Option<Vec<SiteName>>,
    pub n_clients: Option<usize>,
    pub threads: Option<usize>,
    pub gpu: Option<String>,
    /// Logger config file copied into every site; `logger` is used when absent.
    pub log_config: Option<PathBuf>,
    pub max_clients: usize,
    pub end_run_for_all: bool,
    pub set: Vec<KeyValue>,
    pub logger: LoggerConfig,
}

impl SimulatorConfig {
    pub fn new(job_folder: impl Into<PathBuf>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            job_folder: job_folder.into(),
            workspace: workspace.into(),
            clients: None,
            n_clients: None,
            threads: None,
            gpu: None,
            log_config: None,
            max_clients: DEFAULT_MAX_CLIENTS,
            end_run_for_all: false,
            set: Vec::new(),
            logger: LoggerConfig::default(),
        }
    }

    /// Worker connection timeout, overridable with `--set simulator_worker_timeout=<secs>`.
    pub fn worker_timeout(&self) -> SimResult<Duration> {
        let Some(raw) = KeyValue::lookup(&self.set, WORKER_TIMEOUT_VAR) else {
            return Ok(Duration::from_secs_f64(DEFAULT_WORKER_TIMEOUT_SECS));
        };
        match raw.trim().parse::<f64>() {
            Ok(secs) if secs.is_finite() && secs > 0.0 => Ok(Duration::from_secs_f64(secs)),
            _ => Err(SimError::Configuration(format!(
                "{WORKER_TIMEOUT_VAR} must be a positive number of seconds, got {raw:?}"
            ))),
        }
    }

    /// Client names for this run.
    ///
    /// Order of precedence: explicit names, `n_clients` generated names,
    /// names from the deploy map, two generated names.
    pub fn resolve_clients(&self, job: &JobPackage) -> SimResult<Vec<SiteName>> {
        let names: Vec<SiteName> = match (&self.clients, self.n_clients) {
            (Some(list), _) if !list.is_empty() => {
                let mut names: Vec<SiteName> = Vec::with_capacity(list.len());
                for raw in list {
                    let name = raw.trim();
                    if name.is_empty() || name == SERVER_SITE {
                        return Err(SimError::Configuration(format!(
                            "invalid client name {raw:?}"
                        )));
                    }
                    if names.iter().any(|n| n == name) {
                        return Err(SimError::Configuration(format!(
                            "duplicate client name {name:?}"
                        )));
                    }
                    names.push(name.to_string());
                }
                names
            }
            (_, Some(0)) => {
                return Err(SimError::Configuration(
                    "the number of clients must be at least 1".into(),
                ));
            }
            (_, Some(n)) => generated_names(n),
            _ => {
                let from_job = job.client_names();
                if from_job.is_empty() {
                    generated_names(2)
                } else {
                    from_job
                }
            }
        };

        if names.len() > self.max_clients {
            return Err(SimError::Configuration(format!(
                "the number of clients ({}) exceeds the maximum of {}",
                names.len(),
                self.max_clients
            )));
        }
        Ok(names)
    }
}

fn generated_names(n: usize) -> Vec<SiteName> {
    (1..=n).map(|i| format!("site-{i}")).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    WorkspaceReady,
    JobValidated,
    ServerStarting,
    ServerStarted,
    ClientsRunning,
    Done,
    Failed,
}

/// Resolved configuration of a run; read-only once clients start.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub clients: Vec<SiteName>,
    pub budget: Budget,
    pub layout: SiteLayout,
    pub deploy_args: DeployArgs,
    pub client_config: Value,
    pub build_ctx: BuildContext,
    pub timeout: Duration,
    pub end_run_for_all: bool,
}

/// Output of the synchronous setup phase.
struct Prepared {
    job: JobPackage,
    clients: Vec<SiteName>,
    budget: Budget,
    timeout: Duration,
    logger: LoggerConfig,
}

pub struct RunSupervisor {
    config: SimulatorConfig,
    launcher: Arc<dyn WorkerLauncher>,
    probe: Arc<dyn GpuProbe>,
    server: Option<Arc<dyn ServerApp>>,
    services: RunServices,
    poll_interval: Duration,
    state: RunState,
}

impl RunSupervisor {
    pub fn new(config: SimulatorConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            config,
            launcher,
            probe: Arc::new(NvidiaSmi),
            server: None,
            services: RunServices::default(),
            poll_interval: POLL_INTERVAL,
            state: RunState::Init,
        }
    }

    pub fn with_gpu_probe(mut self, probe: Arc<dyn GpuProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Use `server` instead of binding a [`LocalServer`].
    pub fn with_server(mut self, server: Arc<dyn ServerApp>) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_services(mut self, services: RunServices) -> Self {
        self.services = services;
        self
    }

    /// Poll cadence of the server readiness wait and of scheduler workers.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn services(&self) -> &RunServices {
        &self.services
    }

    fn transition(&mut self, next: RunState) {
        debug!(target: "flsim.core.supervisor", from = ?self.state, to = ?next, "state transition");
        self.state = next;
    }

    /// Run the whole simulation and return its status code.
    pub async fn run(&mut self) -> i32 {
        self.services.auditor.record(SERVER_SITE, "run_started");

        let prepared = match self.prepare() {
            Ok(p) => p,
            Err(e) => {
                error!(target: "flsim.core.supervisor", error = %e, "simulator setup failed");
                self.transition(RunState::Failed);
                return status::SETUP_FAILURE;
            }
        };

        let code = match self.simulate(prepared).await {
            Ok(true) => {
                self.transition(RunState::Done);
                status::OK
            }
            Ok(false) => {
                self.transition(RunState::Failed);
                status::RUN_FAILURE
            }
            Err(e) => {
                error!(target: "flsim.core.supervisor", error = %e, "simulator run failed");
                self.transition(RunState::Failed);
                if e.is_setup_error() {
                    status::SETUP_FAILURE
                } else {
                    status::RUN_FAILURE
                }
            }
        };

        self.services.auditor.record(SERVER_SITE, "run_finished");
        info!(target: "flsim.core.supervisor", status = code, "simulator run finished");
        code
    }

    /// Everything that must succeed before any process is spawned.
    fn prepare(&mut self) -> SimResult<Prepared> {
        let layout = SiteLayout::new(&self.config.workspace);
        cleanup_workspace(layout.root())?;
        self.transition(RunState::WorkspaceReady);

        let job = JobPackage::load(&self.config.job_folder)?;
        let clients = self.config.resolve_clients(&job)?;
        job.validate_client_names(&clients)?;
        self.transition(RunState::JobValidated);

        let host_gpus = if self.config.gpu.is_some() {
            self.probe.gpu_ids()
        } else {
            Vec::new()
        };
        let budget = resolve_budget(
            self.config.threads,
            self.config.gpu.as_deref(),
            clients.len(),
            &host_gpus,
        )?;
        let timeout = self.config.worker_timeout()?;
        let logger = match &self.config.log_config {
            Some(path) => LoggerConfig::load(path)?,
            None => self.config.logger.clone(),
        };

        info!(
            target: "flsim.core.supervisor",
            clients = clients.len(),
            threads = budget.threads,
            gpu_groups = budget.partitions(),
            "simulator setup complete"
        );
        Ok(Prepared {
            job,
            clients,
            budget,
            timeout,
            logger,
        })
    }

    /// Returns `Ok(false)` when some client worker failed.
    #[instrument(level = "debug", skip_all, fields(clients = prepared.clients.len()))]
    async fn simulate(&mut self, prepared: Prepared) -> SimResult<bool> {
        self.transition(RunState::ServerStarting);
        let layout = SiteLayout::new(&self.config.workspace);
        layout.prepare_site(SERVER_SITE, &prepared.logger)?;
        for client in &prepared.clients {
            layout.prepare_site(client, &prepared.logger)?;
        }
        prepared.job.deploy(&layout, &prepared.clients)?;

        let server: Arc<dyn ServerApp> = match &self.server {
            Some(server) => Arc::clone(server),
            None => Arc::new(LocalServer::bind().await?),
        };
        let (status_tx, mut status_rx) = watch::channel(MachineStatus::Stopped);
        let abort = CancellationToken::new();
        let server_task = {
            let server = Arc::clone(&server);
            let ctx = ServerContext {
                status: status_tx,
                abort: abort.clone(),
                layout: layout.clone(),
                services: self.services.clone(),
            };
            tokio::spawn(async move { server.serve(ctx).await })
        };

        loop {
            if *status_rx.borrow() == MachineStatus::Started {
                break;
            }
            if server_task.is_finished() {
                return Err(self.server_failure(server_task).await);
            }
            match tokio::time::timeout(self.poll_interval, status_rx.changed()).await {
                Ok(Ok(())) | Err(_) => {}
                Ok(Err(_)) if *status_rx.borrow() != MachineStatus::Started => {
                    return Err(self.server_failure(server_task).await);
                }
                Ok(Err(_)) => {}
            }
        }
        self.transition(RunState::ServerStarted);

        let deployer = SimulatorDeployer::new(layout.clone());
        let ctx = RunContext {
            clients: prepared.clients,
            budget: prepared.budget,
            layout: layout.clone(),
            deploy_args: deployer.deploy_args(server.root_url(), &self.config.set),
            client_config: deployer.client_config(server.root_url()),
            build_ctx: deployer.build_ctx(server.root_url()),
            timeout: prepared.timeout,
            end_run_for_all: self.config.end_run_for_all,
        };

        self.transition(RunState::ClientsRunning);
        self.services.auditor.record(SERVER_SITE, "clients_running");
        let reports = self
            .run_partitions(&ctx, &deployer, server.as_ref())
            .await;

        abort.cancel();
        match server_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(target: "flsim.core.supervisor", error = %e, "server stopped with error"),
            Err(e) => warn!(target: "flsim.core.supervisor", error = %e, "server task aborted"),
        }

        let failed: usize = reports.iter().map(|r| r.failed_workers).sum();
        if failed > 0 {
            warn!(target: "flsim.core.supervisor", failed_workers = failed, "some client workers failed");
        }
        Ok(failed == 0 && reports.len() == ctx.budget.partitions())
    }

    async fn server_failure(
        &self,
        server_task: tokio::task::JoinHandle<SimResult<()>>,
    ) -> SimError {
        let reason = match server_task.await {
            Ok(Ok(())) => "server exited before it started".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };
        SimError::ServerStartupFailure(reason)
    }

    /// One scheduler per GPU partition, all running concurrently.
    async fn run_partitions(
        &self,
        ctx: &RunContext,
        deployer: &SimulatorDeployer,
        server: &dyn ServerApp,
    ) -> Vec<SchedulerReport> {
        let env = RoundEnv {
            simulator_root: ctx.layout.root().to_path_buf(),
            server_custom_dir: ctx.layout.custom_dir(SERVER_SITE),
        };
        let slots = deployer.create_clients(
            &ctx.clients,
            server.root_url(),
            server.internal_listener_url(),
        );
        let gpus: Vec<Option<String>> = match &ctx.budget.gpu_groups {
            Some(groups) => groups.iter().cloned().map(Some).collect(),
            None => vec![None],
        };
        let partitions = split_clients(slots, gpus.len());

        let mut running = JoinSet::new();
        for (clients, gpu) in partitions.into_iter().zip(gpus) {
            let scheduler = ClientScheduler::new(Arc::clone(&self.launcher), self.services.clone())
                .with_env(env.clone())
                .with_client_config(ctx.client_config.clone())
                .with_deploy_args(ctx.deploy_args.clone())
                .with_build_ctx(ctx.build_ctx.clone())
                .with_poll_interval(self.poll_interval);
            let threads = ctx.budget.threads;
            let end_run_for_all = ctx.end_run_for_all;
            let timeout = ctx.timeout;
            running.spawn(async move {
                scheduler
                    .run(clients, threads, gpu, end_run_for_all, timeout)
                    .await
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(target: "flsim.core.supervisor", error = %e, "client scheduler aborted"),
            }
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        path::Path,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use flsim_model::{RunnerTask, WorkerMessage};

    use super::*;
    use crate::{
        gpu::FixedGpus,
        runner::{LaunchError, LaunchRequest, WorkerLink},
    };

    /// Every round finishes its client at once and reports it as ended.
    #[derive(Default)]
    struct OneShotLauncher {
        launches: AtomicUsize,
    }

    struct OneShotLink {
        name: String,
        sent_status: bool,
    }

    #[async_trait]
    impl WorkerLauncher for OneShotLauncher {
        fn name(&self) -> &'static str {
            "one-shot"
        }

        async fn launch(&self, req: LaunchRequest) -> Result<Box<dyn WorkerLink>, LaunchError> {
            assert_eq!(req.task, RunnerTask::TaskExec);
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(OneShotLink {
                name: req.client.name.clone(),
                sent_status: false,
            }))
        }
    }

    #[async_trait]
    impl WorkerLink for OneShotLink {
        async fn send(&mut self, _msg: WorkerMessage) -> Result<(), LaunchError> {
            Ok(())
        }

        async fn recv(&mut self) -> Result<WorkerMessage, LaunchError> {
            if self.sent_status {
                Ok(WorkerMessage::EndRunClient {
                    name: Some(self.name.clone()),
                })
            } else {
                self.sent_status = true;
                Ok(WorkerMessage::Status { stop: true })
            }
        }

        async fn shutdown(&mut self) {}
    }

    struct BrokenServer;

    #[async_trait]
    impl ServerApp for BrokenServer {
        fn root_url(&self) -> &str {
            "tcp://127.0.0.1:1"
        }

        fn internal_listener_url(&self) -> &str {
            "tcp://127.0.0.1:2"
        }

        async fn serve(&self, _ctx: ServerContext) -> SimResult<()> {
            Err(SimError::ServerStartupFailure("port in use".into()))
        }
    }

    fn job_folder(root: &Path) -> PathBuf {
        let job = root.join("hello");
        fs::create_dir_all(job.join("app/config")).unwrap();
        fs::write(job.join("app/config/config_fed_client.json"), b"{}").unwrap();
        fs::write(job.join("meta.json"), br#"{"name":"hello","deploy_map":{"app":["@ALL"]}}"#).unwrap();
        job
    }

    fn supervisor(config: SimulatorConfig, launcher: Arc<OneShotLauncher>) -> RunSupervisor {
        RunSupervisor::new(config, launcher)
            .with_gpu_probe(Arc::new(FixedGpus(vec!["0".into(), "1".into(), "2".into(), "3".into()])))
            .with_poll_interval(Duration::from_millis(5))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_run_reports_ok_and_leaves_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("ws");
        let mut config = SimulatorConfig::new(job_folder(dir.path()), &ws);
        config.n_clients = Some(4);
        config.threads = Some(2);
        config.end_run_for_all = true;

        let launcher = Arc::new(OneShotLauncher::default());
        let mut sup = supervisor(config, Arc::clone(&launcher));
        assert_eq!(sup.run().await, status::OK);
        assert_eq!(sup.state(), RunState::Done);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 4);

        let layout = SiteLayout::new(&ws);
        assert!(layout.stats_file().is_file());
        for site in ["server", "site-1", "site-4"] {
            assert!(layout.meta_file(site).is_file(), "{site}");
            assert!(layout.logging_config(site).is_file(), "{site}");
        }
        let actions: Vec<String> = sup.services().auditor.events().into_iter().map(|e| e.action).collect();
        assert!(actions.contains(&"clients_running".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn gpu_groups_run_one_partition_each() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SimulatorConfig::new(job_folder(dir.path()), dir.path().join("ws"));
        config.n_clients = Some(3);
        config.gpu = Some("0,1;2".into());

        let launcher = Arc::new(OneShotLauncher::default());
        let mut sup = supervisor(config, Arc::clone(&launcher));
        assert_eq!(sup.run().await, status::OK);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn setup_errors_spawn_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_folder(dir.path());

        let mut bad_gpu = SimulatorConfig::new(&job, dir.path().join("ws1"));
        bad_gpu.gpu = Some("9".into());

        let mut too_many = SimulatorConfig::new(&job, dir.path().join("ws2"));
        too_many.n_clients = Some(5);
        too_many.max_clients = 4;

        let mut bad_timeout = SimulatorConfig::new(&job, dir.path().join("ws3"));
        bad_timeout.set = vec![KeyValue::new(WORKER_TIMEOUT_VAR, "soon")];

        let missing_job = SimulatorConfig::new(dir.path().join("nope"), dir.path().join("ws4"));

        for config in [bad_gpu, too_many, bad_timeout, missing_job] {
            let launcher = Arc::new(OneShotLauncher::default());
            let mut sup = supervisor(config, Arc::clone(&launcher));
            assert_eq!(sup.run().await, status::SETUP_FAILURE);
            assert_eq!(sup.state(), RunState::Failed);
            assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn server_that_dies_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = SimulatorConfig::new(job_folder(dir.path()), dir.path().join("ws"));
        let launcher = Arc::new(OneShotLauncher::default());

        let mut sup = supervisor(config, Arc::clone(&launcher)).with_server(Arc::new(BrokenServer));
        assert_eq!(sup.run().await, status::RUN_FAILURE);
        assert_eq!(sup.state(), RunState::Failed);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn client_names_follow_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let job = JobPackage::load(&job_folder(dir.path())).unwrap();
        let mut config = SimulatorConfig::new(job.folder(), "/ws");

        assert_eq!(config.resolve_clients(&job).unwrap(), vec!["site-1", "site-2"]);

        config.n_clients = Some(3);
        assert_eq!(config.resolve_clients(&job).unwrap().len(), 3);

        config.clients = Some(vec!["a".into(), " b ".into()]);
        assert_eq!(config.resolve_clients(&job).unwrap(), vec!["a", "b"]);

        config.clients = Some(vec!["a".into(), "a".into()]);
        assert!(config.resolve_clients(&job).is_err());

        config.clients = Some(vec!["server".into()]);
        assert!(config.resolve_clients(&job).is_err());
    }

    #[test]
    fn worker_timeout_defaults_and_overrides() {
        let mut config = SimulatorConfig::new("/job", "/ws");
        assert_eq!(config.worker_timeout().unwrap(), Duration::from_secs(60));
        config.set = vec![
            KeyValue::new(WORKER_TIMEOUT_VAR, "10"),
            KeyValue::new(WORKER_TIMEOUT_VAR, "2.5"),
        ];
        assert_eq!(config.worker_timeout().unwrap(), Duration::from_millis(2500));
        config.set = vec![KeyValue::new(WORKER_TIMEOUT_VAR, "-1")];
        assert!(config.worker_timeout().is_err());
    }
}
