//! Work-stealing scheduler that runs a pool of simulated clients on a fixed
//! number of workers.
//!
//! Every worker repeatedly claims an idle client, launches a worker process
//! for it through the [`WorkerLauncher`] and drives the task handshake until
//! the process is told to stop. When the pool has more clients than workers a
//! running worker process is stopped as soon as another client is waiting, so
//! each client gets a fresh process whenever control moves to it.
//!
//! With `end_run_for_all` every worker finishes with the drain protocol: it
//! keeps picking clients that have not run END_RUN yet until the ledger
//! accounts for the whole pool.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use flsim_model::{
    BuildContext, ClientStatus, DeployArgs, RunnerTask, SiteName, StartupPayload, WorkerMessage,
};

use crate::{
    RunServices,
    ledger::EndRunLedger,
    runner::{LaunchError, LaunchRequest, RoundEnv, WorkerLauncher, WorkerLink},
    slot::{Client, ClientSlot},
};

/// Delay between scheduling attempts of one worker.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of one `ClientScheduler::run`.
#[derive(Debug, Clone, Default)]
pub struct SchedulerReport {
    /// Task rounds started, successful or not.
    pub rounds: usize,
    /// Workers whose loop ended with an error.
    pub failed_workers: usize,
    /// END_RUN ledger in insertion order.
    pub end_run: Vec<SiteName>,
    /// Final status of every client, in pool order.
    pub statuses: Vec<(SiteName, ClientStatus)>,
}

impl SchedulerReport {
    pub fn is_clean(&self) -> bool {
        self.failed_workers == 0
    }
}

pub struct ClientScheduler {
    launcher: Arc<dyn WorkerLauncher>,
    services: RunServices,
    env: Arc<RoundEnv>,
    client_config: Arc<Value>,
    deploy_args: Arc<DeployArgs>,
    build_ctx: BuildContext,
    poll_interval: Duration,
}

impl ClientScheduler {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, services: RunServices) -> Self {
        Self {
            launcher,
            services,
            env: Arc::new(RoundEnv::default()),
            client_config: Arc::new(Value::Null),
            deploy_args: Arc::new(DeployArgs::default()),
            build_ctx: BuildContext::new(),
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_env(mut self, env: RoundEnv) -> Self {
        self.env = Arc::new(env);
        self
    }

    pub fn with_client_config(mut self, client_config: Value) -> Self {
        self.client_config = Arc::new(client_config);
        self
    }

    pub fn with_deploy_args(mut self, deploy_args: DeployArgs) -> Self {
        self.deploy_args = Arc::new(deploy_args);
        self
    }

    pub fn with_build_ctx(mut self, build_ctx: BuildContext) -> Self {
        self.build_ctx = build_ctx;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Run every client of `clients` to completion on `threads` workers.
    ///
    /// Worker failures are logged and isolated; the returned report says how
    /// many workers failed. All clients are torn down before returning.
    pub async fn run(
        &self,
        clients: Vec<ClientSlot>,
        threads: usize,
        gpu: Option<String>,
        end_run_for_all: bool,
        timeout: Duration,
    ) -> SchedulerReport {
        let total = clients.len();
        let threads = threads.max(1);
        info!(
            target: "flsim.core.scheduler",
            clients = total,
            threads,
            gpu = ?gpu,
            end_run_for_all,
            "start the clients run simulation"
        );

        let mut slots = clients;
        // Slots handed back from an earlier run come in `Stopped`.
        for slot in &mut slots {
            if !slot.status().is_active() {
                slot.set_status(ClientStatus::Started);
            }
        }

        let dispatch = Arc::new(Dispatch {
            pool: Mutex::new(Pool {
                slots,
                ledger: EndRunLedger::new(total),
                build_ctx: self.build_ctx.clone(),
                primary_active: threads,
            }),
            total,
            threads,
            gpu,
            end_run_for_all,
            timeout,
            poll_interval: self.poll_interval,
            launcher: Arc::clone(&self.launcher),
            services: self.services.clone(),
            env: Arc::clone(&self.env),
            client_config: Arc::clone(&self.client_config),
            deploy_args: Arc::clone(&self.deploy_args),
            rounds: AtomicUsize::new(0),
        });

        let mut workers = JoinSet::new();
        for id in 0..threads {
            workers.spawn(Arc::clone(&dispatch).worker(id));
        }

        let mut failed_workers = 0;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(true) => {}
                Ok(false) => failed_workers += 1,
                Err(e) => {
                    error!(target: "flsim.core.scheduler", error = %e, "client worker aborted");
                    failed_workers += 1;
                }
            }
        }

        dispatch.teardown().await;

        let pool = dispatch.lock();
        SchedulerReport {
            rounds: dispatch.rounds.load(Ordering::Acquire),
            failed_workers,
            end_run: pool.ledger.names().to_vec(),
            statuses: pool
                .slots
                .iter()
                .map(|s| (s.name().to_string(), s.status()))
                .collect(),
        }
    }
}

/// State shared by the workers of one scheduler run; guarded by one mutex.
struct Pool {
    slots: Vec<ClientSlot>,
    ledger: EndRunLedger,
    build_ctx: BuildContext,
    /// Workers still in their primary loop.
    primary_active: usize,
}

impl Pool {
    /// Claim the next schedulable client after `cursor`, round-robin.
    ///
    /// The cursor belongs to the calling worker and ends on the last index examined.
    fn next_idle(&mut self, cursor: &mut Option<usize>) -> Option<usize> {
        let n = self.slots.len();
        let start = cursor.map_or(0, |c| c + 1);
        for step in 0..n {
            let idx = (start + step) % n;
            *cursor = Some(idx);
            let slot = &mut self.slots[idx];
            if slot.is_schedulable() && slot.try_acquire() {
                return Some(idx);
            }
        }
        None
    }

    fn all_finished(&self) -> bool {
        self.slots.iter().all(|s| s.is_finished())
    }

    /// Claim the first idle client that still owes END_RUN and reserve its ledger entry.
    ///
    /// While some worker is still in its primary loop only finished clients qualify.
    fn pick_end_run(&mut self) -> Option<usize> {
        let any_client = self.primary_active == 0;
        for idx in 0..self.slots.len() {
            let slot = &mut self.slots[idx];
            if self.ledger.contains(slot.name()) || slot.is_running() {
                continue;
            }
            if !(slot.is_finished() || any_client) {
                continue;
            }
            if slot.try_acquire() {
                self.ledger.insert(slot.name());
                return Some(idx);
            }
        }
        None
    }

    fn record_end_run(&mut self, name: &str) {
        if !self.slots.iter().any(|s| s.name() == name) {
            warn!(target: "flsim.core.scheduler", client = name, "end-run report for unknown client ignored");
            return;
        }
        if !self.ledger.insert(name) {
            debug!(target: "flsim.core.scheduler", client = name, "end-run already recorded");
        }
    }
}

struct WorkerState {
    id: usize,
    cursor: Option<usize>,
    current: Option<usize>,
    earmarked: Option<usize>,
}

struct RoundOutcome {
    stop: bool,
    next_client: Option<usize>,
    end_run_client: Option<SiteName>,
}

struct Dispatch {
    pool: Mutex<Pool>,
    total: usize,
    threads: usize,
    gpu: Option<String>,
    end_run_for_all: bool,
    timeout: Duration,
    poll_interval: Duration,
    launcher: Arc<dyn WorkerLauncher>,
    services: RunServices,
    env: Arc<RoundEnv>,
    client_config: Arc<Value>,
    deploy_args: Arc<DeployArgs>,
    rounds: AtomicUsize,
}

impl Dispatch {
    fn lock(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn worker(self: Arc<Self>, id: usize) -> bool {
        let mut st = WorkerState {
            id,
            cursor: None,
            current: None,
            earmarked: None,
        };

        let primary = self.primary_loop(&mut st).await;
        if primary.is_err() {
            self.release_held(&mut st);
        }
        self.lock().primary_active -= 1;

        let result = match primary {
            Ok(()) if self.end_run_for_all => self.drain(&mut st).await,
            other => other,
        };

        match result {
            Ok(()) => {
                debug!(target: "flsim.core.scheduler", worker = id, "client worker finished");
                true
            }
            Err(e) => {
                error!(target: "flsim.core.scheduler", worker = id, error = %e, "run_client_thread error");
                self.release_held(&mut st);
                false
            }
        }
    }

    async fn primary_loop(&self, st: &mut WorkerState) -> Result<(), LaunchError> {
        loop {
            tokio::time::sleep(self.poll_interval).await;

            let picked = {
                let mut pool = self.lock();
                match st.earmarked.take() {
                    Some(idx) => Some(idx),
                    None => match pool.next_idle(&mut st.cursor) {
                        Some(idx) => Some(idx),
                        None if pool.all_finished() => return Ok(()),
                        None => None,
                    },
                }
            };
            let Some(cur) = picked else {
                continue;
            };

            st.current = Some(cur);
            let outcome = self.do_one_task(cur, st, RunnerTask::TaskExec).await?;
            {
                let mut pool = self.lock();
                if let Some(name) = &outcome.end_run_client {
                    pool.record_end_run(name);
                }
                let slot = &mut pool.slots[cur];
                if outcome.stop {
                    slot.mark_finished();
                }
                slot.release();
            }
            st.current = None;
            st.earmarked = outcome.next_client;
        }
    }

    async fn drain(&self, st: &mut WorkerState) -> Result<(), LaunchError> {
        loop {
            let picked = {
                let mut pool = self.lock();
                if pool.ledger.is_complete() {
                    return Ok(());
                }
                pool.pick_end_run()
            };

            match picked {
                Some(idx) => {
                    st.current = Some(idx);
                    self.do_one_task(idx, st, RunnerTask::EndRun).await?;
                    self.lock().slots[idx].release();
                    st.current = None;
                }
                None => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    fn release_held(&self, st: &mut WorkerState) {
        let mut pool = self.lock();
        if let Some(idx) = st.current.take() {
            pool.slots[idx].release();
        }
        if let Some(idx) = st.earmarked.take() {
            pool.slots[idx].release();
        }
    }

    /// One spawn-connect-handshake-teardown cycle for the client at `cur`.
    async fn do_one_task(
        &self,
        cur: usize,
        st: &mut WorkerState,
        task: RunnerTask,
    ) -> Result<RoundOutcome, LaunchError> {
        let (client, paths) = {
            let pool = self.lock();
            let slot = &pool.slots[cur];
            (Arc::clone(slot.client()), Arc::clone(slot.paths()))
        };
        info!(
            target: "flsim.core.scheduler",
            worker = st.id,
            client = %client.name,
            task = %task,
            gpu = ?self.gpu,
            "simulate run client"
        );

        self.rounds.fetch_add(1, Ordering::AcqRel);
        self.services.stats.worker_spawned(&client.name);
        let started = Instant::now();

        let request = LaunchRequest {
            client: Arc::clone(&client),
            paths,
            env: Arc::clone(&self.env),
            task,
            gpu: self.gpu.clone(),
            timeout: self.timeout,
        };

        let result = match self.launcher.launch(request).await {
            Ok(mut link) => {
                let result = self.exchange(link.as_mut(), &client, cur, st, task).await;
                link.shutdown().await;
                result
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(_) => self
                .services
                .stats
                .round_completed(&client.name, task, started.elapsed()),
            Err(_) => self.services.stats.round_failed(&client.name),
        }
        result
    }

    async fn exchange(
        &self,
        link: &mut dyn WorkerLink,
        client: &Client,
        cur: usize,
        st: &mut WorkerState,
        task: RunnerTask,
    ) -> Result<RoundOutcome, LaunchError> {
        let build_ctx = {
            let mut pool = self.lock();
            pool.build_ctx.insert("client_name", client.name.as_str());
            pool.build_ctx.clone()
        };
        link.send(WorkerMessage::Startup(StartupPayload {
            client_config: (*self.client_config).clone(),
            deploy_args: self.deploy_args.rebased(&client.name),
            build_ctx,
        }))
        .await?;

        // END_RUN rounds always stay on their client.
        let reassign = task == RunnerTask::TaskExec && self.threads != self.total;

        loop {
            let stop = match link.recv().await? {
                WorkerMessage::Status { stop } => stop,
                other => return Err(LaunchError::protocol("status", &other)),
            };
            let end_run_client = if stop {
                match link.recv().await? {
                    WorkerMessage::EndRunClient { name } => name.filter(|n| !n.is_empty()),
                    other => return Err(LaunchError::protocol("endRunClient", &other)),
                }
            } else {
                None
            };

            let next = if stop {
                None
            } else if reassign {
                let mut pool = self.lock();
                match pool.next_idle(&mut st.cursor) {
                    Some(idx) => {
                        st.earmarked = Some(idx);
                        Some(idx)
                    }
                    None => Some(cur),
                }
            } else {
                Some(cur)
            };

            let proceed = !stop && next == Some(cur);
            link.send(WorkerMessage::Continue { proceed }).await?;
            if !proceed {
                return Ok(RoundOutcome {
                    stop,
                    next_client: next.filter(|&idx| idx != cur),
                    end_run_client,
                });
            }
        }
    }

    /// Release every client regardless of how its rounds ended.
    async fn teardown(&self) {
        let clients: Vec<Arc<Client>> = self
            .lock()
            .slots
            .iter()
            .map(|s| Arc::clone(s.client()))
            .collect();

        let mut pending = JoinSet::new();
        for client in clients {
            let launcher = Arc::clone(&self.launcher);
            pending.spawn(async move {
                let released = launcher.release_client(&client).await;
                client.endpoint.close();
                (client.name.clone(), released)
            });
        }
        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(e))) => {
                    warn!(target: "flsim.core.scheduler", client = %name, error = %e, "exception happened to client during shutdown")
                }
                Err(e) => warn!(target: "flsim.core.scheduler", error = %e, "client shutdown aborted"),
            }
        }

        let mut pool = self.lock();
        for slot in &mut pool.slots {
            slot.release();
            slot.set_status(ClientStatus::Stopped);
        }
    }
}
