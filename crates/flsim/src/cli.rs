use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use flsim_core::SimulatorConfig;
use flsim_exec::WorkerArgs;
use flsim_model::{DEFAULT_MAX_CLIENTS, KeyValue, RunnerTask};
use flsim_observe::{LoggerConfig, LoggerFormat};

#[derive(Parser, Debug)]
#[command(name = "flsim")]
#[command(about = "Run a federated learning job with simulated clients on one host")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Simulate a job; the run happens in a supervised child process.
    Simulate(SimulateArgs),

    /// Supervisor process body. Prints the run status as JSON on stdout.
    #[command(name = "run-main", hide = true)]
    RunMain(SimulateArgs),

    /// Client worker process; started by the simulator for every task round.
    #[command(hide = true)]
    Worker(WorkerCli),
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Job folder with `meta.json` and app folders.
    pub job_folder: PathBuf,

    /// Simulator workspace; wiped at start except `startup/` and `local/`.
    #[arg(short = 'w', long, env = "FLSIM_WORKSPACE", default_value = "/tmp/flsim/simulate_job")]
    pub workspace: PathBuf,

    /// Comma separated client names.
    #[arg(short = 'c', long, value_delimiter = ',')]
    pub clients: Option<Vec<String>>,

    /// Number of generated clients (site-1..site-N).
    #[arg(short = 'n', long)]
    pub n_clients: Option<usize>,

    /// Concurrent client workers per GPU group.
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// GPU ids, e.g. `0,1` or `[0,1],[2]`.
    #[arg(long)]
    pub gpu: Option<String>,

    /// Logger config file copied into every site.
    #[arg(short = 'l', long)]
    pub log_config: Option<PathBuf>,

    #[arg(short = 'm', long, default_value_t = DEFAULT_MAX_CLIENTS)]
    pub max_clients: usize,

    /// Run END_RUN for every client once regular work is done.
    #[arg(long)]
    pub end_run_for_all: bool,

    /// Extra `key=value` settings, e.g. `simulator_worker_timeout=120`.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<KeyValue>,

    #[arg(long, env = "FLSIM_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "FLSIM_LOG_FORMAT", default_value = "text")]
    pub log_format: LoggerFormat,
}

impl SimulateArgs {
    pub fn logger(&self) -> LoggerConfig {
        LoggerConfig {
            format: self.log_format,
            level: self.log_level.clone(),
            ..Default::default()
        }
    }

    pub fn into_config(self) -> SimulatorConfig {
        let logger = self.logger();
        let mut config = SimulatorConfig::new(self.job_folder, self.workspace);
        config.clients = self.clients;
        config.n_clients = self.n_clients;
        config.threads = self.threads;
        config.gpu = self.gpu;
        config.log_config = self.log_config;
        config.max_clients = self.max_clients;
        config.end_run_for_all = self.end_run_for_all;
        config.set = self.set;
        config.logger = logger;
        config
    }
}

#[derive(Args, Debug, Clone)]
pub struct WorkerCli {
    #[arg(short = 'o', long)]
    pub workspace: PathBuf,
    #[arg(long)]
    pub logging_config: PathBuf,
    #[arg(long)]
    pub client: String,
    #[arg(long)]
    pub token: String,
    #[arg(long)]
    pub port: u16,
    #[arg(long, default_value_t = 0)]
    pub parent_pid: u32,
    #[arg(long)]
    pub simulator_root: PathBuf,
    #[arg(long)]
    pub root_url: String,
    #[arg(long, default_value = "")]
    pub parent_url: String,
    #[arg(long = "task-name", default_value = "TASK_EXEC")]
    pub task: RunnerTask,
    #[arg(long)]
    pub gpu: Option<String>,
}

impl From<WorkerCli> for WorkerArgs {
    fn from(cli: WorkerCli) -> Self {
        WorkerArgs {
            workspace: cli.workspace,
            logging_config: cli.logging_config,
            client: cli.client,
            token: cli.token,
            port: cli.port,
            parent_pid: cli.parent_pid,
            simulator_root: cli.simulator_root,
            root_url: cli.root_url,
            parent_url: cli.parent_url,
            task: cli.task,
            gpu: cli.gpu,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use flsim_exec::WorkerCommand;

    use super::*;

    #[test]
    fn simulate_flags_map_to_config() {
        let cli = Cli::try_parse_from([
            "flsim", "simulate", "jobs/hello", "-w", "/tmp/ws", "-c", "a,b", "-t", "2",
            "--gpu", "0,1", "--end-run-for-all", "--set", "simulator_worker_timeout=5",
        ])
        .unwrap();
        let Command::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };
        let config = args.into_config();
        assert_eq!(config.job_folder, Path::new("jobs/hello"));
        assert_eq!(config.workspace, Path::new("/tmp/ws"));
        assert_eq!(config.clients, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(config.threads, Some(2));
        assert_eq!(config.gpu.as_deref(), Some("0,1"));
        assert!(config.end_run_for_all);
        assert_eq!(config.max_clients, DEFAULT_MAX_CLIENTS);
        assert_eq!(config.worker_timeout().unwrap().as_secs(), 5);
    }

    #[test]
    fn malformed_set_is_rejected() {
        let res = Cli::try_parse_from(["flsim", "simulate", "job", "--set", "novalue"]);
        assert!(res.is_err());
    }

    #[test]
    fn worker_command_round_trips_through_cli() {
        let command = WorkerCommand {
            workspace: "/ws/site-1".into(),
            logging_config: "/ws/site-1/local/log_config.json".into(),
            client: "site-1".into(),
            token: "tok".into(),
            port: 4100,
            parent_pid: 42,
            simulator_root: "/ws".into(),
            root_url: "tcp://127.0.0.1:9000".into(),
            parent_url: "tcp://127.0.0.1:9001".into(),
            task: RunnerTask::EndRun,
            gpu: Some("1".into()),
        };
        let mut argv: Vec<std::ffi::OsString> = vec!["flsim".into()];
        argv.extend(command.to_args());

        let Command::Worker(cli) = Cli::try_parse_from(argv).unwrap().command else {
            panic!("expected worker");
        };
        let args = WorkerArgs::from(cli);
        assert_eq!(args.client, "site-1");
        assert_eq!(args.port, 4100);
        assert_eq!(args.parent_pid, 42);
        assert_eq!(args.task, RunnerTask::EndRun);
        assert_eq!(args.gpu.as_deref(), Some("1"));
        assert_eq!(args.workspace, Path::new("/ws/site-1"));
    }
}
