pub mod error;
pub use error::{SimError, SimResult};

pub mod runner;
pub use runner::{LaunchError, LaunchRequest, RoundEnv, WorkerLauncher, WorkerLink};

pub mod slot;
pub use slot::{Client, ClientEndpoint, ClientPaths, ClientSlot};

pub mod ledger;
pub use ledger::EndRunLedger;

pub mod scheduler;
pub use scheduler::{ClientScheduler, SchedulerReport};

pub mod gpu;
pub use gpu::{Budget, FixedGpus, GpuProbe, NvidiaSmi, resolve_budget, split_clients, split_gpus};

pub mod workspace;
pub use workspace::{SiteLayout, cleanup_workspace};

pub mod job;
pub use job::JobPackage;

pub mod server;
pub use server::{LocalServer, ServerApp, ServerContext};

pub mod stats;
pub use stats::StatsPool;

pub mod audit;
pub use audit::Auditor;

pub mod deployer;
pub use deployer::SimulatorDeployer;

pub mod supervisor;
pub use supervisor::{RunContext, RunState, RunSupervisor, SimulatorConfig, status};

/// Explicit run-wide services handed to every component that needs them.
#[derive(Clone, Default)]
pub struct RunServices {
    pub stats: StatsPool,
    pub auditor: Auditor,
}
