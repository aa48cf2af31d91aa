mod error;
pub use error::{ConnError, ExecError, ExecResult};

pub mod conn;
pub use conn::WorkerConnection;

pub mod limits;
pub use limits::{SpawnLimits, attach_limits};

pub mod proc;
pub use proc::{ProcessLauncher, ProcessWorker, WORKER_SUBCOMMAND, WorkerCommand, WorkerEnv};

pub mod supervise;
pub use supervise::{RUN_MAIN_SUBCOMMAND, SupervisorProcess, report_status};

pub mod util;

pub mod worker;
pub use worker::{ClientAppConfig, WorkerArgs, run_worker};

pub mod prelude {
    pub use crate::error::{ExecError, ExecResult};
    pub use crate::{ProcessLauncher, SupervisorProcess, WorkerArgs, run_worker};
}
