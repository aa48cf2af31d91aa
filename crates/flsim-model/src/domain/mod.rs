mod kv;
pub use kv::{KeyValue, KeyValueError};

mod client_status;
pub use client_status::ClientStatus;

mod machine_status;
pub use machine_status::MachineStatus;

mod runner_task;
pub use runner_task::RunnerTask;

mod build_ctx;
pub use build_ctx::BuildContext;

mod constants;
pub use constants::*;

/// Name of a simulated participant (`server`, `site-1`, ...).
///
/// Unique within one simulator run.
pub type SiteName = String;

/// Timeout value in seconds, as accepted on the command line and in `--set` pairs.
pub type TimeoutSecs = f64;
