/// Site name reserved for the simulated server.
pub const SERVER_SITE: &str = "server";

/// Deploy-map participant meaning "every site of the run".
pub const ALL_SITES: &str = "@ALL";

/// Job id used for the single job a simulator run executes.
pub const JOB_NAME: &str = "simulate_job";

/// Job metadata file written into every participant job folder.
pub const JOB_META_FILE: &str = "meta.json";

/// Folders kept across a workspace cleanup.
pub const STARTUP_FOLDER: &str = "startup";
pub const LOCAL_FOLDER: &str = "local";

/// Logger configuration file name inside a `local` folder.
pub const LOGGING_CONFIG: &str = "log_config.json";

pub const CONFIG_FOLDER: &str = "config";
pub const CUSTOM_FOLDER: &str = "custom";
pub const CLIENT_JOB_CONFIG: &str = "config_fed_client.json";
pub const SERVER_JOB_CONFIG: &str = "config_fed_server.json";
pub const ENVIRONMENT_CONFIG: &str = "environment.json";

/// Stats artifact location, relative to the server workspace.
pub const POOL_STATS_DIR: &str = "pool_stats";
pub const SIMULATOR_POOL_STATS: &str = "simulator_cell_stats.json";

/// Plain-text exit code written by the supervisor process into the workspace root.
pub const PROCESS_RC_FILE: &str = "pid.rc";

/// `--set` key overriding the worker connection timeout.
pub const WORKER_TIMEOUT_VAR: &str = "simulator_worker_timeout";
pub const DEFAULT_WORKER_TIMEOUT_SECS: f64 = 60.0;

/// Default cap on the number of simulated clients.
pub const DEFAULT_MAX_CLIENTS: usize = 100;

/// Environment variable carrying the custom code search path of a worker.
pub const CUSTOM_PATH_VAR: &str = "FLSIM_CUSTOM_PATH";
