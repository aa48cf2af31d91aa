mod cli;

use std::{ffi::OsString, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use flsim_core::{RunSupervisor, status};
use flsim_exec::{ProcessLauncher, RUN_MAIN_SUBCOMMAND, SupervisorProcess, report_status, run_worker};
use flsim_observe::{LoggerConfig, logger_init};

use crate::cli::{Cli, Command, SimulateArgs, WorkerCli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let code = match cli.command {
        Command::Simulate(args) => simulate(args).await?,
        Command::RunMain(args) => run_main(args).await?,
        Command::Worker(args) => worker(args).await?,
    };
    std::process::exit(code);
}

/// Re-run this binary as `run-main` in its own process group and wait for its status.
async fn simulate(args: SimulateArgs) -> Result<i32> {
    logger_init(&args.logger())?;

    let exe = std::env::current_exe().context("locate simulator binary")?;
    // argv[1] is `simulate`; everything after it is forwarded unchanged.
    let forwarded: Vec<OsString> = std::env::args_os().skip(2).collect();

    info!(target: "flsim", job = %args.job_folder.display(), workspace = %args.workspace.display(), "starting simulator");
    let code = SupervisorProcess::new(exe, &args.workspace)
        .args([OsString::from(RUN_MAIN_SUBCOMMAND)])
        .args(forwarded)
        .run()
        .await?;

    if code == status::OK {
        info!(target: "flsim", "simulation finished");
    } else {
        error!(target: "flsim", status = code, "simulation failed");
    }
    Ok(code)
}

async fn run_main(args: SimulateArgs) -> Result<i32> {
    let logger = match &args.log_config {
        Some(path) => LoggerConfig::load(path)?,
        None => args.logger(),
    };
    logger_init(&logger)?;

    let workspace = args.workspace.clone();
    let exe = std::env::current_exe().context("locate simulator binary")?;
    let launcher = Arc::new(ProcessLauncher::new(exe));

    let mut supervisor = RunSupervisor::new(args.into_config(), launcher);
    let code = supervisor.run().await;

    if let Err(e) = report_status(code, &workspace) {
        warn!(target: "flsim", error = %e, "failed to report run status");
    }
    Ok(code)
}

async fn worker(args: WorkerCli) -> Result<i32> {
    let logger = LoggerConfig::load(&args.logging_config);
    let (logger, load_err) = match logger {
        Ok(cfg) => (cfg, None),
        Err(e) => (LoggerConfig::default(), Some(e)),
    };
    logger_init(&logger)?;
    if let Some(e) = load_err {
        warn!(target: "flsim", error = %e, "worker logger config not loaded; using defaults");
    }

    let client = args.client.clone();
    match run_worker(args.into()).await {
        Ok(()) => Ok(0),
        Err(e) => {
            error!(target: "flsim", client = %client, error = %e, "worker failed");
            Ok(1)
        }
    }
}
