//! Supervisor process: runs the simulation in its own process group and
//! carries its status code back to the caller.
//!
//! The child prints one `{"run_status": N}` line on stdout and writes `N` to
//! `<workspace>/pid.rc`. The caller prefers the stdout line, then the file,
//! then the child's exit code.

use std::{
    ffi::OsString,
    fs,
    io::Write,
    path::{Path, PathBuf},
    process::Stdio,
};

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tracing::{debug, info, warn};

use flsim_core::{SiteLayout, status};

use crate::{
    error::{ExecError, ExecResult},
    limits::{SpawnLimits, attach_limits},
    util::kill_process_tree,
};

/// Hidden subcommand the supervisor process runs.
pub const RUN_MAIN_SUBCOMMAND: &str = "run-main";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct RunStatusLine {
    run_status: i32,
}

/// How to start the supervisor process.
#[derive(Debug, Clone)]
pub struct SupervisorProcess {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub workspace: PathBuf,
}

impl SupervisorProcess {
    pub fn new(program: impl Into<PathBuf>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workspace: workspace.into(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run the supervisor to completion and return its run status.
    ///
    /// Ctrl-C kills the whole supervisor process tree and yields
    /// [`status::INTERRUPTED`].
    pub async fn run(&self) -> ExecResult<i32> {
        self.run_until(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Like [`Self::run`], with `interrupt` standing in for Ctrl-C.
    pub async fn run_until<F>(&self, interrupt: F) -> ExecResult<i32>
    where
        F: std::future::Future<Output = ()>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        attach_limits(&mut cmd, &SpawnLimits::detached());

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecError::Spawn(format!("{}: {e}", self.program.display())))?;
        let pid = child
            .id()
            .ok_or_else(|| ExecError::Spawn("supervisor exited before it was tracked".into()))?;
        info!(target: "flsim.exec.supervise", pid, "supervisor process started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::Spawn("supervisor stdout not captured".into()))?;
        let reader = tokio::spawn(async move {
            let mut slot = None;
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<RunStatusLine>(line.trim()) {
                    Ok(status) => slot = Some(status.run_status),
                    Err(_) => println!("{line}"),
                }
            }
            slot
        });

        tokio::pin!(interrupt);
        let exit = tokio::select! {
            exit = child.wait() => exit?,
            _ = &mut interrupt => {
                warn!(target: "flsim.exec.supervise", pid, "interrupted; killing the simulator process tree");
                kill_process_tree(pid);
                let _ = child.wait().await;
                reader.abort();
                let _ = self.take_rc_file();
                return Ok(status::INTERRUPTED);
            }
        };

        let slot = reader.await.unwrap_or(None);
        let rc_file = self.take_rc_file();
        let code = slot
            .or(rc_file)
            .or_else(|| exit.code())
            .unwrap_or(status::RUN_FAILURE);
        debug!(target: "flsim.exec.supervise", %exit, ?slot, ?rc_file, code, "supervisor process finished");
        Ok(code)
    }

    /// Read and remove the rc file.
    fn take_rc_file(&self) -> Option<i32> {
        let path = SiteLayout::new(&self.workspace).rc_file();
        let raw = fs::read_to_string(&path).ok()?;
        if let Err(e) = fs::remove_file(&path) {
            warn!(target: "flsim.exec.supervise", path = %path.display(), error = %e, "failed to remove rc file");
        }
        raw.trim().parse().ok()
    }
}

/// Child side: publish `code` on stdout and in the rc file.
pub fn report_status(code: i32, workspace: &Path) -> ExecResult<()> {
    let line = serde_json::to_string(&RunStatusLine { run_status: code })
        .map_err(|e| ExecError::Io(e.to_string()))?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{line}")?;
    out.flush()?;

    let path = SiteLayout::new(workspace).rc_file();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, code.to_string())?;
    Ok(())
}
