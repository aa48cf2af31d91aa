use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Unit of work a worker process executes for a client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerTask {
    /// Regular federated task execution.
    #[default]
    TaskExec,
    /// Terminal task every client runs once before leaving the federation.
    EndRun,
}

impl RunnerTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerTask::TaskExec => "TASK_EXEC",
            RunnerTask::EndRun => "END_RUN",
        }
    }
}

impl fmt::Display for RunnerTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnerTask {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "TASK_EXEC" => Ok(RunnerTask::TaskExec),
            "END_RUN" => Ok(RunnerTask::EndRun),
            other => Err(format!("unknown runner task: {other}")),
        }
    }
}
