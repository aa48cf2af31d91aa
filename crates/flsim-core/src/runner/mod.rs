//! Seam between the scheduler and whatever actually runs a client task.
//!
//! The scheduler only talks to a [`WorkerLauncher`]: it asks for a worker
//! bound to one client and then drives the request/response exchange
//! described in `flsim_model::WorkerMessage` over the returned [`WorkerLink`].
//! `flsim-exec` provides the process-backed implementation; tests plug in
//! in-memory fakes.

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use flsim_model::{RunnerTask, WorkerMessage};

use crate::slot::{Client, ClientPaths};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("worker for {client} did not connect back within {timeout:?}")]
    WorkerStartupTimeout { client: String, timeout: Duration },

    #[error("spawn failed for {client}: {reason}")]
    Spawn { client: String, reason: String },

    #[error("connection to worker failed: {0}")]
    Connection(String),

    #[error("protocol violation: expected {expected}, got {got}")]
    Protocol { expected: &'static str, got: String },

    #[error("teardown failed for {client}: {reason}")]
    Teardown { client: String, reason: String },
}

impl LaunchError {
    pub fn protocol(expected: &'static str, got: &WorkerMessage) -> Self {
        LaunchError::Protocol {
            expected,
            got: got.kind().to_string(),
        }
    }
}

/// Run-wide locations every worker needs to know about.
#[derive(Debug, Clone, Default)]
pub struct RoundEnv {
    pub simulator_root: PathBuf,
    /// Server-side custom code directory; hidden from client workers.
    pub server_custom_dir: PathBuf,
}

/// Everything needed to start one worker for one task round.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub client: Arc<Client>,
    pub paths: Arc<ClientPaths>,
    pub env: Arc<RoundEnv>,
    pub task: RunnerTask,
    pub gpu: Option<String>,
    /// Deadline for the worker to accept the connection.
    pub timeout: Duration,
}

/// Duplex message channel to one running worker.
#[async_trait]
pub trait WorkerLink: Send {
    async fn send(&mut self, msg: WorkerMessage) -> Result<(), LaunchError>;

    async fn recv(&mut self) -> Result<WorkerMessage, LaunchError>;

    /// Close the channel and make sure the worker is gone.
    ///
    /// Must be safe to call more than once.
    async fn shutdown(&mut self);
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start a worker for `req.client` and return an authenticated link to it.
    async fn launch(&self, req: LaunchRequest) -> Result<Box<dyn WorkerLink>, LaunchError>;

    /// Release anything still held for `client` at the end of the run.
    async fn release_client(&self, _client: &Client) -> Result<(), LaunchError> {
        Ok(())
    }
}
