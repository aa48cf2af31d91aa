//! Simulated server cell.
//!
//! The federated server logic itself is out of scope; [`LocalServer`] owns the
//! two loopback listeners whose URLs are handed to every client worker, keeps
//! the machine status current and writes the stats artifact on shutdown.

use std::{
    net::SocketAddr,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use tokio::{net::TcpListener, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flsim_model::{MachineStatus, SERVER_SITE};

use crate::{
    RunServices,
    error::{SimError, SimResult},
    workspace::SiteLayout,
};

/// Handles a server app needs while it runs.
pub struct ServerContext {
    pub status: watch::Sender<MachineStatus>,
    pub abort: CancellationToken,
    pub layout: SiteLayout,
    pub services: RunServices,
}

#[async_trait]
pub trait ServerApp: Send + Sync {
    /// URL clients use to reach the server root listener.
    fn root_url(&self) -> &str;

    /// URL of the server's internal listener.
    fn internal_listener_url(&self) -> &str;

    /// Run until `ctx.abort` fires. Must publish `Started` once reachable.
    async fn serve(&self, ctx: ServerContext) -> SimResult<()>;
}

/// Loopback server with a root and an internal listener.
pub struct LocalServer {
    root_url: String,
    internal_url: String,
    listeners: Mutex<Option<(TcpListener, TcpListener)>>,
}

impl LocalServer {
    /// Bind both listeners on ephemeral loopback ports.
    pub async fn bind() -> SimResult<Self> {
        let root = bind_loopback().await?;
        let internal = bind_loopback().await?;
        let root_url = tcp_url(local_addr(&root)?);
        let internal_url = tcp_url(local_addr(&internal)?);
        debug!(target: "flsim.core.server", root = %root_url, internal = %internal_url, "server listeners bound");
        Ok(Self {
            root_url,
            internal_url,
            listeners: Mutex::new(Some((root, internal))),
        })
    }
}

async fn bind_loopback() -> SimResult<TcpListener> {
    TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| SimError::ServerStartupFailure(format!("bind loopback listener: {e}")))
}

fn local_addr(listener: &TcpListener) -> SimResult<SocketAddr> {
    listener
        .local_addr()
        .map_err(|e| SimError::ServerStartupFailure(format!("listener address: {e}")))
}

fn tcp_url(addr: SocketAddr) -> String {
    format!("tcp://{addr}")
}

#[async_trait]
impl ServerApp for LocalServer {
    fn root_url(&self) -> &str {
        &self.root_url
    }

    fn internal_listener_url(&self) -> &str {
        &self.internal_url
    }

    async fn serve(&self, ctx: ServerContext) -> SimResult<()> {
        let taken = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some((root, internal)) = taken else {
            return Err(SimError::ServerStartupFailure(
                "server listeners already consumed".into(),
            ));
        };

        ctx.status.send_replace(MachineStatus::Starting);
        ctx.services.auditor.record(SERVER_SITE, "server_started");
        ctx.status.send_replace(MachineStatus::Started);
        info!(target: "flsim.core.server", root = %self.root_url, "server started");

        loop {
            tokio::select! {
                _ = ctx.abort.cancelled() => break,
                accepted = root.accept() => match accepted {
                    Ok((_, peer)) => {
                        ctx.services.stats.connection_accepted();
                        debug!(target: "flsim.core.server", %peer, "root connection");
                    }
                    Err(e) => warn!(target: "flsim.core.server", error = %e, "root accept failed"),
                },
                accepted = internal.accept() => match accepted {
                    Ok((_, peer)) => {
                        ctx.services.stats.connection_accepted();
                        debug!(target: "flsim.core.server", %peer, "internal connection");
                    }
                    Err(e) => warn!(target: "flsim.core.server", error = %e, "internal accept failed"),
                },
            }
        }

        ctx.status.send_replace(MachineStatus::Stopping);
        let stats_file = ctx.layout.stats_file();
        if let Err(e) = ctx.services.stats.dump(&stats_file) {
            warn!(target: "flsim.core.server", error = %e, "failed to write stats");
        }
        ctx.services.auditor.record(SERVER_SITE, "server_stopped");
        ctx.status.send_replace(MachineStatus::Stopped);
        info!(target: "flsim.core.server", "server stopped");
        Ok(())
    }
}
