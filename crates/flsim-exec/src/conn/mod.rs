//! Authenticated, length-framed duplex channel between a scheduler worker and
//! one client worker process.
//!
//! Frames are `u32` big-endian length prefixed; each frame carries one JSON
//! encoded [`WorkerMessage`]. The connecting side proves itself with
//! `Hello { token }` and the listening side answers `Welcome`.

use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, trace, warn};

use flsim_model::WorkerMessage;

use crate::error::ConnError;

/// Delay between connection attempts in [`WorkerConnection::open`].
pub const CONNECT_RETRY: Duration = Duration::from_secs(1);

const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub struct WorkerConnection {
    framed: Option<Framed<TcpStream, LengthDelimitedCodec>>,
    peer: String,
}

impl WorkerConnection {
    fn new(stream: TcpStream, peer: String) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LEN)
            .new_codec();
        Self {
            framed: Some(Framed::new(stream, codec)),
            peer,
        }
    }

    /// Connect to `target` and authenticate with `token`.
    ///
    /// Attempts repeat every [`CONNECT_RETRY`] until `timeout` has passed
    /// since the first one.
    pub async fn open<A>(target: A, token: &str, timeout: Duration) -> Result<Self, ConnError>
    where
        A: ToSocketAddrs + std::fmt::Display + Clone,
    {
        Self::open_with_retry(target, token, timeout, CONNECT_RETRY).await
    }

    pub(crate) async fn open_with_retry<A>(
        target: A,
        token: &str,
        timeout: Duration,
        retry: Duration,
    ) -> Result<Self, ConnError>
    where
        A: ToSocketAddrs + std::fmt::Display + Clone,
    {
        let started = Instant::now();
        let timed_out = || ConnError::ConnectionTimeout {
            target: target.to_string(),
            timeout,
        };

        let stream = loop {
            match TcpStream::connect(target.clone()).await {
                Ok(stream) => break stream,
                Err(e) => {
                    trace!(target: "flsim.exec.conn", %target, error = %e, "connect attempt failed");
                    let elapsed = started.elapsed();
                    if elapsed >= timeout {
                        return Err(timed_out());
                    }
                    // The last attempt lands on the deadline.
                    tokio::time::sleep(retry.min(timeout - elapsed)).await;
                }
            }
        };
        set_nodelay(&stream);

        let mut conn = Self::new(stream, target.to_string());
        let remaining = timeout.saturating_sub(started.elapsed()).max(retry);
        conn.send(&WorkerMessage::Hello {
            token: token.to_string(),
        })
        .await?;
        match tokio::time::timeout(remaining, conn.recv()).await {
            Ok(Ok(WorkerMessage::Welcome)) => {
                debug!(target: "flsim.exec.conn", %target, "connection established");
                Ok(conn)
            }
            Ok(Ok(_)) | Ok(Err(ConnError::Closed)) => Err(ConnError::AuthRejected),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(timed_out()),
        }
    }

    /// Accept the first peer on `listener` that presents `token`.
    ///
    /// Peers with a wrong token are dropped and accepting continues until `timeout`.
    pub async fn accept(
        listener: &TcpListener,
        token: &str,
        timeout: Duration,
    ) -> Result<Self, ConnError> {
        let target = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let handshake = async {
            loop {
                let (stream, peer) = listener.accept().await?;
                set_nodelay(&stream);
                let mut conn = Self::new(stream, peer.to_string());
                match conn.recv().await {
                    Ok(WorkerMessage::Hello { token: presented }) if presented == token => {
                        conn.send(&WorkerMessage::Welcome).await?;
                        debug!(target: "flsim.exec.conn", %peer, "peer authenticated");
                        return Ok::<_, ConnError>(conn);
                    }
                    Ok(other) => {
                        warn!(target: "flsim.exec.conn", %peer, kind = other.kind(), "peer rejected");
                    }
                    Err(e) => {
                        warn!(target: "flsim.exec.conn", %peer, error = %e, "handshake failed");
                    }
                }
                conn.close().await;
            }
        };
        tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| ConnError::ConnectionTimeout { target, timeout })?
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send(&mut self, msg: &WorkerMessage) -> Result<(), ConnError> {
        let framed = self.framed.as_mut().ok_or(ConnError::Closed)?;
        let body = serde_json::to_vec(msg)?;
        trace!(target: "flsim.exec.conn", peer = %self.peer, kind = msg.kind(), "send");
        framed.send(Bytes::from(body)).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<WorkerMessage, ConnError> {
        let framed = self.framed.as_mut().ok_or(ConnError::Closed)?;
        match framed.next().await {
            Some(Ok(frame)) => {
                let msg: WorkerMessage = serde_json::from_slice(&frame)?;
                trace!(target: "flsim.exec.conn", peer = %self.peer, kind = msg.kind(), "recv");
                Ok(msg)
            }
            Some(Err(e)) => Err(ConnError::Io(e)),
            None => Err(ConnError::Closed),
        }
    }

    /// Flush and close. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut framed) = self.framed.take() {
            if let Err(e) = SinkExt::<Bytes>::close(&mut framed).await {
                trace!(target: "flsim.exec.conn", peer = %self.peer, error = %e, "close failed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.framed.is_none()
    }
}

fn set_nodelay(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        trace!(target: "flsim.exec.conn", error = %e, "TCP_NODELAY not set");
    }
}
