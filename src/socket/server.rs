//! Connection multiplexer for the agent socket.
//!
//! Accepts clients on the listening socket and runs a [`ClientConn`] task
//! for each, all owned by one [`JoinSet`]. The set is the registry of live
//! connections: its size is checked against the capacity limit before a new
//! client is registered, and finished connections are reaped before further
//! accepts are considered.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::client_conn::{ClientConn, ConnectionId};
use super::framing::FrameError;
use crate::backend::Dispatcher;

/// Outcome reported by a finished connection task.
type ConnOutcome = (ConnectionId, Result<(), FrameError>);

/// Running agent socket server.
///
/// Owns the accept loop task; every client connection lives inside it.
#[derive(Debug)]
pub struct SocketServer {
    /// Path to the socket file (for logging; removal is the cleanup state's job).
    socket_path: PathBuf,
    /// Stops the accept loop and drops all connections.
    shutdown: CancellationToken,
    /// Handle to the accept loop task.
    accept_handle: JoinHandle<()>,
}

impl SocketServer {
    /// Start serving on an already bound listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be registered with the runtime.
    pub fn start(
        listener: std::os::unix::net::UnixListener,
        dispatcher: Arc<dyn Dispatcher>,
        max_connections: usize,
    ) -> Result<Self> {
        let socket_path = listener
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(Path::to_path_buf))
            .unwrap_or_default();

        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener).context("Failed to register listener")?;

        let shutdown = CancellationToken::new();
        let accept_handle = tokio::spawn(Self::accept_loop(
            listener,
            dispatcher,
            max_connections.max(1),
            shutdown.clone(),
        ));

        Ok(Self {
            socket_path,
            shutdown,
            accept_handle,
        })
    }

    /// Accept loop; runs as a tokio task until cancelled.
    async fn accept_loop(
        listener: UnixListener,
        dispatcher: Arc<dyn Dispatcher>,
        max_connections: usize,
        shutdown: CancellationToken,
    ) {
        let mut connections: JoinSet<ConnOutcome> = JoinSet::new();
        let mut next_id: u64 = 0;

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                Some(joined) = connections.join_next() => Self::reap(joined),

                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        if connections.len() >= max_connections {
                            log::warn!(
                                "[Socket] Connection limit ({max_connections}) reached, rejecting client"
                            );
                            drop(stream);
                            continue;
                        }

                        next_id += 1;
                        let id = ConnectionId(next_id);
                        log::debug!("[Socket] Client connected: {id} ({} open)", connections.len() + 1);

                        let conn = ClientConn::new(id, stream, Arc::clone(&dispatcher));
                        connections.spawn(async move { (id, conn.run().await) });
                    }
                    Err(e) => {
                        log::error!("[Socket] Accept error: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        }

        log::info!("[Socket] Shutting down, dropping {} connection(s)", connections.len());
        connections.shutdown().await;
    }

    fn reap(joined: Result<ConnOutcome, JoinError>) {
        match joined {
            Ok((id, Ok(()) | Err(FrameError::PeerClosed))) => {
                log::debug!("[Socket] Client disconnected: {id}");
            }
            Ok((id, Err(e))) => log::info!("[Socket] Closed {id}: {e}"),
            Err(e) if e.is_cancelled() => {}
            Err(e) => log::error!("[Socket] Connection task failed: {e}"),
        }
    }

    /// Stop accepting and drop every open connection.
    ///
    /// Pending replies are not flushed; clients see the socket close.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.accept_handle.await {
            if !e.is_cancelled() {
                log::error!("[Socket] Accept loop failed: {e}");
            }
        }
        // Socket file cleanup is handled by daemon::CleanupState
    }

    /// Path to the socket file.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}
