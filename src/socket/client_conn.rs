//! Per-connection driver for agent clients.
//!
//! Each accepted socket gets a [`ClientConn`] running as its own task. It
//! alternates strictly between reading one request frame and writing one
//! reply frame, using readiness plus non-blocking `try_read`/`try_write`
//! so the [`FrameBuffer`] sees exactly the bytes the socket delivered.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use tokio::net::UnixStream;

use super::framing::{ConnectionState, FrameBuffer, FrameError, FrameStatus};
use crate::backend::Dispatcher;
use crate::constants::READ_CHUNK_SIZE;

/// Identifier for one accepted client, unique within a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn:{:x}", self.0)
    }
}

/// Server-side state for a single agent client.
pub(crate) struct ClientConn {
    id: ConnectionId,
    stream: UnixStream,
    frame: FrameBuffer,
    dispatcher: Arc<dyn Dispatcher>,
}

impl fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConn")
            .field("id", &self.id)
            .field("state", &self.frame.state())
            .finish_non_exhaustive()
    }
}

/// `io::Write` over tokio's non-blocking `try_write`.
struct TryWriter<'a>(&'a UnixStream);

impl Write for TryWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ClientConn {
    pub(crate) fn new(id: ConnectionId, stream: UnixStream, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            id,
            stream,
            frame: FrameBuffer::new(),
            dispatcher,
        }
    }

    /// Serve request/reply cycles until the peer leaves or misbehaves.
    ///
    /// Returns [`FrameError::PeerClosed`] on a clean disconnect. Dropping the
    /// returned future (server shutdown) closes the socket without flushing.
    pub(crate) async fn run(mut self) -> Result<(), FrameError> {
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];

        loop {
            match self.frame.state() {
                ConnectionState::AwaitingRequest => {
                    self.stream.readable().await?;
                    let n = match self.stream.try_read(&mut chunk) {
                        Ok(n) => n,
                        Err(e) if is_retryable(&e) => continue,
                        Err(e) => return Err(e.into()),
                    };
                    if self.frame.feed(&chunk[..n])? == FrameStatus::Complete {
                        self.dispatch().await?;
                    }
                }
                ConnectionState::AwaitingDispatch => self.dispatch().await?,
                ConnectionState::SendingReply => {
                    self.stream.writable().await?;
                    if self.frame.drain(&mut TryWriter(&self.stream))? == FrameStatus::Complete {
                        log::trace!("[Socket] {}: reply sent", self.id);
                    }
                }
            }
        }
    }

    /// Hand the buffered request to the backend and install its reply.
    ///
    /// Runs on the blocking pool: a slow backend holds up this connection only.
    async fn dispatch(&mut self) -> Result<(), FrameError> {
        let request = self
            .frame
            .take_request()
            .ok_or(FrameError::OutOfTurn(self.frame.state()))?;
        log::trace!("[Socket] {}: dispatching {}-byte request", self.id, request.len());

        let dispatcher = Arc::clone(&self.dispatcher);
        let reply = tokio::task::spawn_blocking(move || dispatcher.dispatch(&request))
            .await
            .unwrap_or_else(|e| {
                log::error!("[Backend] Dispatch task failed: {e}");
                None
            });

        if self.frame.set_reply(reply)? {
            log::debug!("[Socket] {}: no usable backend reply, sending failure", self.id);
        }
        Ok(())
    }
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}
