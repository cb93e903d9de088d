//! Helper-process backend: one process per request over stdin/stdout.

use std::io::{self, Read, Write};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use super::Dispatcher;
use crate::constants::MAX_FRAME_LEN;
use crate::daemon::wait_with_timeout;

/// Spawns `program args..` for every request.
///
/// The request frame is written to the child's stdin (then closed) and the
/// reply frame is read from its stdout until EOF. A non-zero exit status,
/// an empty reply, or an overlong reply count as "no reply".
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandBackend {
    /// Create a backend running `program` with `args`, killed after `timeout`.
    pub fn new(program: String, args: Vec<String>, timeout: Duration) -> Self {
        Self { program, args, timeout }
    }

    fn query(&self, request: &[u8]) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let mut stdin = child.stdin.take().ok_or_else(|| io::Error::other("child stdin unavailable"))?;
        let stdout = child.stdout.take().ok_or_else(|| io::Error::other("child stdout unavailable"))?;

        // The child may start answering before it has read everything, so
        // feed stdin and drain stdout concurrently. Neither pipe thread is
        // joined: a grandchild can keep either end open past the deadline.
        let request = request.to_vec();
        let program = self.program.clone();
        thread::spawn(move || {
            if let Err(e) = stdin.write_all(&request) {
                log::debug!("[Backend] {program} did not read the whole request: {e}");
            }
        });
        let (reply_tx, reply_rx) = mpsc::channel();
        thread::spawn(move || {
            let mut reply = Vec::new();
            let read = stdout.take(MAX_FRAME_LEN as u64 + 1).read_to_end(&mut reply);
            let _ = reply_tx.send(read.map(|_| reply));
        });

        let status = wait_with_timeout(&mut child, self.timeout)?;
        let reply = reply_rx
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .map_err(|e| io::Error::new(io::ErrorKind::TimedOut, format!("reply not closed: {e}")))??;

        if !status.success() {
            return Err(io::Error::other(format!("exited with {status}")));
        }
        if reply.is_empty() || reply.len() > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unusable reply of {} bytes", reply.len()),
            ));
        }
        Ok(reply)
    }
}

impl Dispatcher for CommandBackend {
    fn dispatch(&self, request: &[u8]) -> Option<Vec<u8>> {
        match self.query(request) {
            Ok(reply) => Some(reply),
            Err(e) => {
                log::debug!("[Backend] Command {} failed: {e}", self.program);
                None
            }
        }
    }
}
