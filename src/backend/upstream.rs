//! Forwarding to another agent listening on a Unix socket.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::Dispatcher;
use crate::constants::{LENGTH_PREFIX_LEN, MAX_FRAME_LEN};
use crate::socket::framing::declared_frame_len;

/// Relays each request to an upstream agent socket over a fresh connection.
#[derive(Debug, Clone)]
pub struct UpstreamAgent {
    path: PathBuf,
    timeout: Duration,
}

impl UpstreamAgent {
    /// Create a relay to the agent at `path`, bounding each exchange by `timeout`.
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self { path, timeout }
    }

    /// Upstream socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn query(&self, request: &[u8]) -> io::Result<Vec<u8>> {
        let mut stream = UnixStream::connect(&self.path)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.write_all(request)?;

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        stream.read_exact(&mut prefix)?;
        let total = declared_frame_len(&prefix).unwrap_or(LENGTH_PREFIX_LEN);
        if total > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("upstream reply too large: {total} bytes"),
            ));
        }

        let mut reply = vec![0u8; total];
        reply[..LENGTH_PREFIX_LEN].copy_from_slice(&prefix);
        stream.read_exact(&mut reply[LENGTH_PREFIX_LEN..])?;
        Ok(reply)
    }
}

impl Dispatcher for UpstreamAgent {
    fn dispatch(&self, request: &[u8]) -> Option<Vec<u8>> {
        match self.query(request) {
            Ok(reply) => Some(reply),
            Err(e) => {
                log::debug!("[Backend] Upstream {} unavailable: {e}", self.path.display());
                None
            }
        }
    }
}
