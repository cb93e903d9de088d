//! Detects whether an agent socket path is already being served.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::path::Path;

use anyhow::{bail, Context, Result};

/// Result of probing an existing socket path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseOutcome {
    /// A live listener owns the path; share it instead of binding.
    Reused,
    /// Nothing exists at the path.
    NotPresent,
    /// A leftover socket with no listener was removed.
    StaleRemoved,
}

/// Probe `path` by connecting to it as a client.
///
/// A refused connection on a socket file means a previous instance died
/// without cleaning up; the file is removed so the caller can bind again.
/// A non-socket file at the path, or any other connect error, is fatal.
pub fn try_reuse(path: &Path) -> Result<ReuseOutcome> {
    match UnixStream::connect(path) {
        Ok(_) => {
            log::info!("[Socket] Reusing live agent socket {}", path.display());
            Ok(ReuseOutcome::Reused)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(ReuseOutcome::NotPresent),
        Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
            let meta = fs::symlink_metadata(path)
                .with_context(|| format!("Failed to inspect {}", path.display()))?;
            if !meta.file_type().is_socket() {
                bail!("{} exists and is not a socket", path.display());
            }
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket: {}", path.display()))?;
            log::info!("[Socket] Removed stale socket {}", path.display());
            Ok(ReuseOutcome::StaleRemoved)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to probe socket: {}", path.display())),
    }
}
