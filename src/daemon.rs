//! Process-level plumbing: socket endpoint ownership, cleanup, and detaching.
//!
//! # File Layout
//!
//! ```text
//! /tmp/ssh-XXXXXX/          # private directory (0700), only when no path was given
//!   agent.{pid}             # Unix domain socket (0600)
//! ```
//!
//! Whatever this process creates is recorded in a [`CleanupState`] the
//! moment it exists, so every exit path (normal shutdown, termination
//! signal, fatal startup error) removes exactly what was built and nothing
//! else. A socket shared through reuse is never recorded.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use crate::constants::{SOCKET_FILE_PREFIX, TEMP_DIR_PREFIX};

/// Paths this process owns and must remove before exiting.
///
/// Each field is written at most once, right after the resource is
/// created, and only read afterwards. [`CleanupState::run`] is idempotent.
#[derive(Debug)]
pub struct CleanupState {
    socket_path: OnceLock<PathBuf>,
    temp_dir: OnceLock<PathBuf>,
    done: AtomicBool,
}

/// Cleanup record for the running process.
pub static CLEANUP: CleanupState = CleanupState::new();

impl CleanupState {
    /// Create an empty record. Running it is a no-op until paths are recorded.
    pub const fn new() -> Self {
        Self {
            socket_path: OnceLock::new(),
            temp_dir: OnceLock::new(),
            done: AtomicBool::new(false),
        }
    }

    /// Record the socket file once it has been bound.
    pub fn record_socket(&self, path: &Path) {
        if self.socket_path.set(path.to_path_buf()).is_err() {
            log::warn!("[Daemon] Socket path already recorded, ignoring {}", path.display());
        }
    }

    /// Record the temporary directory once it has been created.
    pub fn record_temp_dir(&self, path: &Path) {
        if self.temp_dir.set(path.to_path_buf()).is_err() {
            log::warn!("[Daemon] Temp dir already recorded, ignoring {}", path.display());
        }
    }

    /// Recorded socket path, if any.
    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.get().map(PathBuf::as_path)
    }

    /// Recorded temporary directory, if any.
    pub fn temp_dir(&self) -> Option<&Path> {
        self.temp_dir.get().map(PathBuf::as_path)
    }

    /// Mark the record as handled without removing anything.
    ///
    /// Used by the parent after forking: the child now owns the files.
    pub fn disarm(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    /// Remove the socket file, then the temporary directory.
    ///
    /// Returns `false` if cleanup already ran (or was disarmed).
    pub fn run(&self) -> bool {
        if self.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(path) = self.socket_path.get() {
            let _ = fs::remove_file(path);
        }
        if let Some(dir) = self.temp_dir.get() {
            let _ = fs::remove_dir(dir);
        }
        true
    }
}

impl Default for CleanupState {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the agent socket lives, and whether we own its directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEndpoint {
    path: PathBuf,
    temp_dir: Option<PathBuf>,
}

impl SocketEndpoint {
    /// Resolve the socket path.
    ///
    /// With a non-empty `requested` path it is used verbatim and nothing is
    /// created. Otherwise a private directory `/tmp/ssh-XXXXXX` (mode 0700)
    /// is created and the socket is named `agent.{pid}` inside it.
    pub fn resolve(requested: Option<&Path>, cleanup: &CleanupState) -> Result<Self> {
        if let Some(path) = requested.filter(|p| !p.as_os_str().is_empty()) {
            return Ok(Self {
                path: path.to_path_buf(),
                temp_dir: None,
            });
        }

        let dir = tempfile::Builder::new()
            .prefix(TEMP_DIR_PREFIX)
            .permissions(fs::Permissions::from_mode(0o700))
            .tempdir()
            .context("Failed to create private socket directory")?
            .keep();
        cleanup.record_temp_dir(&dir);
        log::debug!("[Daemon] Created socket directory {}", dir.display());

        let path = dir.join(format!("{SOCKET_FILE_PREFIX}{}", std::process::id()));
        Ok(Self {
            path,
            temp_dir: Some(dir),
        })
    }

    /// Path of the socket file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Temporary directory created for the socket, if any.
    pub fn temp_dir(&self) -> Option<&Path> {
        self.temp_dir.as_deref()
    }
}

/// Which side of a fork we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    /// The invoking process; carries the child's pid.
    Parent(u32),
    /// The detached child.
    Child,
}

/// Fork into the background.
///
/// The child becomes a session leader and has its standard streams pointed
/// at `/dev/null`. Must be called before any threads (including an async
/// runtime) are started.
pub fn daemonize() -> Result<Fork> {
    // SAFETY: the process is still single-threaded at this point, so the
    // child does not inherit locks held by other threads.
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => Err(std::io::Error::last_os_error()).context("fork"),
        0 => {
            detach()?;
            Ok(Fork::Child)
        }
        child => Ok(Fork::Parent(child.unsigned_abs())),
    }
}

fn detach() -> Result<()> {
    // SAFETY: setsid has no memory-safety preconditions.
    if unsafe { libc::setsid() } < 0 {
        return Err(std::io::Error::last_os_error()).context("setsid");
    }

    let devnull = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("open /dev/null")?;
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are valid for the duration of the call.
        if unsafe { libc::dup2(devnull.as_raw_fd(), target) } < 0 {
            return Err(std::io::Error::last_os_error()).context("dup2");
        }
    }
    Ok(())
}

/// Send SIGTERM to the bridge whose pid is in `pid_var`.
pub fn kill_bridge(pid_var: Option<&str>) -> Result<u32> {
    let Some(raw) = pid_var else {
        bail!("{} not set, cannot kill agent", crate::constants::BRIDGE_PID_ENV);
    };
    let pid: libc::pid_t = raw
        .trim()
        .parse()
        .with_context(|| format!("Invalid pid in {}: {raw:?}", crate::constants::BRIDGE_PID_ENV))?;
    if pid <= 0 {
        bail!("Refusing to signal pid {pid}");
    }

    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(pid, libc::SIGTERM) } < 0 {
        return Err(std::io::Error::last_os_error()).with_context(|| format!("kill {pid}"));
    }
    log::info!("[Daemon] Sent SIGTERM to pid {pid}");
    Ok(pid.unsigned_abs())
}

/// Wait for `child` to exit, killing it once `timeout` elapses.
pub fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<ExitStatus> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if start.elapsed() > timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(std::io::ErrorKind::TimedOut.into());
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
