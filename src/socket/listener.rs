//! Owner-only listening socket creation.
//!
//! The socket is created under a restrictive umask rather than chmod'ed
//! after the fact, so there is no window in which another user could
//! connect to it.

use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixListener;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::constants::{LISTEN_BACKLOG, SOCKET_UMASK};
use crate::daemon::CleanupState;

/// Bind a Unix stream socket at `path` and start listening.
///
/// The socket file is created with mode 0600 and recorded in `cleanup`
/// as soon as it exists. On any failure the descriptor is closed.
pub fn bind_and_listen(path: &Path, cleanup: &CleanupState) -> Result<UnixListener> {
    let addr = socket_addr(path)?;

    // SAFETY: plain socket(2) call; the result is checked before use.
    let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if raw < 0 {
        return Err(std::io::Error::last_os_error()).context("Failed to create socket");
    }
    // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: `fd` is a valid open descriptor.
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(std::io::Error::last_os_error()).context("Failed to set FD_CLOEXEC");
    }

    let bound = {
        // SAFETY: umask only swaps the process file-creation mask.
        let previous = unsafe { libc::umask(SOCKET_UMASK) };
        scopeguard::defer! {
            // SAFETY: restores the mask saved above.
            unsafe { libc::umask(previous) };
        }
        // SAFETY: `addr` is a fully initialised sockaddr_un and the length
        // passed matches its size.
        unsafe {
            libc::bind(
                fd.as_raw_fd(),
                std::ptr::from_ref(&addr).cast::<libc::sockaddr>(),
                std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
            )
        }
    };
    if bound < 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("Failed to bind socket: {}", path.display()));
    }
    cleanup.record_socket(path);

    // SAFETY: `fd` is a bound stream socket.
    if unsafe { libc::listen(fd.as_raw_fd(), LISTEN_BACKLOG) } < 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("Failed to listen on socket: {}", path.display()));
    }

    log::info!("[Socket] Listening on {}", path.display());
    Ok(UnixListener::from(fd))
}

fn socket_addr(path: &Path) -> Result<libc::sockaddr_un> {
    // SAFETY: sockaddr_un is a plain C struct for which all-zeroes is valid.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    // Keep room for the trailing NUL (sun_path is 104 bytes on macOS, 108 on Linux).
    if bytes.is_empty() || bytes.len() >= addr.sun_path.len() {
        bail!(
            "Socket path too long ({} bytes, max {}): {}",
            bytes.len(),
            addr.sun_path.len() - 1,
            path.display()
        );
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(addr)
}
