//! Application-wide constants for agent-bridge.
//!
//! This module centralizes the protocol limits and tuning knobs so the
//! framing code, the listener, and the backends agree on them.
//!
//! # Categories
//!
//! - **Protocol**: Wire framing limits and the synthetic failure reply
//! - **Socket**: Listener and per-connection I/O sizing
//! - **Backend**: Defaults for backend dispatch
//! - **Environment**: Variable names exported to shells and children

use std::time::Duration;

// ============================================================================
// Protocol
// ============================================================================

/// Size of the big-endian length prefix on every frame.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest payload a single frame may declare (256 KiB).
pub const MAX_PAYLOAD_LEN: usize = 256 * 1024;

/// Largest total frame (prefix + payload) accepted or produced: 262148 bytes.
///
/// Anything larger is a protocol violation and closes the connection.
pub const MAX_FRAME_LEN: usize = LENGTH_PREFIX_LEN + MAX_PAYLOAD_LEN;

/// `SSH_AGENT_FAILURE` message number.
pub const SSH_AGENT_FAILURE: u8 = 5;

/// Reply substituted whenever the backend produces nothing usable.
///
/// Length 1, payload `SSH_AGENT_FAILURE`.
pub const FAILURE_REPLY: [u8; 5] = [0, 0, 0, 1, SSH_AGENT_FAILURE];

// ============================================================================
// Socket
// ============================================================================

/// Pending-connection backlog passed to `listen(2)`.
pub const LISTEN_BACKLOG: libc::c_int = 128;

/// Permission bits masked off while the socket file is created.
///
/// Leaves the socket readable and writable by its owner only.
pub const SOCKET_UMASK: libc::mode_t = 0o177;

/// Bytes pulled from a client per read attempt.
pub const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Default ceiling on simultaneously served client connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Name of the socket file inside a freshly created temporary directory.
///
/// The process id is appended, e.g. `agent.4242`.
pub const SOCKET_FILE_PREFIX: &str = "agent.";

/// Prefix of the private temporary directory (`/tmp/ssh-XXXXXX`).
pub const TEMP_DIR_PREFIX: &str = "ssh-";

// ============================================================================
// Backend
// ============================================================================

/// Default bound on a single backend round trip.
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Environment
// ============================================================================

/// Variable pointing SSH clients at the agent socket.
pub const AUTH_SOCK_ENV: &str = "SSH_AUTH_SOCK";

/// Variable carrying the pid of the serving bridge (used by `-k`).
pub const BRIDGE_PID_ENV: &str = "AGENT_BRIDGE_PID";
