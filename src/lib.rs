//! Agent Bridge - SSH agent socket in front of an external agent backend.
//!
//! This crate provides the core functionality for the `agent-bridge` CLI:
//! it owns a Unix domain socket that SSH clients talk to, and forwards every
//! framed request to a backend that produces the reply.
//!
//! # Architecture
//!
//! - **Daemon** - socket path resolution, cleanup on exit, detaching
//! - **Socket** - reuse probing, listener setup, connection multiplexer
//! - **Backend** - turns one request frame into one reply frame
//! - **Shell** - environment export commands for the invoking shell
//!
//! # Modules
//!
//! - [`socket`] - Listener, multiplexer and framing
//! - [`backend`] - Dispatchers (none, upstream socket, helper command)
//! - [`daemon`] - Endpoint ownership and process lifecycle
//! - [`config`] - Configuration loading

// Library modules
pub mod backend;
pub mod config;
pub mod constants;
pub mod daemon;
pub mod shell;
pub mod socket;

// Re-export commonly used types
pub use backend::{BackendSpec, Dispatcher};
pub use config::Config;
pub use daemon::{SocketEndpoint, CLEANUP};
pub use shell::ShellStyle;
pub use socket::{ReuseOutcome, SocketServer};
