//! Unix domain socket side of the bridge.
//!
//! SSH clients connect to the socket named by `SSH_AUTH_SOCK` and speak the
//! agent protocol. The bridge does not interpret messages: it assembles one
//! request frame per client, hands it to a backend, and streams the reply
//! back before reading the next request.
//!
//! # Architecture
//!
//! ```text
//! ssh / ssh-add                         agent-bridge
//! ┌──────────────┐                ┌─────────────────────────┐
//! │ UnixStream   │◄──────────────►│ SocketServer            │
//! │              │  frames over   │  accept loop + JoinSet  │
//! └──────────────┘  Unix socket   │  ClientConn per client  │
//!                                 │   └ FrameBuffer         │
//!                                 └────────────┬────────────┘
//!                                              │ one request → one reply
//!                                              ▼
//!                                     backend::Dispatcher
//! ```
//!
//! # Wire Protocol
//!
//! Length-prefixed frames: `[u32 BE length][payload]`, at most
//! [`MAX_FRAME_LEN`](crate::constants::MAX_FRAME_LEN) bytes in total.
//!
//! See [`framing`] for the buffer state machine.

pub mod client_conn;
pub mod framing;
pub mod listener;
pub mod probe;
pub mod server;

pub use probe::{try_reuse, ReuseOutcome};
pub use server::SocketServer;
