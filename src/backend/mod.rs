//! Backend dispatch: turning one request frame into one reply frame.
//!
//! The bridge never interprets agent messages itself. Each complete request
//! is handed to a [`Dispatcher`], which either returns a reply frame or
//! `None`; the connection substitutes the standard failure reply for `None`
//! (and for anything that is not a well-formed frame).
//!
//! # Backend specs
//!
//! Backends are selected with a short textual spec, used on the command
//! line, in the environment, and (as a tagged object) in the config file:
//!
//! | Spec                      | Backend                                  |
//! |---------------------------|------------------------------------------|
//! | `none`                    | [`Unavailable`]: every request fails      |
//! | `socket:<path>`           | [`UpstreamAgent`]: another agent socket  |
//! | `command:<prog> [args..]` | [`CommandBackend`]: one process per call |

pub mod command;
pub mod upstream;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

pub use command::CommandBackend;
pub use upstream::UpstreamAgent;

/// Produces a reply for one complete request frame.
///
/// Called from a blocking worker thread, at most once at a time per client
/// connection. Blocking is fine. The request includes its length prefix;
/// the reply must too.
pub trait Dispatcher: Send + Sync {
    /// Answer `request`, or return `None` if the backend is unreachable or failed.
    fn dispatch(&self, request: &[u8]) -> Option<Vec<u8>>;
}

impl<F> Dispatcher for F
where
    F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync,
{
    fn dispatch(&self, request: &[u8]) -> Option<Vec<u8>> {
        self(request)
    }
}

/// Backend that is never available.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unavailable;

impl Dispatcher for Unavailable {
    fn dispatch(&self, _request: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

/// Which backend to forward requests to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendSpec {
    /// No backend; clients always get the failure reply.
    #[default]
    None,
    /// Forward to an agent listening on another Unix socket.
    Socket {
        /// Upstream agent socket.
        path: PathBuf,
    },
    /// Run a helper per request: request on stdin, reply on stdout.
    Command {
        /// Program to execute.
        program: String,
        /// Arguments passed to the program.
        #[serde(default)]
        args: Vec<String>,
    },
}

impl BackendSpec {
    /// Build the dispatcher described by this spec.
    pub fn build(&self, timeout: Duration) -> Arc<dyn Dispatcher> {
        match self {
            Self::None => Arc::new(Unavailable),
            Self::Socket { path } => Arc::new(UpstreamAgent::new(path.clone(), timeout)),
            Self::Command { program, args } => {
                Arc::new(CommandBackend::new(program.clone(), args.clone(), timeout))
            }
        }
    }
}

impl FromStr for BackendSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "none" {
            return Ok(Self::None);
        }
        if let Some(path) = s.strip_prefix("socket:") {
            if path.is_empty() {
                bail!("socket backend needs a path: socket:<path>");
            }
            return Ok(Self::Socket { path: PathBuf::from(path) });
        }
        if let Some(command) = s.strip_prefix("command:") {
            let mut words = command.split_whitespace().map(str::to_string);
            let Some(program) = words.next() else {
                bail!("command backend needs a program: command:<program> [args...]");
            };
            return Ok(Self::Command {
                program,
                args: words.collect(),
            });
        }
        bail!("unknown backend {s:?} (expected none, socket:<path> or command:<program>)")
    }
}

impl fmt::Display for BackendSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Socket { path } => write!(f, "socket:{}", path.display()),
            Self::Command { program, args } => {
                write!(f, "command:{program}")?;
                for arg in args {
                    write!(f, " {arg}")?;
                }
                Ok(())
            }
        }
    }
}
