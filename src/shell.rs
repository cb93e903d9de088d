//! Shell commands for exporting the agent environment.
//!
//! The bridge prints these on stdout so callers can `eval` them:
//!
//! ```text
//! SSH_AUTH_SOCK=/tmp/ssh-a1b2c3/agent.4242; export SSH_AUTH_SOCK;
//! AGENT_BRIDGE_PID=4243; export AGENT_BRIDGE_PID;
//! ```

use std::fmt::Write as _;
use std::path::Path;

use crate::constants::{AUTH_SOCK_ENV, BRIDGE_PID_ENV};

/// Syntax family of the shell that will evaluate our output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShellStyle {
    /// `sh`, `bash`, `zsh`, ...
    #[default]
    Bourne,
    /// `csh`, `tcsh`
    CShell,
}

impl ShellStyle {
    /// Guess from `$SHELL`.
    pub fn detect() -> Self {
        Self::from_shell(std::env::var("SHELL").ok().as_deref())
    }

    /// Any shell path containing `csh` is treated as a C shell.
    pub fn from_shell(shell: Option<&str>) -> Self {
        match shell {
            Some(s) if s.contains("csh") => Self::CShell,
            _ => Self::Bourne,
        }
    }

    /// Command setting and exporting `name`.
    pub fn export(self, name: &str, value: &str) -> String {
        let value = quote(value);
        match self {
            Self::Bourne => format!("{name}={value}; export {name};"),
            Self::CShell => format!("setenv {name} {value};"),
        }
    }

    /// Command removing `name` from the environment.
    pub fn unset(self, name: &str) -> String {
        match self {
            Self::Bourne => format!("unset {name};"),
            Self::CShell => format!("unsetenv {name};"),
        }
    }
}

/// Lines exporting the socket path and, for a bridge we started, its pid.
///
/// A reused socket belongs to another process, so no pid is exported.
pub fn export_script(style: ShellStyle, socket: &Path, pid: Option<u32>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", style.export(AUTH_SOCK_ENV, &socket.to_string_lossy()));
    if let Some(pid) = pid {
        let _ = writeln!(out, "{}", style.export(BRIDGE_PID_ENV, &pid.to_string()));
    }
    out
}

/// Lines undoing [`export_script`] after the bridge was killed.
pub fn unset_script(style: ShellStyle) -> String {
    format!("{}\n{}\n", style.unset(AUTH_SOCK_ENV), style.unset(BRIDGE_PID_ENV))
}

/// Single-quote `value` unless it is made only of characters no shell treats specially.
fn quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"/._-+,:@%=".contains(&b));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
