//! Agent Bridge CLI - SSH agent socket forwarding to an external backend.
//!
//! This is the main binary entry point. See the `agent_bridge` library
//! for the core functionality.

use std::ffi::OsString;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitCode, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use agent_bridge::constants::{AUTH_SOCK_ENV, BRIDGE_PID_ENV};
use agent_bridge::daemon::{self, Fork};
use agent_bridge::socket::listener::bind_and_listen;
use agent_bridge::{
    shell, socket, BackendSpec, Config, Dispatcher, ReuseOutcome, ShellStyle, SocketEndpoint,
    SocketServer, CLEANUP,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::flag;
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Set by a termination signal that arrives before the async handlers exist.
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

// CLI
#[derive(Parser, Debug)]
#[command(name = "agent-bridge")]
#[command(version)]
#[command(about = "SSH agent socket that forwards requests to an agent backend")]
struct Cli {
    /// Use C-style shell commands
    #[arg(short = 'c', conflicts_with = "bourne")]
    csh: bool,
    /// Use Bourne-style shell commands
    #[arg(short = 's')]
    bourne: bool,
    /// Kill the bridge named by AGENT_BRIDGE_PID
    #[arg(short = 'k')]
    kill: bool,
    /// Enable debug mode (stay in the foreground, log to stderr)
    #[arg(short = 'd')]
    debug: bool,
    /// Share an existing live socket at the -a path instead of binding
    #[arg(short = 'r')]
    reuse: bool,
    /// Socket path (default: private temporary directory)
    #[arg(short = 'a', value_name = "PATH")]
    address: Option<PathBuf>,
    /// Backend: none, socket:<path> or command:<program> [args..]
    #[arg(short = 'b', long = "backend", value_name = "SPEC")]
    backend: Option<BackendSpec>,
    /// Maximum number of simultaneous clients
    #[arg(long, value_name = "N")]
    max_connections: Option<usize>,
    /// Limit key lifetime (not implemented)
    #[arg(short = 't', value_name = "TIME")]
    lifetime: Option<String>,
    /// Do not print shell export commands
    #[arg(short = 'q')]
    quiet: bool,
    /// Command to run with SSH_AUTH_SOCK set; the bridge exits when it does
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<OsString>,
}

impl Cli {
    fn shell_style(&self) -> ShellStyle {
        if self.csh {
            ShellStyle::CShell
        } else if self.bourne {
            ShellStyle::Bourne
        } else {
            ShellStyle::detect()
        }
    }

    /// Command-line flags override file and environment settings.
    fn apply(&self, config: &mut Config) {
        if let Some(path) = &self.address {
            config.socket_path = Some(path.clone());
        }
        if let Some(backend) = &self.backend {
            config.backend = backend.clone();
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
    }
}

fn init_logging(debug: bool, log_file: Option<&Path>) -> Result<()> {
    let default_filter = if debug { "info" } else { "warn" };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter));
    builder.format_timestamp_secs();

    // A detached bridge has no stderr, so a log file is the only way to see it
    if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

fn print_exports(cli: &Cli, socket: &Path, pid: Option<u32>) -> Result<()> {
    if cli.quiet {
        return Ok(());
    }
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(shell::export_script(cli.shell_style(), socket, pid).as_bytes())?;
    stdout.flush()?;
    Ok(())
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let mut config = Config::load()?;
    cli.apply(&mut config);
    init_logging(cli.debug, config.log_file.as_deref())?;

    if cli.kill {
        daemon::kill_bridge(std::env::var(BRIDGE_PID_ENV).ok().as_deref())?;
        print!("{}", shell::unset_script(cli.shell_style()));
        return Ok(ExitCode::SUCCESS);
    }

    if cli.lifetime.is_some() {
        eprintln!("agent-bridge: option is not implemented -- t");
    }

    if cli.reuse {
        let Some(path) = config.socket_path.as_deref() else {
            bail!("Reuse (-r) needs a socket path (-a PATH)");
        };
        match socket::try_reuse(path)? {
            ReuseOutcome::Reused => {
                if cli.command.is_empty() {
                    print_exports(cli, path, None)?;
                    return Ok(ExitCode::SUCCESS);
                }
                let status = child_command(&cli.command, path, None)
                    .status()
                    .with_context(|| format!("Failed to run {}", cli.command[0].to_string_lossy()))?;
                return Ok(exit_code(status));
            }
            ReuseOutcome::NotPresent | ReuseOutcome::StaleRemoved => {}
        }
    }

    // From here on there is something to clean up, so a termination signal
    // must never take the default action. The flag is inherited across fork.
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;

    let endpoint = SocketEndpoint::resolve(config.socket_path.as_deref(), &CLEANUP)?;
    let listener = bind_and_listen(endpoint.path(), &CLEANUP)?;
    let dispatcher = config.backend.build(config.backend_timeout());
    log::info!("[Backend] Using {}", config.backend);

    if !cli.command.is_empty() {
        let command = Some((cli.command.as_slice(), endpoint.path()));
        return serve(listener, dispatcher, config.max_connections, command, || Ok(()));
    }

    if !cli.debug {
        match daemon::daemonize()? {
            Fork::Parent(pid) => {
                // The child owns the socket from here on
                CLEANUP.disarm();
                print_exports(cli, endpoint.path(), Some(pid))?;
                return Ok(ExitCode::SUCCESS);
            }
            Fork::Child => log::info!("[Daemon] Detached as pid {}", std::process::id()),
        }
    }

    serve(listener, dispatcher, config.max_connections, None, || {
        if cli.debug {
            print_exports(cli, endpoint.path(), Some(std::process::id()))?;
        }
        Ok(())
    })
}

/// Termination signals, registered before serving starts.
struct Terminators {
    term: Signal,
    int: Signal,
    hup: Signal,
}

impl Terminators {
    fn register() -> Result<Self> {
        Ok(Self {
            term: signal(SignalKind::from_raw(SIGTERM))?,
            int: signal(SignalKind::from_raw(SIGINT))?,
            hup: signal(SignalKind::from_raw(SIGHUP))?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.term.recv() => "SIGTERM",
            _ = self.int.recv() => "SIGINT",
            _ = self.hup.recv() => "SIGHUP",
        }
    }
}

fn child_command(argv: &[OsString], socket: &Path, bridge_pid: Option<u32>) -> std::process::Command {
    let mut command = std::process::Command::new(&argv[0]);
    command.args(&argv[1..]).env(AUTH_SOCK_ENV, socket);
    match bridge_pid {
        Some(pid) => command.env(BRIDGE_PID_ENV, pid.to_string()),
        None => command.env_remove(BRIDGE_PID_ENV),
    };
    command
}

/// Serve until a termination signal arrives or, in command mode, the child exits.
///
/// `ready` runs once signal handlers are installed and clients can connect.
fn serve(
    listener: std::os::unix::net::UnixListener,
    dispatcher: Arc<dyn Dispatcher>,
    max_connections: usize,
    command: Option<(&[OsString], &Path)>,
    ready: impl FnOnce() -> Result<()>,
) -> Result<ExitCode> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let result = runtime.block_on(async move {
        let mut terminators = Terminators::register()?;
        // Anything later reaches `terminators`; anything earlier set the flag.
        if SHUTDOWN_FLAG.load(Ordering::SeqCst) {
            log::info!("[Daemon] Terminated during startup");
            return anyhow::Ok(ExitCode::SUCCESS);
        }
        let server = SocketServer::start(listener, dispatcher, max_connections)?;
        ready()?;

        let mut child = match command {
            Some((argv, socket)) => {
                let child = tokio::process::Command::from(child_command(argv, socket, Some(std::process::id())))
                    .spawn()
                    .with_context(|| format!("Failed to run {}", argv[0].to_string_lossy()))?;
                Some(child)
            }
            None => None,
        };

        let code = tokio::select! {
            name = terminators.recv() => {
                log::info!("[Daemon] Received {name}, shutting down");
                ExitCode::SUCCESS
            }
            status = wait_child(child.as_mut()) => {
                let status = status.context("Failed to wait for command")?;
                log::info!("[Daemon] Command exited with {status}");
                exit_code(status)
            }
        };

        server.shutdown().await;
        anyhow::Ok(code)
    });

    // Dispatches still running on the blocking pool are abandoned, not awaited.
    runtime.shutdown_background();
    let code = result?;
    CLEANUP.run();
    Ok(code)
}

async fn wait_child(child: Option<&mut tokio::process::Child>) -> std::io::Result<ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

fn exit_code(status: ExitStatus) -> ExitCode {
    ExitCode::from(status_byte(status))
}

/// Shell convention: the exit code, or 128 + signal for a killed child.
fn status_byte(status: ExitStatus) -> u8 {
    if let Some(code) = status.code() {
        return u8::try_from(code).unwrap_or(1);
    }
    status
        .signal()
        .and_then(|sig| u8::try_from(128 + sig).ok())
        .unwrap_or(1)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            CLEANUP.run();
            log::error!("{e:#}");
            eprintln!("agent-bridge: {e:#}");
            ExitCode::FAILURE
        }
    }
}
