use std::{
    fs, io,
    os::unix::fs::FileTypeExt,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use burrow_core::{PROTOCOL_VERSION, default_projects_dir, default_state_dir};
use burrow_ipc::serve_unix;
use burrowd::{DaemonConfig, DaemonDispatcher};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "burrowd", about = "Burrow sandbox daemon")]
struct Args {
    #[arg(long, default_value = "/tmp/burrowd.sock")]
    socket: PathBuf,
    /// Port table and terminal scratch space. Defaults to $BURROW_STATE_DIR or ~/.burrow/state.
    #[arg(long)]
    state_dir: Option<PathBuf>,
    /// One sandbox directory per project. Defaults to $BURROW_PROJECTS_DIR or ~/.burrow/projects.
    #[arg(long)]
    projects_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 3000)]
    port_range_start: u16,
    #[arg(long, default_value_t = 3999)]
    port_range_end: u16,
    #[arg(long, default_value_t = 30)]
    exec_timeout_secs: u64,
    /// Shell for interactive terminals.
    #[arg(long)]
    shell: Option<PathBuf>,
    /// Serve exec only; terminal requests report the backend as unavailable.
    #[arg(long)]
    disable_pty: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("burrowd error: {err}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    prepare_socket_path(&args.socket)?;

    let config = DaemonConfig {
        state_dir: args.state_dir.unwrap_or_else(default_state_dir),
        projects_dir: args.projects_dir.unwrap_or_else(default_projects_dir),
        port_range: args.port_range_start..=args.port_range_end,
        exec_timeout: Duration::from_secs(args.exec_timeout_secs),
        shell: args.shell,
        disable_pty: args.disable_pty,
        ..DaemonConfig::default()
    };
    let handler = config.build()?;
    let terminals = Arc::clone(handler.terminals());

    info!(
        socket = %args.socket.display(),
        pty_available = terminals.is_available(),
        daemon = env!("CARGO_PKG_VERSION"),
        protocol = PROTOCOL_VERSION,
        "starting burrowd"
    );

    let mut terminate = signal(SignalKind::terminate())?;
    let dispatcher = Arc::new(DaemonDispatcher::from(handler));

    let outcome = tokio::select! {
        served = serve_unix(&args.socket, dispatcher) => served.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT");
            Ok(())
        }
        _ = terminate.recv() => {
            info!("received SIGTERM");
            Ok(())
        }
    };

    let closed = terminals.shutdown();
    if let Err(err) = fs::remove_file(&args.socket)
        && err.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!(socket = %args.socket.display(), error = %err, "failed to remove socket");
    }
    info!(terminals = closed, "burrowd stopped");
    outcome
}

fn prepare_socket_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.file_type().is_socket() {
                fs::remove_file(path)
            } else {
                Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a socket", path.display()),
                ))
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
