use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
};

use burrow_core::{
    ErrorCode, Event, FileAction, FileMutation, PROTOCOL_VERSION, ProjectId, Request, Response,
};
use burrow_ipc::{BurrowClient, IpcError};
use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Parser)]
#[command(name = "burrow", about = "Burrow CLI")]
struct Cli {
    #[arg(long, default_value = "/tmp/burrowd.sock")]
    socket: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Version,
    Health,
    /// Run one command in a project sandbox.
    Exec {
        project: String,
        /// Working directory returned by a previous exec.
        #[arg(long)]
        cwd: Option<String>,
        #[arg(last = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },
    Port {
        #[command(subcommand)]
        action: PortAction,
    },
    /// Write a file or create a folder and broadcast the change.
    Write {
        project: String,
        path: String,
        #[arg(long)]
        content: Option<String>,
        #[arg(long)]
        folder: bool,
        /// Mark the change as a new entry rather than an edit.
        #[arg(long)]
        create: bool,
    },
    /// Print file changes made by other participants.
    Watch {
        project: String,
        /// Emit one JSON object per event.
        #[arg(long)]
        json: bool,
    },
    /// Line-oriented interactive terminal.
    Shell {
        project: String,
        #[arg(long, default_value_t = 80)]
        cols: u16,
        #[arg(long, default_value_t = 24)]
        rows: u16,
    },
}

#[derive(Debug, Subcommand)]
enum PortAction {
    Assign { project: String },
    Get { project: String },
    Release { project: String },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("daemon error [{code:?}]: {message}{detail}")]
    Daemon {
        code: ErrorCode,
        message: String,
        detail: String,
    },
    #[error("serialize event: {0}")]
    Json(#[from] serde_json::Error),
    #[error("command failed")]
    CommandFailed,
    #[error("unexpected response for {command}: {response:?}")]
    Unexpected {
        command: &'static str,
        response: Box<Response>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::CommandFailed) => ExitCode::from(1),
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let client = BurrowClient::connect(&cli.socket).await?;

    match cli.command {
        Command::Version => match client.call(Request::Version {}).await? {
            Response::Version { daemon, protocol } => {
                if protocol != PROTOCOL_VERSION {
                    return Err(IpcError::ProtocolMismatch {
                        expected: PROTOCOL_VERSION,
                        actual: protocol,
                    }
                    .into());
                }
                println!("burrowd {daemon} (protocol {protocol})");
                Ok(())
            }
            other => Err(reject("version", other)),
        },
        Command::Health => match client.call(Request::Health {}).await? {
            Response::Health {
                status,
                pty_available,
            } => {
                let mode = if pty_available { "pty" } else { "exec-only" };
                println!("{status} ({mode})");
                Ok(())
            }
            other => Err(reject("health", other)),
        },
        Command::Exec {
            project,
            cwd,
            command,
        } => {
            let request = Request::Exec {
                project_id: ProjectId(project),
                command: Some(shell_words::join(&command)),
                cwd,
            };
            match client.call(request).await? {
                Response::ExecResult {
                    output,
                    error,
                    cwd,
                    ..
                } => {
                    let mut stdout = io::stdout().lock();
                    stdout.write_all(output.as_bytes())?;
                    if !output.is_empty() && !output.ends_with('\n') {
                        stdout.write_all(b"\n")?;
                    }
                    stdout.flush()?;
                    eprintln!("cwd: {cwd}");
                    if error {
                        Err(CliError::CommandFailed)
                    } else {
                        Ok(())
                    }
                }
                other => Err(reject("exec", other)),
            }
        }
        Command::Port { action } => port(&client, action).await,
        Command::Write {
            project,
            path,
            content,
            folder,
            create,
        } => {
            let request = Request::FileUpdate {
                project_id: ProjectId(project),
                mutation: FileMutation {
                    file_path: path,
                    content,
                    is_folder: folder,
                    action: if create {
                        FileAction::Create
                    } else {
                        FileAction::Update
                    },
                },
            };
            match client.call(request).await? {
                Response::FileApplied { file_path, .. } => {
                    println!("{file_path}");
                    Ok(())
                }
                other => Err(reject("write", other)),
            }
        }
        Command::Watch { project, json } => watch(&client, ProjectId(project), json).await,
        Command::Shell {
            project,
            cols,
            rows,
        } => shell(&client, ProjectId(project), cols, rows).await,
    }
}

async fn port(client: &BurrowClient, action: PortAction) -> Result<(), CliError> {
    let (command, request) = match action {
        PortAction::Assign { project } => (
            "port assign",
            Request::PortAssign {
                project_id: ProjectId(project),
            },
        ),
        PortAction::Get { project } => (
            "port get",
            Request::PortGet {
                project_id: ProjectId(project),
            },
        ),
        PortAction::Release { project } => (
            "port release",
            Request::PortRelease {
                project_id: ProjectId(project),
            },
        ),
    };

    match client.call(request).await? {
        Response::Port {
            port: Some(port), ..
        } => {
            println!("{port}");
            Ok(())
        }
        Response::Port { port: None, .. } => {
            println!("none");
            Ok(())
        }
        Response::PortReleased { project_id } => {
            println!("released {project_id}");
            Ok(())
        }
        other => Err(reject(command, other)),
    }
}

async fn watch(client: &BurrowClient, project_id: ProjectId, json: bool) -> Result<(), CliError> {
    join(client, &project_id).await?;

    loop {
        tokio::select! {
            event = client.next_event() => {
                let Some(event) = event else {
                    return Ok(());
                };
                if let Event::FileUpdated { mutation, .. } = &event {
                    if json {
                        println!("{}", serde_json::to_string(&event)?);
                    } else {
                        let kind = if mutation.is_folder { "folder" } else { "file" };
                        println!("{:?} {kind} {}", mutation.action, mutation.file_path);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn shell(
    client: &BurrowClient,
    project_id: ProjectId,
    cols: u16,
    rows: u16,
) -> Result<(), CliError> {
    let terminal_id = match client
        .call(Request::TerminalOpen {
            project_id,
            cols,
            rows,
        })
        .await?
    {
        Response::TerminalOpened { terminal_id, .. } => terminal_id,
        other => return Err(reject("shell", other)),
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let Some(mut line) = line? else {
                    stdin_open = false;
                    client
                        .call(Request::TerminalInput {
                            terminal_id: terminal_id.clone(),
                            data: b"exit\r".to_vec(),
                        })
                        .await?;
                    continue;
                };
                line.push('\r');
                match client
                    .call(Request::TerminalInput {
                        terminal_id: terminal_id.clone(),
                        data: line.into_bytes(),
                    })
                    .await?
                {
                    Response::TerminalAck { .. } => {}
                    other => return Err(reject("shell", other)),
                }
            }
            event = client.next_event() => match event {
                Some(Event::TerminalOutput { data, .. }) => {
                    let mut stdout = io::stdout().lock();
                    stdout.write_all(&data)?;
                    stdout.flush()?;
                }
                Some(Event::TerminalExit { exit_code, signal, .. }) => {
                    match (exit_code, signal) {
                        (_, Some(signal)) => eprintln!("\r\n[terminal killed by {signal}]"),
                        (Some(code), None) => eprintln!("\r\n[terminal exited with {code}]"),
                        (None, None) => eprintln!("\r\n[terminal exited]"),
                    }
                    return Ok(());
                }
                Some(Event::FileUpdated { .. }) => {}
                None => return Err(IpcError::Closed.into()),
            },
            _ = tokio::signal::ctrl_c() => {
                client
                    .call(Request::TerminalClose {
                        terminal_id: terminal_id.clone(),
                    })
                    .await?;
                return Ok(());
            }
        }
    }
}

async fn join(client: &BurrowClient, project_id: &ProjectId) -> Result<(), CliError> {
    match client
        .call(Request::ProjectJoin {
            project_id: project_id.clone(),
        })
        .await?
    {
        Response::ProjectJoined { .. } => Ok(()),
        other => Err(reject("join", other)),
    }
}

fn reject(command: &'static str, response: Response) -> CliError {
    match response {
        Response::Error {
            code,
            message,
            detail,
        } => CliError::Daemon {
            code,
            message,
            detail: format_detail(detail),
        },
        other => CliError::Unexpected {
            command,
            response: Box::new(other),
        },
    }
}

fn format_detail(detail: Option<String>) -> String {
    detail
        .map(|value| format!(" ({value})"))
        .unwrap_or_default()
}
