use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use burrow_core::{BurrowError, ErrorCode, FileAction, FileMutation, ProjectId};
use burrow_policy::{CommandPolicy, is_within, normalize, resolve_within};
use tokio::{fs, process::Command, time::timeout};
use tracing::{debug, info};

use crate::{state::StateStore, sync::ProjectHub};

/// Wall-clock cap for one spawned command.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of one stateless command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub output: String,
    pub error: bool,
    /// Directory the caller must send back with its next command.
    pub cwd: PathBuf,
    pub exit_code: Option<i32>,
}

impl ExecOutcome {
    fn ok(output: impl Into<String>, cwd: PathBuf) -> Self {
        Self {
            output: output.into(),
            error: false,
            cwd,
            exit_code: None,
        }
    }

    fn failed(output: impl Into<String>, cwd: PathBuf) -> Self {
        Self {
            output: output.into(),
            error: true,
            cwd,
            exit_code: None,
        }
    }
}

/// One-shot command runner for clients without an interactive terminal.
///
/// Holds no per-client state. The caller carries its working directory between
/// calls and it is re-validated every time.
pub struct FallbackExecutor {
    state: Arc<StateStore>,
    policy: CommandPolicy,
    hub: Arc<ProjectHub>,
    timeout: Duration,
}

impl FallbackExecutor {
    pub fn new(
        state: Arc<StateStore>,
        policy: CommandPolicy,
        hub: Arc<ProjectHub>,
        timeout: Duration,
    ) -> Self {
        Self {
            state,
            policy,
            hub,
            timeout,
        }
    }

    pub async fn execute(
        &self,
        project_id: &ProjectId,
        command: Option<&str>,
        caller_cwd: Option<&str>,
    ) -> Result<ExecOutcome, BurrowError> {
        let command = command.map(str::trim).unwrap_or_default();
        if command.is_empty() {
            return Err(BurrowError::new(
                ErrorCode::InvalidRequest,
                "no command provided",
            ));
        }

        let root = self.state.project_root(project_id)?;
        let cwd = effective_cwd(&root, caller_cwd);

        let decision = self.policy.evaluate(command, &cwd, &root);
        if !decision.allowed {
            let reason = decision
                .reason
                .map(|denial| denial.to_string())
                .unwrap_or_else(|| "command not allowed".to_string());
            info!(project_id = %project_id, command, %reason, "exec denied by policy");
            return Ok(ExecOutcome::failed(format!("Error: {reason}"), cwd));
        }

        if let Some(target) = decision.resolved_cwd {
            return Ok(change_directory(command, cwd, target).await);
        }

        let argv = match shell_words::split(command) {
            Ok(argv) => argv,
            Err(err) => return Ok(ExecOutcome::failed(format!("Error: {err}"), cwd)),
        };

        let Some((program, args)) = argv.split_first() else {
            return Ok(ExecOutcome::ok("", cwd));
        };

        let outcome = match (program.as_str(), args.is_empty()) {
            ("touch", _) => self.touch(project_id, &root, cwd, args).await,
            ("mkdir", _) => self.mkdir(project_id, &root, cwd, args).await,
            ("ls" | "dir", true) => list_directory(cwd).await,
            ("pwd", true) => {
                let output = cwd.display().to_string();
                ExecOutcome::ok(output, cwd)
            }
            _ => self.spawn(project_id, program, args, cwd).await,
        };
        Ok(outcome)
    }

    async fn touch(
        &self,
        project_id: &ProjectId,
        root: &Path,
        cwd: PathBuf,
        targets: &[String],
    ) -> ExecOutcome {
        if targets.is_empty() {
            return ExecOutcome::failed("touch: missing file operand", cwd);
        }

        for name in targets {
            let path = match resolve_within(&cwd, name, root) {
                Ok(path) => path,
                Err(denial) => return ExecOutcome::failed(format!("touch: {name}: {denial}"), cwd),
            };

            let existed = fs::try_exists(&path).await.unwrap_or(false);
            let opened = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await;
            if let Err(err) = opened {
                return ExecOutcome::failed(format!("touch: {name}: {err}"), cwd);
            }

            if !existed {
                self.announce(project_id, root, &path, false);
            }
        }

        ExecOutcome::ok("", cwd)
    }

    async fn mkdir(
        &self,
        project_id: &ProjectId,
        root: &Path,
        cwd: PathBuf,
        args: &[String],
    ) -> ExecOutcome {
        let targets: Vec<&String> = args.iter().filter(|arg| !arg.starts_with('-')).collect();
        if targets.is_empty() {
            return ExecOutcome::failed("mkdir: missing operand", cwd);
        }

        for name in targets {
            let path = match resolve_within(&cwd, name, root) {
                Ok(path) => path,
                Err(denial) => return ExecOutcome::failed(format!("mkdir: {name}: {denial}"), cwd),
            };

            if let Err(err) = fs::create_dir_all(&path).await {
                return ExecOutcome::failed(format!("mkdir: {name}: {err}"), cwd);
            }
            self.announce(project_id, root, &path, true);
        }

        ExecOutcome::ok("", cwd)
    }

    /// Tells every project subscriber about an entry created by a built-in.
    fn announce(&self, project_id: &ProjectId, root: &Path, path: &Path, is_folder: bool) {
        let Ok(relative) = path.strip_prefix(root) else {
            return;
        };
        if relative.as_os_str().is_empty() {
            return;
        }
        let mutation = FileMutation {
            file_path: relative.to_string_lossy().into_owned(),
            content: (!is_folder).then(String::new),
            is_folder,
            action: FileAction::Create,
        };
        self.hub.notify(project_id, &mutation, None);
    }

    async fn spawn(
        &self,
        project_id: &ProjectId,
        program: &str,
        args: &[String],
        cwd: PathBuf,
    ) -> ExecOutcome {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&cwd)
            .env("TERM", "xterm-color")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                debug!(project_id = %project_id, program, error = %err, "exec spawn failed");
                return ExecOutcome::failed(format!("Error executing command: {err}"), cwd);
            }
        };

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return ExecOutcome::failed(format!("Error executing command: {err}"), cwd);
            }
            Err(_) => {
                info!(
                    project_id = %project_id,
                    program,
                    timeout_secs = self.timeout.as_secs(),
                    "exec timed out"
                );
                return ExecOutcome::failed(
                    format!(
                        "Error: command timed out after {}s and was terminated",
                        self.timeout.as_secs()
                    ),
                    cwd,
                );
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            text.push_str("\nError: ");
            text.push_str(&String::from_utf8_lossy(&output.stderr));
        }

        let exit_code = output.status.code();
        debug!(project_id = %project_id, program, ?exit_code, "exec finished");
        ExecOutcome {
            output: text,
            error: !output.status.success(),
            cwd,
            exit_code,
        }
    }
}

/// The caller's directory when it is an existing directory inside the sandbox, else the root.
fn effective_cwd(root: &Path, caller_cwd: Option<&str>) -> PathBuf {
    let Some(raw) = caller_cwd.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return root.to_path_buf();
    };

    let candidate = normalize(Path::new(raw));
    if candidate.is_absolute() && is_within(&candidate, root) && candidate.is_dir() {
        candidate
    } else {
        debug!(cwd = raw, root = %root.display(), "resetting invalid exec cwd to project root");
        root.to_path_buf()
    }
}

async fn change_directory(command: &str, cwd: PathBuf, target: PathBuf) -> ExecOutcome {
    match fs::metadata(&target).await {
        Ok(metadata) if metadata.is_dir() => ExecOutcome::ok("", target),
        _ => {
            let shown = shell_words::split(command)
                .ok()
                .and_then(|argv| argv.get(1).cloned())
                .unwrap_or_default();
            ExecOutcome::failed(format!("cd: {shown}: No such directory"), cwd)
        }
    }
}

async fn list_directory(cwd: PathBuf) -> ExecOutcome {
    let mut entries = match fs::read_dir(&cwd).await {
        Ok(entries) => entries,
        Err(err) => return ExecOutcome::failed(format!("ls: {err}"), cwd),
    };

    let mut names = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => names.push(entry.file_name().to_string_lossy().into_owned()),
            Ok(None) => break,
            Err(err) => return ExecOutcome::failed(format!("ls: {err}"), cwd),
        }
    }
    names.sort();

    ExecOutcome::ok(names.join("\n"), cwd)
}
