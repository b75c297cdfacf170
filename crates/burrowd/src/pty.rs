use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use burrow_core::{BurrowError, ConnectionId, ErrorCode, Event, ProjectId, TerminalId, now_ms};
use burrow_ipc::Outbound;
use burrow_policy::CommandPolicy;
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tracing::{debug, info, warn};

use crate::line::{Keystrokes, LineBuffer};

/// How long an exited session waits for its reader to flush before reporting exit.
const EXIT_DRAIN: Duration = Duration::from_millis(250);

/// Sent to the shell in place of a refused line's terminator: kill the line, then submit nothing.
const DISCARD_LINE: &[u8] = b"\x15\r";

/// Refusal of a command whose earlier lines the shell already holds: kill the line, then interrupt.
const DISCARD_CONTINUED: &[u8] = b"\x15\x03";

type SessionTable = Arc<Mutex<HashMap<TerminalId, Arc<TerminalSession>>>>;

/// Returns true when a pseudo-terminal can be allocated on this host.
pub fn probe_pty() -> bool {
    match native_pty_system().openpty(pty_size(1, 1)) {
        Ok(pair) => {
            drop(pair);
            true
        }
        Err(err) => {
            warn!(error = %err, "pty backend unavailable");
            false
        }
    }
}

/// Picks the login shell for new terminals: bash when present, else `$SHELL`, else `/bin/sh`.
pub fn default_shell() -> PathBuf {
    let bash = Path::new("/bin/bash");
    if bash.is_file() {
        return bash.to_path_buf();
    }
    std::env::var_os("SHELL")
        .filter(|shell| !shell.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/bin/sh"))
}

/// Live pty-backed shells, each bound to the connection that opened it.
pub struct TerminalManager {
    sessions_dir: PathBuf,
    shell: PathBuf,
    policy: CommandPolicy,
    available: bool,
    sessions: SessionTable,
    next_id: AtomicU64,
}

struct TerminalSession {
    id: TerminalId,
    project_id: ProjectId,
    owner: ConnectionId,
    root: PathBuf,
    scratch: PathBuf,
    outbound: Outbound,
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    line: Mutex<LineBuffer>,
    /// Directory the policy evaluates `cd` against, following allowed `cd` lines.
    cwd: Mutex<PathBuf>,
}

/// Handle returned to the opener of a terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalOpened {
    pub terminal_id: TerminalId,
    pub initial_cwd: PathBuf,
}

impl TerminalManager {
    pub fn new(sessions_dir: PathBuf, shell: PathBuf, policy: CommandPolicy, available: bool) -> Self {
        Self {
            sessions_dir,
            shell,
            policy,
            available,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(now_ms()),
        }
    }

    /// False when the daemon runs without a pty backend and clients must use exec.
    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Spawns a shell rooted at `root` whose output streams to `outbound`.
    pub fn open(
        &self,
        project_id: &ProjectId,
        root: &Path,
        cols: u16,
        rows: u16,
        outbound: Outbound,
    ) -> Result<TerminalOpened, BurrowError> {
        if !self.available {
            return Err(BurrowError::new(
                ErrorCode::BackendUnavailable,
                "interactive terminals are unavailable; use exec instead",
            ));
        }

        let terminal_id = TerminalId(format!(
            "term-{}-{}",
            project_id,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        ));
        let layout = SessionLayout::prepare(&self.sessions_dir, &terminal_id, root)?;

        match self.spawn(&terminal_id, project_id, root, &layout, cols, rows, outbound) {
            Ok(opened) => Ok(opened),
            Err(err) => {
                layout.remove();
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn(
        &self,
        terminal_id: &TerminalId,
        project_id: &ProjectId,
        root: &Path,
        layout: &SessionLayout,
        cols: u16,
        rows: u16,
        outbound: Outbound,
    ) -> Result<TerminalOpened, BurrowError> {
        let pair = native_pty_system()
            .openpty(pty_size(cols, rows))
            .map_err(|err| pty_error(ErrorCode::BackendUnavailable, "open pty", err))?;

        let mut command = CommandBuilder::new(&self.shell);
        for arg in shell_args(&self.shell, layout) {
            command.arg(arg);
        }
        command.cwd(root);
        command.env_clear();
        for (key, value) in build_isolated_env(&self.shell, root, layout) {
            command.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|err| pty_error(ErrorCode::SpawnFailed, "spawn terminal shell", err))?;
        drop(pair.slave);

        let mut killer = child.clone_killer();
        let streams = pair
            .master
            .try_clone_reader()
            .and_then(|reader| pair.master.take_writer().map(|writer| (reader, writer)));
        let (reader, writer) = match streams {
            Ok(streams) => streams,
            Err(err) => {
                let _ = killer.kill();
                return Err(pty_error(ErrorCode::Internal, "attach pty streams", err));
            }
        };

        let session = Arc::new(TerminalSession {
            id: terminal_id.clone(),
            project_id: project_id.clone(),
            owner: outbound.connection(),
            root: root.to_path_buf(),
            scratch: layout.scratch.clone(),
            outbound,
            writer: Mutex::new(writer),
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            line: Mutex::new(LineBuffer::new()),
            cwd: Mutex::new(root.to_path_buf()),
        });

        lock(&self.sessions).insert(terminal_id.clone(), Arc::clone(&session));

        let pumps = spawn_pumps(
            Arc::clone(&self.sessions),
            Arc::clone(&session),
            reader,
            child,
        );
        if let Err(err) = pumps {
            self.destroy(vec![session]);
            return Err(BurrowError::io("start terminal threads", err));
        }

        info!(
            terminal_id = %terminal_id,
            project_id = %project_id,
            owner = %session.owner,
            shell = %self.shell.display(),
            "terminal opened"
        );
        Ok(TerminalOpened {
            terminal_id: terminal_id.clone(),
            initial_cwd: root.to_path_buf(),
        })
    }

    /// Feeds keystrokes through the line policy into the shell.
    pub async fn input(
        &self,
        conn: ConnectionId,
        terminal_id: &TerminalId,
        data: &[u8],
    ) -> Result<(), BurrowError> {
        let session = self.owned(conn, terminal_id)?;
        if data.is_empty() {
            return Ok(());
        }

        let chunks = lock(&session.line).feed(data);
        for chunk in chunks {
            match chunk {
                Keystrokes::Forward(bytes) => write_input(&session, bytes).await?,
                Keystrokes::Submit {
                    line,
                    terminator,
                    continued,
                } => {
                    if let Some(refusal) = session.check_line(&self.policy, &line) {
                        info!(terminal_id = %terminal_id, line = %line, %refusal, "terminal line denied");
                        session
                            .outbound
                            .send(Event::TerminalOutput {
                                terminal_id: terminal_id.clone(),
                                data: format!("\r\nCommand not allowed: {refusal}\r\n").into_bytes(),
                            })
                            .await;
                        let discard = if continued { DISCARD_CONTINUED } else { DISCARD_LINE };
                        write_input(&session, discard.to_vec()).await?;
                    } else {
                        write_input(&session, vec![terminator]).await?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn resize(
        &self,
        conn: ConnectionId,
        terminal_id: &TerminalId,
        cols: u16,
        rows: u16,
    ) -> Result<(), BurrowError> {
        let session = self.owned(conn, terminal_id)?;
        lock(&session.master)
            .resize(pty_size(cols, rows))
            .map_err(|err| pty_error(ErrorCode::Internal, "resize pty", err))
    }

    /// Kills a terminal owned by `conn`. Unknown and foreign ids are ignored.
    pub fn close(&self, conn: ConnectionId, terminal_id: &TerminalId) {
        let removed = {
            let mut sessions = lock(&self.sessions);
            match sessions.get(terminal_id) {
                Some(session) if session.owner == conn => sessions.remove(terminal_id),
                _ => None,
            }
        };
        if let Some(session) = removed {
            self.destroy(vec![session]);
        }
    }

    /// Kills every terminal a departing connection owned.
    pub fn close_connection(&self, conn: ConnectionId) -> usize {
        self.close_matching(|session| session.owner == conn)
    }

    /// Kills every terminal of a retired project.
    pub fn close_project(&self, project_id: &ProjectId) -> usize {
        self.close_matching(|session| &session.project_id == project_id)
    }

    /// Kills all terminals before the daemon exits.
    pub fn shutdown(&self) -> usize {
        self.close_matching(|_| true)
    }

    fn close_matching(&self, predicate: impl Fn(&TerminalSession) -> bool) -> usize {
        let removed: Vec<Arc<TerminalSession>> = {
            let mut sessions = lock(&self.sessions);
            let ids: Vec<TerminalId> = sessions
                .iter()
                .filter(|(_, session)| predicate(session))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        let count = removed.len();
        self.destroy(removed);
        count
    }

    fn destroy(&self, sessions: Vec<Arc<TerminalSession>>) {
        for session in sessions {
            lock(&self.sessions).remove(&session.id);
            session.kill();
            remove_scratch(&session.scratch);
            debug!(terminal_id = %session.id, "terminal closed");
        }
    }

    /// Looks up a session for its owner. Foreign ids look exactly like missing ones.
    fn owned(
        &self,
        conn: ConnectionId,
        terminal_id: &TerminalId,
    ) -> Result<Arc<TerminalSession>, BurrowError> {
        lock(&self.sessions)
            .get(terminal_id)
            .filter(|session| session.owner == conn)
            .cloned()
            .ok_or_else(|| {
                BurrowError::new(
                    ErrorCode::SessionNotFound,
                    format!("terminal {terminal_id} not found"),
                )
            })
    }
}

/// Pty writes can block on a busy shell, so they run off the async workers.
async fn write_input(session: &Arc<TerminalSession>, bytes: Vec<u8>) -> Result<(), BurrowError> {
    let session = Arc::clone(session);
    tokio::task::spawn_blocking(move || session.write(&bytes))
        .await
        .map_err(|err| {
            BurrowError::new(ErrorCode::Internal, "terminal write task failed")
                .with_detail(err.to_string())
        })?
}

impl TerminalSession {
    fn write(&self, bytes: &[u8]) -> Result<(), BurrowError> {
        let mut writer = lock(&self.writer);
        writer
            .write_all(bytes)
            .and_then(|()| writer.flush())
            .map_err(|err| BurrowError::io("write terminal input", err))
    }

    /// Evaluates a finished line, tracking `cd` targets. Returns the refusal text for denied lines.
    fn check_line(&self, policy: &CommandPolicy, line: &str) -> Option<String> {
        let mut cwd = lock(&self.cwd);
        let decision = policy.evaluate(line, &cwd, &self.root);
        if !decision.allowed {
            return Some(
                decision
                    .reason
                    .map(|denial| denial.to_string())
                    .unwrap_or_else(|| "command not allowed".to_string()),
            );
        }

        if let Some(target) = decision.resolved_cwd
            && target.is_dir()
        {
            *cwd = target;
        }
        None
    }

    fn kill(&self) {
        if let Err(err) = lock(&self.killer).kill() {
            debug!(terminal_id = %self.id, error = %err, "terminal kill failed; process likely gone");
        }
    }
}

/// Starts the output reader and the exit waiter for a session.
fn spawn_pumps(
    sessions: SessionTable,
    session: Arc<TerminalSession>,
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
) -> std::io::Result<()> {
    let (drained_tx, drained_rx) = mpsc::channel::<()>();

    let pump = Arc::clone(&session);
    thread::Builder::new()
        .name(format!("burrow-pty-read-{}", session.id))
        .spawn(move || {
            let mut buf = [0_u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        // Keep draining even after the owner leaves so the shell never blocks on output.
                        let _ = pump.outbound.blocking_send(Event::TerminalOutput {
                            terminal_id: pump.id.clone(),
                            data: buf[..n].to_vec(),
                        });
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            let _ = drained_tx.send(());
        })?;

    thread::Builder::new()
        .name(format!("burrow-pty-wait-{}", session.id))
        .spawn(move || {
            let status = child.wait();
            let _ = drained_rx.recv_timeout(EXIT_DRAIN);

            let (exit_code, signal) = match status {
                Ok(status) => (
                    Some(status.exit_code()),
                    status.signal().map(str::to_string),
                ),
                Err(err) => {
                    warn!(terminal_id = %session.id, error = %err, "waiting on terminal shell failed");
                    (None, None)
                }
            };

            let delivered = session.outbound.blocking_send(Event::TerminalExit {
                terminal_id: session.id.clone(),
                exit_code,
                signal: signal.clone(),
            });

            lock(&sessions).remove(&session.id);
            remove_scratch(&session.scratch);
            info!(
                terminal_id = %session.id,
                ?exit_code,
                ?signal,
                delivered,
                "terminal exited"
            );
        })?;

    Ok(())
}

/// Per-session scratch directory holding the shell rc and `TMPDIR`.
struct SessionLayout {
    scratch: PathBuf,
    tmp: PathBuf,
    bash_rc: PathBuf,
}

impl SessionLayout {
    fn prepare(
        sessions_dir: &Path,
        terminal_id: &TerminalId,
        root: &Path,
    ) -> Result<Self, BurrowError> {
        let scratch = sessions_dir.join(&terminal_id.0);
        let tmp = scratch.join("tmp");
        let bash_rc = scratch.join("bashrc");

        fs::create_dir_all(&tmp)
            .map_err(|err| BurrowError::io("create terminal scratch directory", err))?;
        fs::write(&bash_rc, render_bash_rc(root))
            .map_err(|err| BurrowError::io("write terminal rc", err))?;

        Ok(Self {
            scratch,
            tmp,
            bash_rc,
        })
    }

    fn remove(&self) {
        remove_scratch(&self.scratch);
    }
}

fn remove_scratch(path: &Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove terminal scratch directory"),
    }
}

fn shell_args(shell: &Path, layout: &SessionLayout) -> Vec<String> {
    match shell_name(shell).as_deref() {
        Some("bash") => vec![
            "--noprofile".to_string(),
            "--noediting".to_string(),
            "--rcfile".to_string(),
            layout.bash_rc.to_string_lossy().into_owned(),
            "-i".to_string(),
        ],
        _ => vec!["-i".to_string()],
    }
}

fn shell_name(shell: &Path) -> Option<String> {
    shell
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.to_ascii_lowercase())
}

/// Builds the shell environment from scratch rather than inheriting the daemon's.
fn build_isolated_env(shell: &Path, root: &Path, layout: &SessionLayout) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    for key in ["PATH", "LANG"] {
        if let Ok(value) = std::env::var(key) {
            env.insert(key.to_string(), value);
        }
    }

    let root = root.display().to_string();
    let tmp = layout.tmp.display().to_string();
    env.insert("TERM".to_string(), "xterm-256color".to_string());
    env.insert("HOME".to_string(), root.clone());
    env.insert("PWD".to_string(), root.clone());
    env.insert("BURROW_ROOT".to_string(), root);
    env.insert("USER".to_string(), "sandbox".to_string());
    env.insert("LOGNAME".to_string(), "sandbox".to_string());
    env.insert("SHELL".to_string(), shell.display().to_string());
    env.insert("HISTFILE".to_string(), "/dev/null".to_string());
    env.insert("HISTSIZE".to_string(), "0".to_string());
    env.insert("TMPDIR".to_string(), format!("{tmp}/"));
    env.insert("TMP".to_string(), tmp.clone());
    env.insert("TEMP".to_string(), tmp);

    env
}

/// Shell-side confinement: `cd` and the prompt hook keep the shell inside the project.
fn render_bash_rc(root: &Path) -> String {
    let root = shell_single_quote(root.to_string_lossy().as_ref());
    format!(
        r#"
readonly BURROW_ROOT='{root}'
builtin cd "$BURROW_ROOT" 2>/dev/null || true
stty sane 2>/dev/null || true
stty erase '^?' werase '^W' kill '^U' -iutf8 2>/dev/null || true
set +o history
enable -n pushd popd 2>/dev/null || true
cd() {{
  local target="${{1:-$BURROW_ROOT}}"
  if ! builtin cd -- "$target" 2>/dev/null; then
    printf 'cd: %s: No such directory\n' "$target" >&2
    return 1
  fi
  case "$(pwd -P)/" in
    "$BURROW_ROOT"/*) return 0 ;;
  esac
  builtin cd -- "$BURROW_ROOT"
  printf 'cd: cannot navigate outside of project directory\n' >&2
  return 1
}}
readonly -f cd
PROMPT_COMMAND='case "$(pwd -P)/" in "$BURROW_ROOT"/*) ;; *) builtin cd "$BURROW_ROOT" ;; esac'
readonly PROMPT_COMMAND
PS1='\W\$ '
"#
    )
}

fn shell_single_quote(value: &str) -> String {
    value.replace('\'', r#"'\''"#)
}

/// Rejects `--shell` values that cannot be executed.
pub fn validate_shell(shell: &Path) -> Result<(), BurrowError> {
    let metadata = fs::metadata(shell).map_err(|err| {
        BurrowError::new(ErrorCode::InvalidRequest, "shell path is invalid")
            .with_detail(format!("{}: {err}", shell.display()))
    })?;

    if !metadata.is_file() {
        return Err(
            BurrowError::new(ErrorCode::InvalidRequest, "shell path is not a regular file")
                .with_detail(shell.display().to_string()),
        );
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(
                BurrowError::new(ErrorCode::InvalidRequest, "shell path is not executable")
                    .with_detail(shell.display().to_string()),
            );
        }
    }

    Ok(())
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows: rows.max(1),
        cols: cols.max(1),
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn pty_error(code: ErrorCode, action: &str, err: impl std::fmt::Display) -> BurrowError {
    BurrowError::new(code, action).with_detail(err.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
