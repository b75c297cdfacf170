use std::{ops::RangeInclusive, path::PathBuf, sync::Arc, time::Duration};

use burrow_core::{BurrowError, default_projects_dir, default_state_dir};
use burrow_policy::CommandPolicy;
use tracing::info;

use crate::{
    exec::{DEFAULT_EXEC_TIMEOUT, FallbackExecutor},
    handlers::Handler,
    ports::{DEFAULT_PORT_RANGE, PortProbe, PortRegistry, TcpProbe},
    pty::{TerminalManager, default_shell, probe_pty, validate_shell},
    state::StateStore,
    sync::{BroadcastSync, ProjectHub},
};

/// Everything needed to wire the daemon's components together.
#[derive(Clone)]
pub struct DaemonConfig {
    pub state_dir: PathBuf,
    pub projects_dir: PathBuf,
    pub port_range: RangeInclusive<u16>,
    pub exec_timeout: Duration,
    pub shell: Option<PathBuf>,
    /// Skip the pty probe and run without interactive terminals.
    pub disable_pty: bool,
    pub probe: Arc<dyn PortProbe>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            projects_dir: default_projects_dir(),
            port_range: DEFAULT_PORT_RANGE,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            shell: None,
            disable_pty: false,
            probe: Arc::new(TcpProbe),
        }
    }
}

impl DaemonConfig {
    pub fn build(self) -> Result<Handler, BurrowError> {
        let state = Arc::new(StateStore::new(self.state_dir, self.projects_dir)?);

        let shell = match self.shell {
            Some(shell) => {
                validate_shell(&shell)?;
                shell
            }
            None => default_shell(),
        };
        let pty_available = !self.disable_pty && probe_pty();

        let policy = CommandPolicy::default();
        let hub = Arc::new(ProjectHub::new());
        let ports = Arc::new(PortRegistry::open(
            state.port_table_path(),
            self.port_range,
            self.probe,
        )?);
        let executor = Arc::new(FallbackExecutor::new(
            Arc::clone(&state),
            policy.clone(),
            Arc::clone(&hub),
            self.exec_timeout,
        ));
        let terminals = Arc::new(TerminalManager::new(
            state.sessions_dir(),
            shell.clone(),
            policy,
            pty_available,
        ));
        let sync = Arc::new(BroadcastSync::new(hub));

        info!(
            state_dir = %state.state_dir().display(),
            projects_dir = %state.projects_dir().display(),
            ports = ?ports.range(),
            shell = %shell.display(),
            pty_available,
            "daemon components ready"
        );

        Ok(Handler::new(state, ports, executor, terminals, sync))
    }
}
