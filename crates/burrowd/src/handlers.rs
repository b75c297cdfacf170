use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use burrow_core::{
    BurrowError, ConnectionId, ErrorCode, FileMutation, PROTOCOL_VERSION, ProjectId, ProjectInfo,
    Request, Response,
};
use burrow_ipc::Outbound;
use tracing::{info, warn};

use crate::{
    exec::FallbackExecutor, ports::PortRegistry, pty::TerminalManager, state::StateStore,
    sync::BroadcastSync,
};

/// Routes typed requests to the daemon's components.
pub struct Handler {
    state: Arc<StateStore>,
    ports: Arc<PortRegistry>,
    executor: Arc<FallbackExecutor>,
    terminals: Arc<TerminalManager>,
    sync: Arc<BroadcastSync>,
    connections: Mutex<HashMap<ConnectionId, Outbound>>,
}

impl Handler {
    pub fn new(
        state: Arc<StateStore>,
        ports: Arc<PortRegistry>,
        executor: Arc<FallbackExecutor>,
        terminals: Arc<TerminalManager>,
        sync: Arc<BroadcastSync>,
    ) -> Self {
        Self {
            state,
            ports,
            executor,
            terminals,
            sync,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn terminals(&self) -> &Arc<TerminalManager> {
        &self.terminals
    }

    /// Remembers how to reach a new connection with events.
    pub fn register(&self, outbound: Outbound) {
        self.lock_connections()
            .insert(outbound.connection(), outbound);
    }

    /// Releases everything a departed connection held.
    pub fn unregister(&self, conn: ConnectionId) {
        self.lock_connections().remove(&conn);
        self.sync.hub().drop_connection(conn);
        let closed = self.terminals.close_connection(conn);
        if closed > 0 {
            info!(%conn, closed, "closed terminals of departed connection");
        }
    }

    pub async fn handle(&self, conn: ConnectionId, request: Request) -> Response {
        let result = match request {
            Request::Version {} => Ok(Response::Version {
                daemon: env!("CARGO_PKG_VERSION").to_string(),
                protocol: PROTOCOL_VERSION,
            }),
            Request::Health {} => Ok(Response::Health {
                status: "ok".to_string(),
                pty_available: self.terminals.is_available(),
            }),
            Request::ProjectJoin { project_id } => self.join(conn, project_id).await,
            Request::ProjectLeave { project_id } => {
                self.sync.hub().leave(&project_id, conn);
                Ok(Response::ProjectLeft { project_id })
            }
            Request::ProjectRetire { project_id } => self.retire(project_id).await,
            Request::TerminalOpen {
                project_id,
                cols,
                rows,
            } => self.open_terminal(conn, &project_id, cols, rows),
            Request::TerminalInput { terminal_id, data } => self
                .terminals
                .input(conn, &terminal_id, &data)
                .await
                .map(|()| Response::TerminalAck { terminal_id }),
            Request::TerminalResize {
                terminal_id,
                cols,
                rows,
            } => self
                .terminals
                .resize(conn, &terminal_id, cols, rows)
                .map(|()| Response::TerminalAck { terminal_id }),
            Request::TerminalClose { terminal_id } => {
                self.terminals.close(conn, &terminal_id);
                Ok(Response::TerminalAck { terminal_id })
            }
            Request::Exec {
                project_id,
                command,
                cwd,
            } => self
                .executor
                .execute(&project_id, command.as_deref(), cwd.as_deref())
                .await
                .map(|outcome| Response::ExecResult {
                    output: outcome.output,
                    error: outcome.error,
                    cwd: outcome.cwd.display().to_string(),
                    exit_code: outcome.exit_code,
                }),
            Request::PortAssign { project_id } => self.assign_port(project_id).await,
            Request::PortGet { project_id } => {
                let port = self.ports.port_of(&project_id).await;
                Ok(Response::Port { project_id, port })
            }
            Request::PortRelease { project_id } => self
                .ports
                .release(&project_id)
                .await
                .map(|()| Response::PortReleased { project_id }),
            Request::FileUpdate {
                project_id,
                mutation,
            } => self.update_file(conn, project_id, mutation).await,
        };

        match result {
            Ok(response) => response,
            Err(err) => to_error_response(err),
        }
    }

    async fn join(&self, conn: ConnectionId, project_id: ProjectId) -> Result<Response, BurrowError> {
        let root = self.state.project_root(&project_id)?;
        let outbound = self.outbound(conn)?;
        self.sync.hub().join(&project_id, outbound);

        let assigned_port = self.ports.port_of(&project_id).await;
        Ok(Response::ProjectJoined {
            project: ProjectInfo {
                id: project_id,
                root_dir: root.display().to_string(),
                assigned_port,
            },
            pty_available: self.terminals.is_available(),
        })
    }

    /// Tears down live state of a project whose files are going away.
    async fn retire(&self, project_id: ProjectId) -> Result<Response, BurrowError> {
        if !project_id.is_well_formed() {
            return Err(BurrowError::new(
                ErrorCode::InvalidRequest,
                "project id is malformed",
            ));
        }

        let terminals = self.terminals.close_project(&project_id);
        self.ports.release(&project_id).await?;
        self.sync.hub().drop_project(&project_id);
        info!(project_id = %project_id, terminals, "retired project");
        Ok(Response::ProjectRetired { project_id })
    }

    fn open_terminal(
        &self,
        conn: ConnectionId,
        project_id: &ProjectId,
        cols: u16,
        rows: u16,
    ) -> Result<Response, BurrowError> {
        let root = self.state.project_root(project_id)?;
        let outbound = self.outbound(conn)?;
        let opened = self.terminals.open(project_id, &root, cols, rows, outbound)?;
        Ok(Response::TerminalOpened {
            terminal_id: opened.terminal_id,
            initial_cwd: opened.initial_cwd.display().to_string(),
        })
    }

    async fn assign_port(&self, project_id: ProjectId) -> Result<Response, BurrowError> {
        self.state.project_root(&project_id)?;
        let port = self.ports.assign(&project_id).await?;
        Ok(Response::Port {
            project_id,
            port: Some(port),
        })
    }

    async fn update_file(
        &self,
        conn: ConnectionId,
        project_id: ProjectId,
        mutation: FileMutation,
    ) -> Result<Response, BurrowError> {
        let root = self.state.project_root(&project_id)?;
        let file_path = mutation.file_path.clone();
        self.sync.apply(&project_id, &root, conn, mutation).await?;
        Ok(Response::FileApplied {
            project_id,
            file_path,
        })
    }

    fn outbound(&self, conn: ConnectionId) -> Result<Outbound, BurrowError> {
        self.lock_connections().get(&conn).cloned().ok_or_else(|| {
            warn!(%conn, "request from unregistered connection");
            BurrowError::new(ErrorCode::Internal, "connection is not registered")
        })
    }

    fn lock_connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Outbound>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn to_error_response(err: BurrowError) -> Response {
    Response::Error {
        code: err.code,
        message: err.message,
        detail: err.detail,
    }
}
