use serde::{Deserialize, Serialize};

use crate::{ErrorCode, ProjectId, ReqId, TerminalId};

/// Wire protocol version expected by current binaries.
pub const PROTOCOL_VERSION: u32 = 1;

/// Request envelope carrying metadata plus a typed request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope<T> {
    /// Client-generated request identifier.
    pub req_id: ReqId,
    /// Typed request payload.
    pub body: T,
}

/// Response envelope carrying metadata plus a typed response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope<T> {
    /// Request identifier echoed from the request envelope.
    pub req_id: ReqId,
    /// Typed response payload.
    pub body: T,
}

/// One frame written by the daemon: either a reply or an unsolicited event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    Response(ResponseEnvelope<Response>),
    Event(Event),
}

/// Metadata for a project the caller has joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    /// Project identifier.
    pub id: ProjectId,
    /// Absolute sandbox root.
    pub root_dir: String,
    /// Dev-server port currently recorded for the project.
    pub assigned_port: Option<u16>,
}

/// Kind of change carried by a file mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    /// A new file or folder appeared.
    Create,
    /// Existing file content was replaced.
    #[default]
    Update,
}

/// A file or folder change relative to a project's sandbox root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMutation {
    /// Path relative to the sandbox root.
    pub file_path: String,
    /// New file content; ignored for folders.
    #[serde(default)]
    pub content: Option<String>,
    /// True when the mutation targets a directory.
    #[serde(default)]
    pub is_folder: bool,
    #[serde(default)]
    pub action: FileAction,
}

/// RPC request variants supported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Returns daemon and protocol version metadata.
    Version {},
    /// Returns liveness status and backend capabilities.
    Health {},
    /// Subscribes the connection to a project's file broadcasts.
    ProjectJoin { project_id: ProjectId },
    /// Removes a project subscription.
    ProjectLeave { project_id: ProjectId },
    /// Tears down all live state of a deleted project.
    ProjectRetire { project_id: ProjectId },
    /// Opens an interactive terminal rooted at the project sandbox.
    TerminalOpen {
        project_id: ProjectId,
        /// Initial terminal columns.
        cols: u16,
        /// Initial terminal rows.
        rows: u16,
    },
    /// Sends raw keystrokes to a terminal owned by this connection.
    TerminalInput {
        terminal_id: TerminalId,
        data: Vec<u8>,
    },
    /// Resizes a terminal owned by this connection.
    TerminalResize {
        terminal_id: TerminalId,
        cols: u16,
        rows: u16,
    },
    /// Closes a terminal owned by this connection.
    TerminalClose { terminal_id: TerminalId },
    /// Runs one stateless command in the project sandbox.
    Exec {
        project_id: ProjectId,
        /// Raw command line; absent commands are rejected.
        command: Option<String>,
        /// Working directory returned by the previous call.
        cwd: Option<String>,
    },
    /// Returns the project's dev-server port, assigning one if needed.
    PortAssign { project_id: ProjectId },
    /// Returns the recorded port without probing or assigning.
    PortGet { project_id: ProjectId },
    /// Forgets the project's port assignment.
    PortRelease { project_id: ProjectId },
    /// Applies a file mutation and notifies other project subscribers.
    FileUpdate {
        project_id: ProjectId,
        mutation: FileMutation,
    },
}

/// RPC response variants returned by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Protocol version details.
    Version { daemon: String, protocol: u32 },
    /// Service health result.
    Health {
        status: String,
        /// False when interactive terminals are disabled and clients must use exec.
        pty_available: bool,
    },
    ProjectJoined {
        project: ProjectInfo,
        pty_available: bool,
    },
    ProjectLeft { project_id: ProjectId },
    ProjectRetired { project_id: ProjectId },
    /// Terminal open acknowledgment.
    TerminalOpened {
        terminal_id: TerminalId,
        /// Directory the shell starts in.
        initial_cwd: String,
    },
    /// Terminal input, resize, or close acknowledgment.
    TerminalAck { terminal_id: TerminalId },
    /// Outcome of a stateless command.
    ExecResult {
        /// Combined stdout and stderr text.
        output: String,
        /// True for policy refusals, failures, and non-zero exits.
        error: bool,
        /// Working directory the caller must send with its next command.
        cwd: String,
        /// Process exit code when a process ran to completion.
        exit_code: Option<i32>,
    },
    /// Current port for a project.
    Port {
        project_id: ProjectId,
        port: Option<u16>,
    },
    PortReleased { project_id: ProjectId },
    /// File mutation acknowledgment.
    FileApplied {
        project_id: ProjectId,
        file_path: String,
    },
    /// Structured error response.
    Error {
        /// High-level error category.
        code: ErrorCode,
        /// Human-readable summary.
        message: String,
        /// Optional extended context.
        detail: Option<String>,
    },
}

/// Unsolicited notifications pushed to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Raw bytes emitted by a terminal, in emission order.
    TerminalOutput {
        terminal_id: TerminalId,
        data: Vec<u8>,
    },
    /// Terminal process ended; the id is no longer valid.
    TerminalExit {
        terminal_id: TerminalId,
        exit_code: Option<u32>,
        signal: Option<String>,
    },
    /// Another participant changed a file in a joined project.
    FileUpdated {
        project_id: ProjectId,
        mutation: FileMutation,
    },
}
