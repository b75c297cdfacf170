//! Shared identifiers, error taxonomy, and wire protocol for burrow components.

pub mod errors;
pub mod ids;
pub mod paths;
pub mod protocol;

pub use errors::{BurrowError, ErrorCode};
pub use ids::{ConnectionId, ProjectId, ReqId, TerminalId, now_ms};
pub use paths::{default_projects_dir, default_state_dir};
pub use protocol::{
    Event, FileAction, FileMutation, PROTOCOL_VERSION, ProjectInfo, Request, RequestEnvelope,
    Response, ResponseEnvelope, ServerFrame,
};
