//! The burrow daemon: project sandboxes, interactive terminals, one-shot
//! command execution, dev-server port assignment, and file broadcasts.

pub mod config;
pub mod dispatch;
pub mod exec;
pub mod handlers;
pub mod line;
pub mod ports;
pub mod pty;
pub mod state;
pub mod sync;

pub use config::DaemonConfig;
pub use dispatch::DaemonDispatcher;
pub use handlers::Handler;
