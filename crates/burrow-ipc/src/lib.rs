//! Length-prefixed CBOR transport between burrow clients and the daemon.
//!
//! Requests flow client to daemon. The daemon answers each one with a
//! response frame and may push event frames at any time on the same socket.

mod error;

pub mod client;
pub mod codec;
pub mod framing;
pub mod server;

pub use client::BurrowClient;
pub use error::IpcError;
pub use server::{Outbound, RequestHandler, serve_unix};
