//! Allow/deny decisions for untrusted command lines confined to a sandbox root.

pub mod paths;
pub mod policy;

pub use paths::{is_absolute_like, is_within, normalize, resolve_within};
pub use policy::{CommandDecision, CommandPolicy, Denial};
