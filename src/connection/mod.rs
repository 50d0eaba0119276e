//! Connection management for a single long-lived RPC link
//!
//! This module handles:
//! - Serializing every call through one connection
//! - Periodic health probes on that connection
//! - Replacing the connection when a probe fails, retrying until it works

mod manager;
mod state;

pub use manager::{CallError, ConnectionConfig, ConnectionManager, ManagerError};
pub use state::{ConnectionState, LinkEvent, LinkStateMachine, LinkStatus, TransitionResult};
