//! rpc-keeper
//!
//! A client that exposes one long-lived RPC connection to callers and repairs
//! it in the background. See [`connection::ConnectionManager`].

pub mod connection;
pub mod transport;

pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState, LinkStatus, ManagerError};
pub use transport::{Dialer, RpcConnection, RpcError, TcpDialer};
