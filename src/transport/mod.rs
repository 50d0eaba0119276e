//! Transports the connection manager can drive
//!
//! A transport is a `Dialer` that produces `RpcConnection`s. The TCP
//! transport speaks the length-prefixed frame protocol from the shared crate.

pub mod tcp;
pub mod traits;

pub use tcp::{RpcError, TcpDialer, TcpRpcConnection};
pub use traits::{Dialer, RpcConnection};
