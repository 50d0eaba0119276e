//! rpc-keeper reference server
//!
//! Answers length-prefixed `RpcRequest` frames with `RpcResponse` frames.
//! Used by the demo binary and by the client's end-to-end tests.

pub mod listener;
pub mod service;
pub mod session;

pub use listener::RpcServer;
pub use service::ServiceRegistry;
pub use session::RpcSession;
