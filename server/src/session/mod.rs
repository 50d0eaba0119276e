//! Session handling for connected RPC clients

mod connection;

pub use connection::RpcSession;
