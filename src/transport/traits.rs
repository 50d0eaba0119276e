//! Transport trait abstraction for pluggable RPC backends

use async_trait::async_trait;
use prost::Message;

/// A live request/response session bound to one target address
#[async_trait]
pub trait RpcConnection: Send + 'static {
    /// Error produced by a single call (network, remote-side, or encoding)
    type Error: std::error::Error + Send + Sync + 'static;

    /// Invoke `method` with `request` and wait for the reply
    async fn call<Req, Resp>(&mut self, method: &str, request: &Req) -> Result<Resp, Self::Error>
    where
        Req: Message,
        Resp: Message + Default;
}

/// Factory for creating RPC connections
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// The connection type this dialer produces
    type Connection: RpcConnection;

    /// Error produced by a failed dial
    type Error: std::error::Error + Send + Sync + 'static;

    /// Attempt to connect to `address`, returning a connection on success
    async fn dial(&self, address: &str) -> Result<Self::Connection, Self::Error>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
