//! rpc-keeper shared protocol types
//!
//! This crate provides the wire messages and frame codec used between the
//! rpc-keeper client transport and the reference server.

pub mod codec;

/// Protocol messages
///
/// Hand-written prost messages; the field tags are the wire contract.
pub mod proto {
    /// A single remote call
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct RpcRequest {
        /// Client-assigned sequence number, echoed in the response
        #[prost(uint64, tag = "1")]
        pub seq: u64,
        /// Remote method name, e.g. `Echo.Echo`
        #[prost(string, tag = "2")]
        pub method: String,
        /// Encoded request message
        #[prost(bytes = "vec", tag = "3")]
        pub body: Vec<u8>,
    }

    /// Reply to a single remote call
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct RpcResponse {
        #[prost(uint64, tag = "1")]
        pub seq: u64,
        /// Encoded reply message (empty on error)
        #[prost(bytes = "vec", tag = "2")]
        pub body: Vec<u8>,
        /// Remote-side error text; empty means success
        #[prost(string, tag = "3")]
        pub error: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct EchoRequest {
        #[prost(string, tag = "1")]
        pub text: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct EchoReply {
        #[prost(string, tag = "1")]
        pub text: String,
    }
}

// Re-export commonly used types at crate root
pub use proto::*;

/// Well-known method names served by the reference server
pub mod methods {
    /// Liveness probe; empty request and reply
    pub const HEALTH_PING: &str = "Health.Ping";

    /// Returns the request text unchanged
    pub const ECHO: &str = "Echo.Echo";
}

/// Timing defaults for the connection manager and transport
pub mod defaults {
    /// Interval between health probes while the connection is healthy
    pub const PROBE_INTERVAL_SECS: u64 = 120;

    /// Wait between redial attempts during a reconnection episode
    pub const RECONNECT_DELAY_SECS: u64 = 60;

    /// Upper bound on a single TCP dial
    pub const CONNECT_TIMEOUT_MS: u64 = 5000;

    /// Default server listen / client target address
    pub const ADDRESS: &str = "127.0.0.1:7070";
}

impl RpcRequest {
    /// Build a request frame around an already-encoded body
    pub fn new(seq: u64, method: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            seq,
            method: method.into(),
            body,
        }
    }
}

impl RpcResponse {
    /// Create a successful response
    pub fn ok(seq: u64, body: Vec<u8>) -> Self {
        Self {
            seq,
            body,
            error: String::new(),
        }
    }

    /// Create a failed response carrying the remote error text
    pub fn failed(seq: u64, error: impl Into<String>) -> Self {
        Self {
            seq,
            body: Vec::new(),
            error: error.into(),
        }
    }

    /// Check whether the remote side reported an error
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

impl EchoRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}
