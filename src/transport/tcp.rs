//! TCP transport speaking length-prefixed request/response frames

use crate::transport::traits::{Dialer, RpcConnection};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use prost::Message;
use rpc_keeper_shared::{
    codec::{self, CodecError, FrameDecoder},
    defaults, RpcRequest, RpcResponse,
};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Errors produced by the TCP transport
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Connect to {address} timed out after {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },

    #[error("Server closed connection")]
    ConnectionClosed,

    #[error("Unexpected response sequence: expected {expected}, got {got}")]
    UnexpectedSequence { expected: u64, got: u64 },

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Reply decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// One TCP session to an RPC server
///
/// A call dropped part way through leaves the stream usable: unsent frame
/// bytes stay in `outbound` and go out ahead of the next request, and the
/// orphaned reply is skipped by sequence number.
pub struct TcpRpcConnection {
    stream: TcpStream,
    peer: String,
    decoder: FrameDecoder<RpcResponse>,
    read_buf: Vec<u8>,
    /// Encoded request bytes not yet accepted by the socket
    outbound: BytesMut,
    next_seq: u64,
}

impl TcpRpcConnection {
    pub fn new(stream: TcpStream, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; 4096],
            outbound: BytesMut::new(),
            next_seq: 0,
        }
    }

    /// Address this connection was dialed with
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Bytes of an interrupted write still waiting to be sent
    pub fn pending_write_len(&self) -> usize {
        self.outbound.len()
    }

    /// Write out everything in `outbound`; progress survives cancellation
    async fn flush_outbound(&mut self) -> Result<(), RpcError> {
        while self.outbound.has_remaining() {
            let n = self.stream.write_buf(&mut self.outbound).await?;
            if n == 0 {
                return Err(RpcError::Io(std::io::ErrorKind::WriteZero.into()));
            }
        }
        Ok(())
    }

    async fn read_response(&mut self) -> Result<RpcResponse, RpcError> {
        loop {
            if let Some(response) = self.decoder.decode_next()? {
                return Ok(response);
            }

            let n = self.stream.read(&mut self.read_buf).await?;
            if n == 0 {
                return Err(RpcError::ConnectionClosed);
            }
            self.decoder.extend(&self.read_buf[..n]);
        }
    }
}

#[async_trait]
impl RpcConnection for TcpRpcConnection {
    type Error = RpcError;

    async fn call<Req, Resp>(&mut self, method: &str, request: &Req) -> Result<Resp, Self::Error>
    where
        Req: Message,
        Resp: Message + Default,
    {
        self.next_seq += 1;
        let seq = self.next_seq;

        let frame = codec::encode(&RpcRequest::new(seq, method, request.encode_to_vec()))?;
        self.outbound.extend_from_slice(&frame);
        self.flush_outbound().await?;

        loop {
            let response = self.read_response().await?;

            // A reply to an abandoned earlier call may still be in flight
            if response.seq < seq {
                debug!("Discarding stale response seq={} (waiting for {})", response.seq, seq);
                continue;
            }
            if response.seq != seq {
                return Err(RpcError::UnexpectedSequence {
                    expected: seq,
                    got: response.seq,
                });
            }
            if response.is_error() {
                return Err(RpcError::Remote(response.error));
            }

            return Ok(Resp::decode(response.body.as_slice())?);
        }
    }
}

/// TCP dialer with a bounded connect time
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_millis(defaults::CONNECT_TIMEOUT_MS),
        }
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Connection = TcpRpcConnection;
    type Error = RpcError;

    async fn dial(&self, address: &str) -> Result<Self::Connection, Self::Error> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| RpcError::ConnectTimeout {
                address: address.to_string(),
                timeout: self.connect_timeout,
            })??;
        stream.set_nodelay(true)?;

        Ok(TcpRpcConnection::new(stream, address))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}
