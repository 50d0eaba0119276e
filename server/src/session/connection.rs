//! Individual client session handling

use crate::service::ServiceRegistry;
use anyhow::Result;
use rpc_keeper_shared::{
    codec::{self, FrameDecoder},
    RpcRequest,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One accepted client connection
///
/// Requests are answered in order; the client sends one and waits for the
/// reply before the next.
pub struct RpcSession {
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<ServiceRegistry>,
    decoder: FrameDecoder<RpcRequest>,
    read_buf: Vec<u8>,
    served: u64,
}

impl RpcSession {
    pub fn new(stream: TcpStream, addr: SocketAddr, registry: Arc<ServiceRegistry>) -> Self {
        Self {
            stream,
            addr,
            registry,
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; 4096],
            served: 0,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve requests until the client disconnects or `shutdown` fires
    ///
    /// Returns the number of requests answered.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<u64> {
        loop {
            let n = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Closing session {} after {} request(s)", self.addr, self.served);
                    return Ok(self.served);
                }
                result = self.stream.read(&mut self.read_buf) => result?,
            };

            if n == 0 {
                debug!("Client disconnected: {}", self.addr);
                return Ok(self.served);
            }
            self.decoder.extend(&self.read_buf[..n]);

            // Process all complete frames
            while let Some(request) = self.decoder.decode_next()? {
                let response = self.registry.dispatch(&request);
                if response.is_error() {
                    debug!(
                        "[{}] seq={} {} failed: {}",
                        self.addr, request.seq, request.method, response.error
                    );
                }
                self.stream.write_all(&codec::encode(&response)?).await?;
                self.served += 1;
            }
        }
    }
}
