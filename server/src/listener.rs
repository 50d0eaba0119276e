//! TCP accept loop for the reference server

use crate::service::ServiceRegistry;
use crate::session::RpcSession;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Accepts clients and runs one session task per connection
pub struct RpcServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<ServiceRegistry>,
}

impl RpcServer {
    /// Bind the listening socket; `addr` may use port 0
    pub async fn bind(addr: &str, registry: ServiceRegistry) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            registry: Arc::new(registry),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` fires, then close every session
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            "RPC server listening on {} (methods: {})",
            self.local_addr,
            self.registry.methods().join(", ")
        );

        let mut sessions = JoinSet::new();

        loop {
            let (socket, addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(_) = sessions.join_next() => continue,
                accepted = self.listener.accept() => accepted?,
            };
            let session = RpcSession::new(socket, addr, self.registry.clone());
            info!("Connection from: {}", session.addr());

            let token = shutdown.child_token();
            sessions.spawn(async move {
                match session.run(token).await {
                    Ok(served) => info!("Session {} closed after {} request(s)", addr, served),
                    Err(e) => warn!("Session {} failed: {}", addr, e),
                }
            });
        }

        // Stop accepting before waiting for sessions to wind down
        drop(self.listener);
        while sessions.join_next().await.is_some() {}

        info!("RPC server on {} stopped", self.local_addr);
        Ok(())
    }
}
