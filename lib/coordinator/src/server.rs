use crate::core::CoordinatorRef;
use crate::handler::ConnectionHandler;
use anyhow::{Context, Result};
use dashmap::DashMap;
use protocol::{Codec, JsonCodec};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

/// Per-process connection counter; ids never repeat for the life of the
/// server, so a reconnecting peer gets a fresh identity.
pub type ConnectionId = u64;

pub type TcServerRef = Arc<TcServer>;

/// The coordinator's TCP front end: one accept loop, one handler task per
/// connection.
pub struct TcServer {
    coordinator: CoordinatorRef,
    connections: Arc<DashMap<ConnectionId, SocketAddr>>,
    next_connection_id: AtomicU64,
    codec: Arc<dyn Codec>,
}

impl TcServer {
    pub fn new(coordinator: CoordinatorRef) -> TcServerRef {
        Arc::new(Self {
            coordinator,
            connections: Arc::new(DashMap::new()),
            next_connection_id: AtomicU64::new(0),
            codec: Arc::new(JsonCodec),
        })
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    pub async fn accept_connections(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        while let Ok((socket, addr)) = listener.accept().await {
            let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
            self.connections.insert(connection_id, addr);
            info!(connection_id, peer = %addr, "client connected");

            let handler = ConnectionHandler::new(
                connection_id,
                socket,
                self.coordinator.clone(),
                self.connections.clone(),
                self.codec.clone(),
            );

            tokio::spawn(async move {
                if let Err(e) = handler.handle_connection().await {
                    error!(connection_id, "connection error: {:?}", e);
                }
            });
        }

        Ok(())
    }

    /// Binds the configured endpoint and serves until ctrl-c. Clients dial
    /// the advertised `server.port`, so a busy port is a hard startup error,
    /// never something to silently work around.
    pub async fn run(self: Arc<Self>, address: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("failed to bind coordinator endpoint {}", address))?;
        info!("Coordinator listening on {}", address);

        tokio::select! {
            result = self.clone().accept_connections(listener) => {
                if let Err(e) = result {
                    error!("Error accepting connections: {}", e);
                }
            }
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received, terminating coordinator...");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Coordinator;
    use common::TxConfig;
    use resource::dispatch::BranchDispatcher;
    use std::time::Duration;
    use store::{LockManager, MemoryStore};

    fn test_server() -> TcServerRef {
        let config = TxConfig::default();
        let dispatcher = BranchDispatcher::shared(config.retry().clone());
        TcServer::new(Coordinator::shared(
            config,
            MemoryStore::shared(),
            LockManager::shared(),
            dispatcher,
        ))
    }

    async fn wait_for_connections(server: &TcServer, expected: usize) {
        for _ in 0..100 {
            if server.active_connections() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.active_connections(), expected);
    }

    #[tokio::test]
    async fn connections_are_tracked_until_the_peer_leaves() {
        let server = test_server();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.clone().accept_connections(listener));

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        wait_for_connections(&server, 1).await;

        drop(stream);
        wait_for_connections(&server, 0).await;
    }

    #[tokio::test]
    async fn busy_port_fails_startup_instead_of_moving() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = holder.local_addr().unwrap();

        let err = test_server().run(taken).await.unwrap_err();
        assert!(err.to_string().contains("failed to bind"));
    }
}
