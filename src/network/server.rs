use crate::config::Settings;
use crate::network::registry::{PeerHandle, PeerRegistry};
use crate::network::wire;
use crate::{PeerdropError, Result};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The rendezvous point: tracks connected peers and answers discovery
/// requests. File bytes never pass through here.
pub struct RendezvousServer {
    settings: Arc<Settings>,
    registry: Arc<PeerRegistry>,
    shutdown: CancellationToken,
}

impl RendezvousServer {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            registry: Arc::new(PeerRegistry::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.registry.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(&self) -> Result<()> {
        let bind_addr = self.settings.server_bind_address();
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| PeerdropError::Connection(format!("Failed to bind {}: {}", bind_addr, e)))?;
        info!("Rendezvous server listening on {}", bind_addr);
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener. Each connection gets its
    /// own task; a failing session never takes the loop down with it.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Rendezvous server shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        // The remote endpoint string is the peer's identity,
                        // registered before the session answers anything --
                        // so a peer sees itself in its own listing.
                        let peer_id = addr.to_string();
                        let session_token = self.shutdown.child_token();
                        self.registry
                            .register(&peer_id, PeerHandle::new(session_token.clone()))
                            .await;

                        let registry = self.registry.clone();
                        tokio::spawn(async move {
                            let result = tokio::select! {
                                _ = session_token.cancelled() => Ok(()),
                                r = handle_session(stream, &peer_id, &registry) => r,
                            };
                            // runs on every exit path, so the listing never
                            // carries a closed connection
                            registry.remove(&peer_id).await;
                            match result {
                                Ok(()) => debug!("Session with {} ended", peer_id),
                                Err(e) => warn!("Session with {} ended with error: {}", peer_id, e),
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                    }
                }
            }
        }

        self.registry.shutdown().await;
        Ok(())
    }
}

/// Per-connection request loop: answer discovery requests until the peer
/// hangs up. Anything other than the discovery token closes the session
/// with a protocol error rather than being silently ignored.
async fn handle_session(
    stream: TcpStream,
    peer_id: &str,
    registry: &PeerRegistry,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader: BufReader<OwnedReadHalf> = BufReader::new(read_half);

    loop {
        match wire::read_line(&mut reader).await? {
            None => {
                debug!("Peer {} disconnected", peer_id);
                return Ok(());
            }
            Some(line) if line == wire::DISCOVERY_REQUEST => {
                let listing = wire::join_peer_list(&registry.snapshot().await);
                debug!("Discovery request from {}, answering: {:?}", peer_id, listing);
                wire::write_line(&mut write_half, &listing).await?;
            }
            Some(other) => {
                return Err(PeerdropError::Protocol(format!(
                    "Unexpected request from {}: {:?}",
                    peer_id, other
                )));
            }
        }
    }
}
