use crate::config::Settings;
use crate::network::{wire, PeerReceiver, RendezvousServer};
use crate::{PeerdropError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, error, info};

/// Runs the rendezvous server plus the operator console: typing `list`
/// prints the current registry snapshot.
pub struct ServerDaemon {
    settings: Arc<Settings>,
}

impl ServerDaemon {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    pub async fn run(self) -> Result<()> {
        let server = RendezvousServer::new(self.settings.clone());
        let registry = server.registry();
        let shutdown = server.shutdown_token();

        let server_handle = tokio::spawn(async move { server.run().await });

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next_line() => match line? {
                    Some(command) => {
                        let command = command.trim().to_lowercase();
                        if command == "list" {
                            let peers = registry.snapshot().await;
                            println!("Connected peers: {}", wire::join_peer_list(&peers));
                        } else if !command.is_empty() {
                            println!("Commands: list");
                        }
                    }
                    // stdin closed (e.g. running detached); keep serving
                    None => {
                        shutdown.cancelled().await;
                        break;
                    }
                }
            }
        }

        shutdown.cancel();
        match server_handle.await {
            Ok(result) => result,
            Err(e) => Err(PeerdropError::Connection(format!(
                "Server task failed: {}",
                e
            ))),
        }
    }
}

/// Long-running peer: registers with the rendezvous server and receives
/// incoming file pushes.
///
/// Both the registration connection and the transfer listener use the same
/// local port, via SO_REUSEADDR/SO_REUSEPORT sockets. The server derives
/// our peer id from the registration connection's remote endpoint, so that
/// id is exactly the address other peers can dial to push us a file.
pub struct PeerDaemon {
    settings: Arc<Settings>,
    server_addr: String,
}

impl PeerDaemon {
    pub fn new(settings: Arc<Settings>, server_addr: String) -> Self {
        Self {
            settings,
            server_addr,
        }
    }

    pub async fn run(self) -> Result<()> {
        let local_addr = self.settings.peer_bind_address();

        // Claim the port with the listener before registering, so a push
        // can land the moment we become discoverable.
        let listen_socket = reusable_socket(local_addr)?;
        let listener = listen_socket.listen(1024)?;

        let connect_socket = reusable_socket(local_addr)?;
        let server_addr = resolve_addr(&self.server_addr).await?;
        let stream = connect_socket.connect(server_addr).await.map_err(|e| {
            PeerdropError::Connection(format!("Failed to connect to {}: {}", server_addr, e))
        })?;

        let peer_id = stream.local_addr()?.to_string();
        info!(
            "{} registered with rendezvous server {} as {}",
            self.settings.device.name, server_addr, peer_id
        );

        let receiver = Arc::new(PeerReceiver::new(self.settings.clone(), peer_id.clone()));
        let receiver_handle = tokio::spawn(async move {
            if let Err(e) = receiver.serve(listener).await {
                error!("Transfer receiver error: {}", e);
            }
        });

        let result = Self::hold_registration(stream).await;
        receiver_handle.abort();
        result
    }

    /// Keeps the registration connection open. The server never writes
    /// unsolicited, so the only things to see here are noise or EOF.
    async fn hold_registration(stream: TcpStream) -> Result<()> {
        let (read_half, _write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        loop {
            match wire::read_line(&mut reader).await? {
                None => {
                    return Err(PeerdropError::Connection(
                        "Rendezvous server closed the registration session".to_string(),
                    ));
                }
                Some(line) => debug!("Unsolicited line from server: {:?}", line),
            }
        }
    }
}

fn reusable_socket(local_addr: SocketAddr) -> Result<TcpSocket> {
    let socket = match local_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(local_addr)?;
    Ok(socket)
}

async fn resolve_addr(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| PeerdropError::Connection(format!("Cannot resolve {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| PeerdropError::Connection(format!("{} resolved to no addresses", addr)))
}
