use crate::config::Settings;
use crate::hash;
use crate::network::wire::{self, TransferAck, TransferHeader};
use crate::{PeerdropError, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// One-shot client operations. Every operation opens its own fresh
/// connection; nothing is reused across calls.
pub struct PeerClient {
    settings: Arc<Settings>,
}

impl PeerClient {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    /// Discovery exchange: one request line out, one listing line back.
    pub async fn request_peer_list(&self, server_addr: &str) -> Result<Vec<String>> {
        let stream = TcpStream::connect(server_addr).await.map_err(|e| {
            PeerdropError::Connection(format!("Failed to connect to {}: {}", server_addr, e))
        })?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        wire::write_line(&mut write_half, wire::DISCOVERY_REQUEST).await?;

        match wire::read_line(&mut reader).await? {
            Some(line) => {
                let peers = wire::split_peer_list(&line);
                debug!("Discovery response from {}: {:?}", server_addr, peers);
                Ok(peers)
            }
            None => Err(PeerdropError::Protocol(format!(
                "{} closed the connection before answering the discovery request",
                server_addr
            ))),
        }
    }

    /// Pushes one file straight to `target_addr`: header frame, exactly
    /// `file_len` raw bytes, then wait for the receiver's ack under the
    /// configured deadline. Returns the verified digest.
    pub async fn push_file(
        &self,
        target_addr: &str,
        target_id: &str,
        path: &Path,
    ) -> Result<String> {
        if !path.exists() {
            return Err(PeerdropError::FileNotFound(path.to_path_buf()));
        }
        if !path.is_file() {
            return Err(PeerdropError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{:?} is not a regular file", path),
            )));
        }

        let file_len = std::fs::metadata(path)?.len();
        let sha256_hex = hash::hash_file(path)?;
        let file_name = path
            .file_name()
            .ok_or_else(|| {
                PeerdropError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{:?} has no file name", path),
                ))
            })?
            .to_string_lossy()
            .to_string();

        let header = TransferHeader::new(
            target_id.to_string(),
            file_name,
            file_len,
            sha256_hex.clone(),
        );
        header.validate()?;

        let mut stream = TcpStream::connect(target_addr).await.map_err(|e| {
            PeerdropError::Connection(format!("Failed to connect to {}: {}", target_addr, e))
        })?;

        wire::write_frame(&mut stream, &header).await?;
        self.stream_body(&mut stream, path, file_len).await?;
        stream.flush().await?;
        debug!("Streamed {} bytes to {}, awaiting ack", file_len, target_addr);

        let deadline = Duration::from_secs(self.settings.network.timeout_seconds);
        let ack: TransferAck = tokio::time::timeout(deadline, wire::read_frame(&mut stream))
            .await
            .map_err(|_| {
                PeerdropError::Connection(format!(
                    "No acknowledgement from {} within {}s",
                    target_addr,
                    deadline.as_secs()
                ))
            })??;

        match ack {
            TransferAck::Received { sha256_hex: theirs } if theirs == sha256_hex => {
                info!(
                    "Sent {:?} ({} bytes) to {}, receiver confirmed {}",
                    path, file_len, target_id, theirs
                );
                Ok(sha256_hex)
            }
            TransferAck::Received { sha256_hex: theirs } => Err(PeerdropError::Integrity {
                expected: sha256_hex,
                actual: theirs,
            }),
            TransferAck::Rejected { reason } => Err(PeerdropError::Protocol(format!(
                "Transfer rejected by {}: {}",
                target_addr, reason
            ))),
        }
    }

    /// The full client flow: snapshot the registry, refuse targets it does
    /// not list, then push directly to the target's address (the peer id
    /// doubles as the address its receiver listens on).
    pub async fn send_to_target(
        &self,
        server_addr: &str,
        target_id: &str,
        path: &Path,
    ) -> Result<String> {
        let peers = self.request_peer_list(server_addr).await?;
        if !peers.iter().any(|p| p == target_id) {
            return Err(PeerdropError::Protocol(format!(
                "Target {} is not registered with {} (known peers: {})",
                target_id,
                server_addr,
                wire::join_peer_list(&peers)
            )));
        }

        self.push_file(target_id, target_id, path).await
    }

    /// Sends exactly `file_len` bytes even if the file grows mid-stream,
    /// so the declared length and the bytes on the wire always agree.
    async fn stream_body(
        &self,
        stream: &mut TcpStream,
        path: &Path,
        file_len: u64,
    ) -> Result<()> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut buffer = vec![0u8; self.settings.transfer.chunk_size];
        let mut remaining = file_len;

        while remaining > 0 {
            let want = remaining.min(buffer.len() as u64) as usize;
            let bytes_read = file.read(&mut buffer[..want]).await?;
            if bytes_read == 0 {
                return Err(PeerdropError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("{:?} shrank while being sent", path),
                )));
            }
            stream.write_all(&buffer[..bytes_read]).await?;
            remaining -= bytes_read as u64;
        }

        Ok(())
    }
}
