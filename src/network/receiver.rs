use crate::config::Settings;
use crate::hash::StreamHasher;
use crate::network::wire::{self, TransferAck, TransferHeader};
use crate::{PeerdropError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

/// Bounds on the pre-ack drain in `reject`, so a hostile header declaring
/// an enormous length cannot pin a receiver task discarding bytes.
const MAX_REJECT_DRAIN: u64 = 1 << 20;
const REJECT_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Peer-side listener for incoming file pushes.
///
/// Runs on the same port the peer registered with, so the id other peers
/// see in the discovery listing is exactly the address this listener
/// answers on.
pub struct PeerReceiver {
    settings: Arc<Settings>,
    /// Our own id as registered with the rendezvous server. Transfers
    /// addressed to anyone else are rejected.
    peer_id: String,
}

impl PeerReceiver {
    pub fn new(settings: Arc<Settings>, peer_id: String) -> Self {
        Self { settings, peer_id }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let receiver = self.clone();
                    tokio::spawn(async move {
                        match receiver.handle_push(stream).await {
                            Ok(path) => info!("Received file from {} into {:?}", addr, path),
                            Err(e) => warn!("Incoming transfer from {} failed: {}", addr, e),
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept transfer connection: {}", e);
                    tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// One inbound push: header, `file_len` raw bytes, terminal ack. The
    /// file only reaches the inbox if the recomputed digest matches the
    /// declared one.
    pub async fn handle_push(&self, mut stream: TcpStream) -> Result<PathBuf> {
        let header: TransferHeader = wire::read_frame(&mut stream).await?;

        if let Err(e) = header.validate() {
            reject(&mut stream, header.file_len, &e.to_string()).await;
            return Err(e);
        }

        if header.target != self.peer_id {
            let e = PeerdropError::Protocol(format!(
                "Transfer addressed to {} but this peer is {}",
                header.target, self.peer_id
            ));
            reject(&mut stream, header.file_len, &e.to_string()).await;
            return Err(e);
        }

        let file_name = match sanitize_file_name(&header.file_name) {
            Ok(name) => name,
            Err(e) => {
                reject(&mut stream, header.file_len, &e.to_string()).await;
                return Err(e);
            }
        };

        let inbox = self.settings.inbox_dir();
        tokio::fs::create_dir_all(&inbox).await?;
        // The final name is claimed up front by creating it empty. Scratch
        // paths derive from the claimed name, so two concurrent pushes of
        // the same file name can never share one and interleave on disk.
        let final_path = reserve_save_path(&inbox, file_name).await?;
        let part_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.to_string());
        let part_path = final_path.with_file_name(format!("{}.part", part_name));

        let digest = match self.receive_body(&mut stream, &part_path, header.file_len).await {
            Ok(digest) => digest,
            Err(e) => {
                let _ = tokio::fs::remove_file(&part_path).await;
                let _ = tokio::fs::remove_file(&final_path).await;
                reject(&mut stream, 0, &e.to_string()).await;
                return Err(e);
            }
        };

        if digest != header.sha256_hex {
            let _ = tokio::fs::remove_file(&part_path).await;
            let _ = tokio::fs::remove_file(&final_path).await;
            reject(&mut stream, 0, "integrity check failed").await;
            return Err(PeerdropError::Integrity {
                expected: header.sha256_hex,
                actual: digest,
            });
        }

        tokio::fs::rename(&part_path, &final_path).await?;
        info!(
            "Stored {} ({} bytes, sha256 {})",
            final_path.display(),
            header.file_len,
            digest
        );

        wire::write_frame(
            &mut stream,
            &TransferAck::Received {
                sha256_hex: digest,
            },
        )
        .await?;

        Ok(final_path)
    }

    /// Streams exactly `file_len` bytes to `part_path`, hashing as it goes.
    async fn receive_body(
        &self,
        stream: &mut TcpStream,
        part_path: &Path,
        file_len: u64,
    ) -> Result<String> {
        let mut file = tokio::fs::File::create(part_path).await?;
        let mut hasher = StreamHasher::new();
        let mut buffer = vec![0u8; self.settings.transfer.chunk_size];
        let mut remaining = file_len;

        while remaining > 0 {
            let want = remaining.min(buffer.len() as u64) as usize;
            let bytes_read = stream.read(&mut buffer[..want]).await?;
            if bytes_read == 0 {
                return Err(PeerdropError::MalformedHeader(format!(
                    "Stream ended {} bytes short of the declared length",
                    remaining
                )));
            }
            hasher.update(&buffer[..bytes_read]);
            file.write_all(&buffer[..bytes_read]).await?;
            remaining -= bytes_read as u64;
        }

        file.flush().await?;
        Ok(hasher.finish())
    }
}

/// Best-effort rejection ack. Drains body bytes the sender is still
/// streaming first; closing with unread data would reset the connection
/// and take the ack down with it. The drain is capped in both bytes and
/// time so the declared length cannot hold this task hostage.
async fn reject(stream: &mut TcpStream, pending_body: u64, reason: &str) {
    let drain = async {
        let mut remaining = pending_body.min(MAX_REJECT_DRAIN);
        let mut sink = vec![0u8; 8192];
        while remaining > 0 {
            let want = remaining.min(sink.len() as u64) as usize;
            match stream.read(&mut sink[..want]).await {
                Ok(0) | Err(_) => break,
                Ok(n) => remaining -= n as u64,
            }
        }
    };
    let _ = tokio::time::timeout(REJECT_DRAIN_DEADLINE, drain).await;

    let ack = TransferAck::Rejected {
        reason: reason.to_string(),
    };
    if let Err(e) = wire::write_frame(stream, &ack).await {
        warn!("Could not deliver rejection ack: {}", e);
    }
}

/// A sender-supplied name is only ever used as a single path component
/// inside the inbox. Anything that could escape it is rejected outright
/// rather than silently rewritten.
pub fn sanitize_file_name(name: &str) -> Result<&str> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.len() > wire::MAX_FILE_NAME_LEN
        || name.contains(['/', '\\', '\0']);

    if bad {
        return Err(PeerdropError::MalformedHeader(format!(
            "Unsafe file name {:?}",
            name
        )));
    }
    Ok(name)
}

/// Claims a free name under `dir` by creating it as an empty file,
/// suffixing ` (n)` before the extension until one is free, so a second
/// push of `report.pdf` lands as `report (1).pdf`. Creation uses
/// `create_new`, which makes the claim atomic: two concurrent transfers
/// racing on the same name always end up with distinct paths.
async fn reserve_save_path(dir: &Path, file_name: &str) -> Result<PathBuf> {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");

    let extension = Path::new(file_name)
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| format!(".{}", s))
        .unwrap_or_default();

    let mut counter = 0;
    loop {
        let candidate = if counter == 0 {
            dir.join(file_name)
        } else {
            dir.join(format!("{} ({}){}", stem, counter, extension))
        };

        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => counter += 1,
            Err(e) => return Err(e.into()),
        }
    }
}
