//! Single wire framing shared by every connection.
//!
//! Discovery traffic is newline-delimited text so it stays easy to poke at
//! with netcat. Transfer headers and acknowledgements are length-prefixed
//! binary frames: a u32 big-endian frame length followed by the bincode
//! encoding of the message, which itself length-prefixes every string field.
//! After a header frame the file body follows as exactly `file_len` raw
//! bytes; after the body the receiver answers with one ack frame.

use crate::{PeerdropError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: u8 = 1;

/// Literal request token a peer sends to ask for the registry listing.
pub const DISCOVERY_REQUEST: &str = "GET_CLIENTS";

pub const PEER_LIST_SEPARATOR: &str = ", ";

/// Upper bound on a header/ack frame. Anything larger is a corrupt or
/// hostile header, not a legitimate message.
pub const MAX_FRAME_LEN: u32 = 4096;

/// Upper bound on a discovery line read from the socket.
pub const MAX_LINE_LEN: usize = 64 * 1024;

pub const MAX_FILE_NAME_LEN: usize = 255;

/// Largest declared body length a header may carry. Lengths at or above
/// 2^63 do not fit a signed file size and are always bogus.
pub const MAX_FILE_LEN: u64 = (1 << 63) - 1;

/// Metadata block preceding a file's raw bytes on a push connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHeader {
    pub version: u8,
    /// Peer id the transfer is addressed to, as listed by the registry.
    pub target: String,
    pub file_name: String,
    pub file_len: u64,
    pub sha256_hex: String,
}

impl TransferHeader {
    pub fn new(target: String, file_name: String, file_len: u64, sha256_hex: String) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            target,
            file_name,
            file_len,
            sha256_hex,
        }
    }

    /// Field-level checks applied after decoding, before any payload byte
    /// is read.
    pub fn validate(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(PeerdropError::Protocol(format!(
                "Unsupported protocol version {} (this peer speaks {})",
                self.version, PROTOCOL_VERSION
            )));
        }
        if self.file_name.len() > MAX_FILE_NAME_LEN {
            return Err(PeerdropError::MalformedHeader(format!(
                "File name of {} bytes exceeds the {} byte limit",
                self.file_name.len(),
                MAX_FILE_NAME_LEN
            )));
        }
        if self.file_len > MAX_FILE_LEN {
            return Err(PeerdropError::MalformedHeader(format!(
                "Declared length {} exceeds the supported maximum",
                self.file_len
            )));
        }
        if self.sha256_hex.len() != 64
            || !self.sha256_hex.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(PeerdropError::MalformedHeader(
                "Hash field is not a 64-character hex digest".to_string(),
            ));
        }
        Ok(())
    }
}

/// Terminal acknowledgement sent back by the receiver once the byte stream
/// is fully consumed. The sender's push is not complete until this arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferAck {
    /// The receiver persisted the file; carries its recomputed digest.
    Received { sha256_hex: String },
    Rejected { reason: String },
}

pub async fn write_frame<W, T>(stream: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = bincode::serialize(message)?;
    if data.len() > MAX_FRAME_LEN as usize {
        return Err(PeerdropError::MalformedHeader(format!(
            "Refusing to send a {} byte frame (cap is {})",
            data.len(),
            MAX_FRAME_LEN
        )));
    }

    stream.write_all(&(data.len() as u32).to_be_bytes()).await?;
    stream.write_all(&data).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(stream: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    stream
        .read_exact(&mut len_bytes)
        .await
        .map_err(map_frame_eof)?;
    let frame_len = u32::from_be_bytes(len_bytes);

    if frame_len > MAX_FRAME_LEN {
        return Err(PeerdropError::MalformedHeader(format!(
            "Declared frame of {} bytes exceeds the {} byte cap",
            frame_len, MAX_FRAME_LEN
        )));
    }

    let mut data = vec![0u8; frame_len as usize];
    stream.read_exact(&mut data).await.map_err(map_frame_eof)?;

    bincode::deserialize(&data)
        .map_err(|e| PeerdropError::MalformedHeader(format!("Undecodable frame: {}", e)))
}

fn map_frame_eof(e: std::io::Error) -> PeerdropError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        PeerdropError::MalformedHeader("Stream ended mid-frame".to_string())
    } else {
        PeerdropError::Io(e)
    }
}

/// Writes one discovery line and flushes immediately; the connection is
/// otherwise idle, so buffering would stall the exchange.
pub async fn write_line<W>(stream: &mut W, line: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one discovery line, bounded at `MAX_LINE_LEN`. Returns `None` on a
/// clean end of stream.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut limited = reader.take(MAX_LINE_LEN as u64 + 1);
    let mut line = String::new();
    let bytes_read = limited.read_line(&mut line).await?;

    if bytes_read == 0 {
        return Ok(None);
    }
    if bytes_read > MAX_LINE_LEN && !line.ends_with('\n') {
        return Err(PeerdropError::Protocol(format!(
            "Line exceeds the {} byte cap",
            MAX_LINE_LEN
        )));
    }

    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

pub fn join_peer_list(peers: &[String]) -> String {
    peers.join(PEER_LIST_SEPARATOR)
}

/// Tolerates both `", "` and bare-comma separators on the inbound side.
pub fn split_peer_list(line: &str) -> Vec<String> {
    line.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}
