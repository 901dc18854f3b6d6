use crate::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Incremental SHA-256 digest, surfaced as lowercase hex.
///
/// Used on both ends of a transfer: the sender hashes the file before
/// streaming it, the receiver re-hashes the bytes it actually got.
pub struct StreamHasher {
    inner: Sha256,
}

impl StreamHasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn finish(self) -> String {
        format!("{:x}", self.inner.finalize())
    }
}

impl Default for StreamHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Digests a reader front to back without loading it into memory.
pub fn hex_digest<R: Read>(mut reader: R) -> Result<String> {
    let mut hasher = StreamHasher::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finish())
}

pub fn hash_file(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)?;
    hex_digest(std::io::BufReader::new(file))
}
