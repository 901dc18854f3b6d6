use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the registry tracks per live connection: enough to tear the
/// session down on server shutdown.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    cancel: CancellationToken,
}

impl PeerHandle {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

/// Concurrent map from peer id (remote `ip:port`) to its session handle.
///
/// Owned by the rendezvous server. Sessions register on accept and remove
/// themselves on every exit path, so the listing never accumulates stale
/// entries. All lock holds are short and never span I/O, which keeps the
/// accept loop from stalling behind a busy session.
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, PeerHandle>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Last writer wins on a colliding id; the OS only reuses an `ip:port`
    /// once the previous connection is gone, so a collision means the old
    /// session is already dead.
    pub async fn register(&self, peer_id: &str, handle: PeerHandle) {
        let previous = self
            .peers
            .write()
            .await
            .insert(peer_id.to_string(), handle);
        if previous.is_some() {
            warn!("Replacing stale registry entry for {}", peer_id);
        }
        info!("Peer registered: {}", peer_id);
    }

    pub async fn remove(&self, peer_id: &str) {
        if self.peers.write().await.remove(peer_id).is_some() {
            debug!("Peer removed from registry: {}", peer_id);
        }
    }

    /// Point-in-time listing, sorted so the same registry state always
    /// produces the same response.
    pub async fn snapshot(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.peers.read().await.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Cancels every tracked session and clears the map. Called once when
    /// the server stops.
    pub async fn shutdown(&self) {
        let mut peers = self.peers.write().await;
        for (peer_id, handle) in peers.drain() {
            debug!("Closing session with {}", peer_id);
            handle.cancel.cancel();
        }
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
