// End-to-end tests over real loopback sockets: rendezvous discovery,
// registry lifecycle, and direct peer-to-peer file pushes.

use peerdrop::config::Settings;
use peerdrop::network::registry::PeerRegistry;
use peerdrop::network::wire::{self, TransferAck, TransferHeader};
use peerdrop::network::{PeerClient, PeerReceiver, RendezvousServer};
use peerdrop::service::PeerDaemon;
use peerdrop::PeerdropError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

fn test_settings(inbox: Option<&Path>) -> Arc<Settings> {
    let mut settings = Settings::default();
    settings.network.timeout_seconds = 5;
    settings.transfer.inbox_dir = inbox.map(Path::to_path_buf);
    Arc::new(settings)
}

async fn start_server(settings: Arc<Settings>) -> (String, Arc<PeerRegistry>, CancellationToken) {
    let server = RendezvousServer::new(settings);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let registry = server.registry();
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (addr, registry, shutdown)
}

/// Receiver listening on an ephemeral port whose peer id is its own
/// address, exactly as a joined daemon would advertise it.
async fn start_receiver(settings: Arc<Settings>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let receiver = Arc::new(PeerReceiver::new(settings, addr.clone()));
    tokio::spawn(async move {
        let _ = receiver.serve(listener).await;
    });
    addr
}

/// One discovery exchange on an already-open registration connection.
async fn discovery(stream: &mut TcpStream) -> Vec<String> {
    let (read_half, mut write_half) = stream.split();
    wire::write_line(&mut write_half, wire::DISCOVERY_REQUEST)
        .await
        .unwrap();
    let mut reader = BufReader::new(read_half);
    let line = wire::read_line(&mut reader).await.unwrap().unwrap();
    wire::split_peer_list(&line)
}

async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn write_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

// ============================================================================
// Discovery and registry lifecycle
// ============================================================================

#[tokio::test]
async fn two_peers_each_see_the_other_and_themselves() {
    let (server_addr, registry, _shutdown) = start_server(test_settings(None)).await;

    let mut conn_a = TcpStream::connect(&server_addr).await.unwrap();
    let mut conn_b = TcpStream::connect(&server_addr).await.unwrap();
    let id_a = conn_a.local_addr().unwrap().to_string();
    let id_b = conn_b.local_addr().unwrap().to_string();

    assert!(eventually(|| async { registry.len().await == 2 }).await);

    let seen_by_a = discovery(&mut conn_a).await;
    let seen_by_b = discovery(&mut conn_b).await;

    // registration happens on accept, before any response, so each peer
    // is part of the listing it receives
    assert!(seen_by_a.contains(&id_a) && seen_by_a.contains(&id_b));
    assert!(seen_by_b.contains(&id_a) && seen_by_b.contains(&id_b));
}

#[tokio::test]
async fn repeated_discovery_without_churn_is_idempotent() {
    let (server_addr, registry, _shutdown) = start_server(test_settings(None)).await;

    let mut conn = TcpStream::connect(&server_addr).await.unwrap();
    assert!(eventually(|| async { registry.len().await == 1 }).await);

    let first = discovery(&mut conn).await;
    let second = discovery(&mut conn).await;
    assert_eq!(first, second);
    assert_eq!(first.len(), 1);
}

#[tokio::test]
async fn disconnected_peers_leave_the_registry() {
    let (server_addr, registry, _shutdown) = start_server(test_settings(None)).await;

    let conn = TcpStream::connect(&server_addr).await.unwrap();
    assert!(eventually(|| async { registry.len().await == 1 }).await);

    drop(conn);
    assert!(eventually(|| async { registry.is_empty().await }).await);
}

#[tokio::test]
async fn unknown_request_closes_the_session() {
    let (server_addr, registry, _shutdown) = start_server(test_settings(None)).await;

    let mut conn = TcpStream::connect(&server_addr).await.unwrap();
    assert!(eventually(|| async { registry.len().await == 1 }).await);

    conn.write_all(b"DELETE_EVERYTHING\n").await.unwrap();
    conn.flush().await.unwrap();

    // server drops the session and prunes its entry
    assert!(eventually(|| async { registry.is_empty().await }).await);
    let mut reader = BufReader::new(conn);
    assert_eq!(wire::read_line(&mut reader).await.unwrap(), None);
}

#[tokio::test]
async fn server_shutdown_closes_every_session() {
    let (server_addr, registry, shutdown) = start_server(test_settings(None)).await;

    let conn_a = TcpStream::connect(&server_addr).await.unwrap();
    let conn_b = TcpStream::connect(&server_addr).await.unwrap();
    assert!(eventually(|| async { registry.len().await == 2 }).await);

    shutdown.cancel();
    assert!(eventually(|| async { registry.is_empty().await }).await);

    for conn in [conn_a, conn_b] {
        let mut reader = BufReader::new(conn);
        assert_eq!(wire::read_line(&mut reader).await.unwrap(), None);
    }
}

#[tokio::test]
async fn list_against_a_dead_server_is_a_connection_error() {
    // bind-then-drop to get an address nothing is listening on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let client = PeerClient::new(test_settings(None));
    let result = client.request_peer_list(&addr).await;
    assert!(matches!(result, Err(PeerdropError::Connection(_))));
}

// ============================================================================
// Direct file pushes
// ============================================================================

#[tokio::test]
async fn push_file_end_to_end_with_matching_digests() {
    let inbox = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    let settings = test_settings(Some(inbox.path()));

    let target = start_receiver(settings.clone()).await;
    let content = b"the quick brown fox jumps over the lazy dog";
    let path = write_test_file(source.path(), "fox.txt", content);

    let client = PeerClient::new(settings);
    let digest = client.push_file(&target, &target, &path).await.unwrap();

    let received = inbox.path().join("fox.txt");
    assert_eq!(std::fs::read(&received).unwrap(), content);
    assert_eq!(peerdrop::hash::hash_file(&received).unwrap(), digest);
}

#[tokio::test]
async fn zero_length_file_transfers_as_an_empty_file() {
    let inbox = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    let settings = test_settings(Some(inbox.path()));

    let target = start_receiver(settings.clone()).await;
    let path = write_test_file(source.path(), "empty.bin", b"");

    let client = PeerClient::new(settings);
    client.push_file(&target, &target, &path).await.unwrap();

    let received = inbox.path().join("empty.bin");
    assert!(received.exists());
    assert_eq!(std::fs::metadata(&received).unwrap().len(), 0);
}

#[tokio::test]
async fn second_push_of_the_same_name_does_not_clobber() {
    let inbox = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    let settings = test_settings(Some(inbox.path()));

    let target = start_receiver(settings.clone()).await;
    let client = PeerClient::new(settings);

    let first = write_test_file(source.path(), "notes.txt", b"first");
    client.push_file(&target, &target, &first).await.unwrap();

    let second = write_test_file(source.path(), "notes.txt", b"second");
    client.push_file(&target, &target, &second).await.unwrap();

    assert_eq!(
        std::fs::read(inbox.path().join("notes.txt")).unwrap(),
        b"first"
    );
    assert_eq!(
        std::fs::read(inbox.path().join("notes (1).txt")).unwrap(),
        b"second"
    );
}

#[tokio::test]
async fn push_addressed_to_someone_else_is_rejected() {
    let inbox = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    let settings = test_settings(Some(inbox.path()));

    let target = start_receiver(settings.clone()).await;
    let path = write_test_file(source.path(), "misdirected.txt", b"hello");

    let client = PeerClient::new(settings);
    let result = client
        .push_file(&target, "203.0.113.9:5001", &path)
        .await;

    assert!(matches!(result, Err(PeerdropError::Protocol(_))));
    assert!(std::fs::read_dir(inbox.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn send_to_an_unregistered_target_fails_before_any_bytes_flow() {
    let (server_addr, _registry, _shutdown) = start_server(test_settings(None)).await;
    let source = tempfile::tempdir().unwrap();
    let path = write_test_file(source.path(), "void.bin", &vec![0u8; 1024]);

    let client = PeerClient::new(test_settings(None));
    let result = client
        .send_to_target(&server_addr, "203.0.113.9:5001", &path)
        .await;

    assert!(matches!(result, Err(PeerdropError::Protocol(_))));
}

#[tokio::test]
async fn push_of_a_missing_file_is_file_not_found() {
    let settings = test_settings(None);
    let target = start_receiver(settings.clone()).await;

    let client = PeerClient::new(settings);
    let result = client
        .push_file(&target, &target, Path::new("/nonexistent/ghost.txt"))
        .await;

    assert!(matches!(result, Err(PeerdropError::FileNotFound(_))));
}

#[tokio::test]
async fn digest_mismatch_discards_the_file_and_reports_rejection() {
    let inbox = tempfile::tempdir().unwrap();
    let settings = test_settings(Some(inbox.path()));
    let target = start_receiver(settings).await;

    // hand-rolled sender declaring a digest the body will not match
    let mut stream = TcpStream::connect(&target).await.unwrap();
    let body = b"content that does not hash to all-zeroes";
    let header = TransferHeader::new(
        target.clone(),
        "tampered.bin".to_string(),
        body.len() as u64,
        "0".repeat(64),
    );
    wire::write_frame(&mut stream, &header).await.unwrap();
    stream.write_all(body).await.unwrap();
    stream.flush().await.unwrap();

    let ack: TransferAck = wire::read_frame(&mut stream).await.unwrap();
    assert!(matches!(ack, TransferAck::Rejected { .. }));

    // neither the file nor its .part scratch survives
    assert!(std::fs::read_dir(inbox.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn truncated_body_is_rejected() {
    let inbox = tempfile::tempdir().unwrap();
    let settings = test_settings(Some(inbox.path()));
    let target = start_receiver(settings).await;

    let mut stream = TcpStream::connect(&target).await.unwrap();
    let header = TransferHeader::new(
        target.clone(),
        "short.bin".to_string(),
        1024,
        "0".repeat(64),
    );
    wire::write_frame(&mut stream, &header).await.unwrap();
    stream.write_all(&[0u8; 100]).await.unwrap();
    stream.shutdown().await.unwrap();

    let ack: TransferAck = wire::read_frame(&mut stream).await.unwrap();
    assert!(matches!(ack, TransferAck::Rejected { .. }));
    assert!(std::fs::read_dir(inbox.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn concurrent_pushes_of_the_same_name_stay_intact() {
    let inbox = tempfile::tempdir().unwrap();
    let settings = test_settings(Some(inbox.path()));
    let target = start_receiver(settings).await;

    // hand-rolled senders pacing their writes so the two bodies are in
    // flight at the same time
    async fn push_slowly(target: &str, body: &[u8]) -> String {
        let mut hasher = peerdrop::hash::StreamHasher::new();
        hasher.update(body);
        let digest = hasher.finish();

        let mut stream = TcpStream::connect(target).await.unwrap();
        let header = TransferHeader::new(
            target.to_string(),
            "same.txt".to_string(),
            body.len() as u64,
            digest.clone(),
        );
        wire::write_frame(&mut stream, &header).await.unwrap();
        for slice in body.chunks(100) {
            stream.write_all(slice).await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        match wire::read_frame(&mut stream).await.unwrap() {
            TransferAck::Received { sha256_hex } => {
                assert_eq!(sha256_hex, digest);
                digest
            }
            TransferAck::Rejected { reason } => panic!("push rejected: {}", reason),
        }
    }

    let body_a = vec![b'a'; 1000];
    let body_b = vec![b'b'; 1000];
    let (digest_a, digest_b) =
        tokio::join!(push_slowly(&target, &body_a), push_slowly(&target, &body_b));

    // both files land under distinct names, each holding exactly the
    // bytes its sender's ack confirmed
    let persisted: Vec<String> = [
        inbox.path().join("same.txt"),
        inbox.path().join("same (1).txt"),
    ]
    .iter()
    .map(|p| peerdrop::hash::hash_file(p).unwrap())
    .collect();

    assert_ne!(digest_a, digest_b);
    assert!(persisted.contains(&digest_a));
    assert!(persisted.contains(&digest_b));
    assert_eq!(std::fs::read_dir(inbox.path()).unwrap().count(), 2);
}

#[tokio::test]
async fn absurd_declared_length_is_rejected_without_draining() {
    let inbox = tempfile::tempdir().unwrap();
    let settings = test_settings(Some(inbox.path()));
    let target = start_receiver(settings).await;

    let mut stream = TcpStream::connect(&target).await.unwrap();
    let header = TransferHeader::new(
        target.clone(),
        "endless.bin".to_string(),
        u64::MAX,
        "0".repeat(64),
    );
    wire::write_frame(&mut stream, &header).await.unwrap();
    stream.shutdown().await.unwrap();

    let ack: TransferAck = wire::read_frame(&mut stream).await.unwrap();
    assert!(matches!(ack, TransferAck::Rejected { .. }));
    assert!(std::fs::read_dir(inbox.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn sender_flags_an_ack_carrying_the_wrong_digest() {
    let source = tempfile::tempdir().unwrap();
    let path = write_test_file(source.path(), "flaky.bin", b"payload the receiver mangles");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap().to_string();

    // receiver that consumes the whole transfer but confirms a digest
    // for different bytes
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let header: TransferHeader = wire::read_frame(&mut stream).await.unwrap();
        let mut body = vec![0u8; header.file_len as usize];
        stream.read_exact(&mut body).await.unwrap();
        wire::write_frame(
            &mut stream,
            &TransferAck::Received {
                sha256_hex: "f".repeat(64),
            },
        )
        .await
        .unwrap();
    });

    let client = PeerClient::new(test_settings(None));
    let result = client.push_file(&target, &target, &path).await;
    assert!(matches!(result, Err(PeerdropError::Integrity { .. })));
}

#[tokio::test]
async fn traversal_file_name_is_rejected_at_the_header() {
    let inbox = tempfile::tempdir().unwrap();
    let settings = test_settings(Some(inbox.path()));
    let target = start_receiver(settings).await;

    let mut stream = TcpStream::connect(&target).await.unwrap();
    let header = TransferHeader::new(
        target.clone(),
        "../escape.sh".to_string(),
        4,
        "0".repeat(64),
    );
    wire::write_frame(&mut stream, &header).await.unwrap();

    let ack: TransferAck = wire::read_frame(&mut stream).await.unwrap();
    assert!(matches!(ack, TransferAck::Rejected { .. }));
}

// ============================================================================
// Full join flow: register, discover, push
// ============================================================================

#[tokio::test]
async fn joined_peer_is_discoverable_and_receives_a_file() {
    let (server_addr, _registry, _shutdown) = start_server(test_settings(None)).await;

    // pick a free port for the peer's shared bind
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_port = probe.local_addr().unwrap().port();
    drop(probe);

    let inbox = tempfile::tempdir().unwrap();
    let mut peer_settings = Settings::default();
    peer_settings.network.peer_port = peer_port;
    peer_settings.network.timeout_seconds = 5;
    peer_settings.transfer.inbox_dir = Some(inbox.path().to_path_buf());

    let daemon = PeerDaemon::new(Arc::new(peer_settings), server_addr.clone());
    let daemon_handle = tokio::spawn(async move { daemon.run().await });

    let expected_id = format!("127.0.0.1:{}", peer_port);
    let client = PeerClient::new(test_settings(None));

    let registered = eventually(|| async {
        match client.request_peer_list(&server_addr).await {
            Ok(peers) => peers.contains(&expected_id),
            Err(_) => false,
        }
    })
    .await;
    assert!(registered, "peer never appeared in the discovery listing");

    let source = tempfile::tempdir().unwrap();
    let content = b"delivered through the full join flow";
    let path = write_test_file(source.path(), "joined.txt", content);

    client
        .send_to_target(&server_addr, &expected_id, &path)
        .await
        .unwrap();

    assert_eq!(
        std::fs::read(inbox.path().join("joined.txt")).unwrap(),
        content
    );

    daemon_handle.abort();
}
