//! Integration tests for peer-tracker
//!
//! These tests run a real tracker on an ephemeral port and real peer agents
//! with temporary shared folders, and exercise registration, publishing,
//! liveness checks and file transfers end to end.

use peer_tracker::tracker::PingStatus;
use peer_tracker::{
    Console, P2PError, PeerAgent, PeerConfig, Registry, Result, Tracker, TrackerConfig,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct TestTracker {
    addr: String,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl TestTracker {
    async fn start() -> Self {
        let config = TrackerConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            ping_timeout_secs: 1,
            ..Default::default()
        };
        let tracker = Tracker::bind(config).await.expect("Failed to bind tracker");
        let addr = tracker.local_addr().unwrap().to_string();
        let registry = tracker.registry();
        let shutdown = tracker.shutdown_token();
        let handle = tokio::spawn(tracker.run());
        Self {
            addr,
            registry,
            shutdown,
            handle,
        }
    }

    fn console(&self) -> Console {
        Console::new(
            self.registry.clone(),
            self.shutdown.clone(),
            Duration::from_secs(1),
        )
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.handle
            .await
            .expect("Tracker task panicked")
            .expect("Tracker failed");
    }
}

/// Helper to start a peer with its own temp shared folder
async fn start_peer(tracker: &TestTracker, hostname: &str) -> (PeerAgent, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = PeerConfig {
        hostname: hostname.to_string(),
        tracker_addr: tracker.addr.clone(),
        transfer_port: 0,
        shared_dir: dir.path().to_path_buf(),
        request_timeout_secs: 5,
        connect_timeout_secs: 2,
        ..Default::default()
    };
    let agent = PeerAgent::start(config).await.expect("Failed to start peer");
    (agent, dir)
}

/// Polls `check` until it holds or two seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// A bare control connection, for peers that do not behave like agents.
struct RawPeer {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl RawPeer {
    async fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    async fn send(&mut self, line: &str) -> String {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
        let mut reply = String::new();
        self.reader.read_line(&mut reply).await.unwrap();
        reply.trim_end().to_string()
    }
}

/// Partial downloads left behind in `dir`.
fn staged_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter(|entry| {
            entry
                .as_ref()
                .map(|e| e.file_name().to_string_lossy().ends_with(".part"))
                .unwrap_or(false)
        })
        .count()
}

// =============================================================================
// Scenario
// =============================================================================

#[tokio::test]
async fn test_alice_shares_notes_with_bob() {
    let tracker = TestTracker::start().await;
    let (alice, alice_dir) = start_peer(&tracker, "alice").await;
    let (bob, bob_dir) = start_peer(&tracker, "bob").await;

    let notes = b"Agenda: ship the tracker.\n".to_vec();
    std::fs::write(alice_dir.path().join("notes.txt"), &notes).unwrap();
    alice
        .publish(Path::new("notes.txt"), "notes.txt")
        .await
        .expect("Publish should succeed");

    let locations = bob.query("notes.txt").await.unwrap();
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].hostname, "alice");
    assert_eq!(locations[0].address.to_string(), "127.0.0.1");
    assert_eq!(locations[0].transfer_port, alice.transfer_port());
    assert!(locations[0].origin);

    let report = bob.fetch("notes.txt").await.unwrap();
    assert!(report.succeeded().is_some(), "Fetch should succeed");
    assert_eq!(std::fs::read(bob_dir.path().join("notes.txt")).unwrap(), notes);

    alice.shutdown().await;
    bob.shutdown().await;
    tracker.stop().await;
}

// =============================================================================
// Transfers
// =============================================================================

#[tokio::test]
async fn test_transfer_round_trip_sizes() {
    let tracker = TestTracker::start().await;
    let (server, server_dir) = start_peer(&tracker, "server").await;
    let (client, client_dir) = start_peer(&tracker, "client").await;

    for size in [0usize, 1, 1_000_000] {
        let name = format!("blob-{}.bin", size);
        let content: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        std::fs::write(server_dir.path().join(&name), &content).unwrap();
        assert_eq!(
            server.publish(Path::new(&name), &name).await.unwrap(),
            size as u64
        );

        let report = client.fetch(&name).await.unwrap();
        let outcome = report.succeeded().expect("Fetch should succeed");
        assert_eq!(outcome.bytes, size as u64);

        let received = std::fs::read(client_dir.path().join(&name)).unwrap();
        assert_eq!(received.len(), size);
        assert!(received == content, "content mismatch for {} bytes", size);
    }

    server.shutdown().await;
    client.shutdown().await;
    tracker.stop().await;
}

#[tokio::test]
async fn test_short_transfer_is_reported_and_discarded() {
    let tracker = TestTracker::start().await;

    // A serving peer that promises 100 bytes and sends 10.
    let liar = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let liar_port = liar.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = liar.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        write_half.write_all(b"FILESIZE 100\n").await.unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        write_half.write_all(&[9u8; 10]).await.unwrap();
        write_half.shutdown().await.unwrap();
    });

    let mut mallory = RawPeer::connect(&tracker.addr).await;
    assert_eq!(
        mallory.send(&format!("REGISTER mallory {}", liar_port)).await,
        "OK"
    );
    assert_eq!(mallory.send("PUBLISH short.bin 100").await, "OK");

    let (bob, bob_dir) = start_peer(&tracker, "bob").await;
    let report = bob.fetch("short.bin").await.unwrap();
    assert_eq!(report.attempts.len(), 1);
    assert!(matches!(
        report.attempts[0].result,
        Err(P2PError::ShortTransfer {
            expected: 100,
            received: 10
        })
    ));
    assert!(report.succeeded().is_none());
    assert!(!bob_dir.path().join("short.bin").exists());
    assert_eq!(staged_files(bob_dir.path()), 0);

    bob.shutdown().await;
    tracker.stop().await;
}

#[tokio::test]
async fn test_stalled_requester_does_not_block_others() {
    let tracker = TestTracker::start().await;
    let (alice, alice_dir) = start_peer(&tracker, "alice").await;
    let (bob, bob_dir) = start_peer(&tracker, "bob").await;

    let movie: Vec<u8> = (0..200_000).map(|i| (i % 253) as u8).collect();
    std::fs::write(alice_dir.path().join("movie.mkv"), &movie).unwrap();
    alice.publish(Path::new("movie.mkv"), "movie.mkv").await.unwrap();

    // Asks for the file, reads the size, then never confirms.
    let stalled = TcpStream::connect(("127.0.0.1", alice.transfer_port()))
        .await
        .unwrap();
    let (read_half, mut write_half) = stalled.into_split();
    let mut stalled_reader = BufReader::new(read_half);
    write_half.write_all(b"DOWNLOAD movie.mkv\n").await.unwrap();
    let mut header = String::new();
    stalled_reader.read_line(&mut header).await.unwrap();
    assert_eq!(header.trim_end(), "FILESIZE 200000");

    let report = tokio::time::timeout(Duration::from_secs(3), bob.fetch("movie.mkv"))
        .await
        .expect("Fetch must not wait on the stalled requester")
        .unwrap();
    assert_eq!(report.succeeded().expect("Fetch should succeed").bytes, 200_000);
    assert!(std::fs::read(bob_dir.path().join("movie.mkv")).unwrap() == movie);

    drop(write_half);
    drop(stalled_reader);
    alice.shutdown().await;
    bob.shutdown().await;
    tracker.stop().await;
}

#[tokio::test]
async fn test_fetch_falls_through_to_next_peer() {
    let tracker = TestTracker::start().await;

    // "ghost" claims the file but nothing listens on its transfer port.
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = closed.local_addr().unwrap().port();
    drop(closed);
    let mut ghost = RawPeer::connect(&tracker.addr).await;
    assert_eq!(ghost.send(&format!("REGISTER ghost {}", dead_port)).await, "OK");
    assert_eq!(ghost.send("PUBLISH report.pdf").await, "OK");

    let (alice, alice_dir) = start_peer(&tracker, "alice").await;
    std::fs::write(alice_dir.path().join("report.pdf"), b"%PDF-1.7").unwrap();
    alice.publish(Path::new("report.pdf"), "report.pdf").await.unwrap();

    let (bob, bob_dir) = start_peer(&tracker, "bob").await;
    let report = bob.fetch("report.pdf").await.unwrap();
    assert_eq!(report.candidates.len(), 2);
    assert_eq!(report.candidates[0].hostname, "ghost");
    assert_eq!(report.attempts.len(), 2);
    assert!(report.attempts[0].result.is_err());
    assert!(report.attempts[1].result.is_ok());
    assert_eq!(
        std::fs::read(bob_dir.path().join("report.pdf")).unwrap(),
        b"%PDF-1.7"
    );

    alice.shutdown().await;
    bob.shutdown().await;
    tracker.stop().await;
}

// =============================================================================
// Registry behaviour
// =============================================================================

#[tokio::test]
async fn test_concurrent_publish_same_file() {
    const PEERS: usize = 8;
    let tracker = TestTracker::start().await;

    let mut peers = Vec::new();
    for i in 0..PEERS {
        let (agent, dir) = start_peer(&tracker, &format!("seed{}", i)).await;
        std::fs::write(dir.path().join("distro.iso"), format!("image {}", i)).unwrap();
        peers.push((agent, dir));
    }

    let mut tasks = Vec::new();
    for (agent, dir) in peers {
        tasks.push(tokio::spawn(async move {
            agent
                .publish(Path::new("distro.iso"), "distro.iso")
                .await
                .expect("Publish should succeed");
            (agent, dir)
        }));
    }
    let mut peers = Vec::new();
    for task in tasks {
        peers.push(task.await.unwrap());
    }

    let (observer, _dir) = start_peer(&tracker, "observer").await;
    let locations = observer.query("distro.iso").await.unwrap();
    let hosts: HashSet<String> = locations.iter().map(|l| l.hostname.clone()).collect();
    assert_eq!(locations.len(), PEERS);
    assert_eq!(hosts.len(), PEERS);
    assert_eq!(locations.iter().filter(|l| l.origin).count(), 1);

    for (agent, _dir) in peers {
        agent.shutdown().await;
    }
    observer.shutdown().await;
    tracker.stop().await;
}

#[tokio::test]
async fn test_disconnect_removes_peer_and_files() {
    let tracker = TestTracker::start().await;

    let mut carol = RawPeer::connect(&tracker.addr).await;
    assert_eq!(carol.send("REGISTER carol 9100").await, "OK");
    assert_eq!(carol.send("PUBLISH a.txt").await, "OK");
    assert_eq!(carol.send("PUBLISH b.txt").await, "OK");
    assert_eq!(tracker.registry.peer_count().await, 1);
    drop(carol);

    let registry = tracker.registry.clone();
    assert!(
        eventually(|| {
            let registry = registry.clone();
            async move { registry.peer_count().await == 0 }
        })
        .await,
        "Peer should be deregistered after disconnect"
    );
    assert!(tracker.registry.lookup("a.txt").await.is_empty());
    assert!(tracker.registry.lookup("b.txt").await.is_empty());
    assert_eq!(tracker.registry.file_count().await, 0);

    tracker.stop().await;
}

#[tokio::test]
async fn test_commands_before_register_are_rejected() {
    let tracker = TestTracker::start().await;

    let mut stranger = RawPeer::connect(&tracker.addr).await;
    assert_eq!(stranger.send("PUBLISH x.txt").await, "ERR NOT_REGISTERED");
    assert_eq!(stranger.send("QUERY x.txt").await, "ERR NOT_REGISTERED");
    assert!(stranger.send("REGISTER").await.starts_with("ERR PARSE"));
    assert_eq!(stranger.send("REGISTER zed 9200").await, "OK");
    assert_eq!(stranger.send("QUERY x.txt").await, "PEERS");

    tracker.stop().await;
}

// =============================================================================
// Operator console
// =============================================================================

#[tokio::test]
async fn test_ping_reachable_and_unknown() {
    let tracker = TestTracker::start().await;
    let (alice, _dir) = start_peer(&tracker, "alice").await;
    let console = tracker.console();

    assert!(matches!(
        console.ping("alice").await,
        PingStatus::Reachable(_)
    ));
    assert_eq!(console.ping("nobody").await, PingStatus::UnknownHost);

    let (out, _) = console.execute("ping nobody").await;
    assert_eq!(out, "unknown host 'nobody'");

    alice.shutdown().await;
    tracker.stop().await;
}

#[tokio::test]
async fn test_console_discover_and_quit() {
    let tracker = TestTracker::start().await;
    let (alice, dir) = start_peer(&tracker, "alice").await;
    std::fs::write(dir.path().join("notes.txt"), b"n").unwrap();
    alice.publish(Path::new("notes.txt"), "notes.txt").await.unwrap();

    let console = tracker.console();
    let (out, _) = console.execute("discover alice").await;
    assert_eq!(out, "Files shared by 'alice':\n  - notes.txt (origin)");

    let (_, quit) = console.execute("quit").await;
    assert!(quit);

    // Quit tears down every session; the agent sees its control link drop.
    let TestTracker {
        registry, handle, ..
    } = tracker;
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("Tracker should stop after quit")
        .unwrap()
        .unwrap();
    assert_eq!(registry.peer_count().await, 0);
    assert!(eventually(|| async { !alice.is_connected() }).await);

    alice.shutdown().await;
}
