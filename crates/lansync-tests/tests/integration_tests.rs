//! Integration tests for LanSync
//!
//! Two or more nodes run in one process on loopback. Discovery is fed by
//! hand so the tests never touch the multicast group.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use lansync_compression::CompressionAlgorithm;
use lansync_engine::{SyncEvent, SyncOrchestrator};
use lansync_network::{
    Connection, Envelope, FileChunk, FileHeader, HeartbeatInfo, ManifestPayload, Message,
    PeerDirectory, PeerInfo, SessionConfig, SyncSession,
};
use lansync_sync::{conflict_path, LocalManifest, ManifestBuilder, ManifestOptions};
use lansync_tests::test_utils::{
    generate_test_data, introduce, introduce_both, partial_files, start_node, write_file,
    TestDataPattern, BASE_MTIME,
};
use lansync_types::{
    ConflictPolicy, ContentHash, FileEntry, Manifest, Peer, PeerState, TransferState,
};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::test]
async fn test_newest_wins_pulls_newer_remote_copy() {
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    write_file(a_dir.path(), "notes.txt", b"first draft", BASE_MTIME).unwrap();
    write_file(b_dir.path(), "notes.txt", b"second draft", BASE_MTIME + 60_000).unwrap();

    let a = start_node(a_dir.path(), "node-a").await.unwrap();
    let b = start_node(b_dir.path(), "node-b").await.unwrap();
    introduce_both(&a, &b).await.unwrap();

    let stats = timeout(TEST_TIMEOUT, a.sync_with_peer("node-b"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(stats.files_downloaded, 1);
    assert_eq!(stats.bytes_downloaded, 12);
    assert_eq!(stats.errors, 0);
    assert_eq!(
        fs::read(a_dir.path().join("notes.txt")).unwrap(),
        b"second draft"
    );
    let entry = a.local_manifest().get("notes.txt").await.unwrap();
    assert_eq!(entry.content_hash, ContentHash::of(b"second draft"));
    assert_eq!(entry.modified_at, BASE_MTIME + 60_000);

    // B already has the newer copy, nothing moves the other way
    let stats = timeout(TEST_TIMEOUT, b.sync_with_peer("node-a"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.files_downloaded, 0);
    assert_eq!(stats.errors, 0);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_two_nodes_converge() {
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    write_file(a_dir.path(), "only-a.txt", b"from a", BASE_MTIME).unwrap();
    write_file(
        a_dir.path(),
        "docs/report.bin",
        &generate_test_data(300_000, TestDataPattern::Noise),
        BASE_MTIME,
    )
    .unwrap();
    write_file(
        b_dir.path(),
        "only-b.log",
        &generate_test_data(200_000, TestDataPattern::Text),
        BASE_MTIME,
    )
    .unwrap();
    write_file(b_dir.path(), "empty.txt", b"", BASE_MTIME).unwrap();

    let a = start_node(a_dir.path(), "node-a").await.unwrap();
    let b = start_node(b_dir.path(), "node-b").await.unwrap();
    introduce_both(&a, &b).await.unwrap();

    let pulled_by_a = timeout(TEST_TIMEOUT, a.sync_with_peer("node-b"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pulled_by_a.files_downloaded, 2);
    assert_eq!(pulled_by_a.files_to_upload, 2);

    let pulled_by_b = timeout(TEST_TIMEOUT, b.sync_with_peer("node-a"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pulled_by_b.files_downloaded, 2);
    assert_eq!(pulled_by_b.files_to_upload, 0);

    let a_manifest = a.local_manifest().snapshot().await;
    let b_manifest = b.local_manifest().snapshot().await;
    assert_eq!(a_manifest.len(), 4);
    for entry in a_manifest.iter() {
        let other = b_manifest.get(&entry.relative_path).unwrap();
        assert!(entry.is_identical(other), "{} differs", entry.relative_path);
    }
    assert_eq!(
        fs::read(b_dir.path().join("docs/report.bin")).unwrap(),
        generate_test_data(300_000, TestDataPattern::Noise)
    );

    // Served counters land on the responder once it reads the last ack
    timeout(TEST_TIMEOUT, async {
        while b.get_stats().await.files_served < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(a.get_stats().await.sessions.files_synced, 2);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_keep_both_renames_local_loser() {
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    write_file(a_dir.path(), "plan.md", b"mine", BASE_MTIME).unwrap();
    write_file(b_dir.path(), "plan.md", b"theirs", BASE_MTIME + 1_000).unwrap();

    let mut config = lansync_tests::test_utils::node_config(a_dir.path(), "node-a");
    config.sync.conflict_policy = ConflictPolicy::KeepBoth;
    let a = SyncOrchestrator::with_config(config).unwrap();
    a.start().await.unwrap();
    let b = start_node(b_dir.path(), "node-b").await.unwrap();
    introduce_both(&a, &b).await.unwrap();

    let stats = timeout(TEST_TIMEOUT, a.sync_with_peer("node-b"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.files_downloaded, 1);

    let kept = conflict_path("plan.md", "node-a");
    assert_eq!(fs::read(a_dir.path().join("plan.md")).unwrap(), b"theirs");
    assert_eq!(fs::read(a_dir.path().join(&kept)).unwrap(), b"mine");
    let manifest = a.local_manifest().snapshot().await;
    assert!(manifest.contains("plan.md"));
    assert!(manifest.contains(&kept));

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_sync_events_follow_the_session() {
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    write_file(b_dir.path(), "photo.raw", &[7u8; 5_000], BASE_MTIME).unwrap();

    let a = SyncOrchestrator::with_config(lansync_tests::test_utils::node_config(
        a_dir.path(),
        "node-a",
    ))
    .unwrap();
    let mut events = a.take_events().unwrap();
    a.start().await.unwrap();
    let b = start_node(b_dir.path(), "node-b").await.unwrap();
    introduce_both(&a, &b).await.unwrap();

    timeout(TEST_TIMEOUT, a.sync_with_peer("node-b"))
        .await
        .unwrap()
        .unwrap();

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::FileSynced { path, bytes, .. } = &event {
            assert_eq!(path, "photo.raw");
            assert_eq!(*bytes, 5_000);
        }
        names.push(event.name());
    }
    assert_eq!(
        names,
        vec![
            "peer:discovered",
            "sync:started",
            "file:synced",
            "sync:completed"
        ]
    );

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_sync_with_all_continues_past_failing_peer() {
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    write_file(b_dir.path(), "shared.txt", b"hello", BASE_MTIME).unwrap();

    let a = start_node(a_dir.path(), "node-a").await.unwrap();
    let b = start_node(b_dir.path(), "node-b").await.unwrap();
    introduce_both(&a, &b).await.unwrap();

    // A port nobody listens on
    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    introduce(&a, "node-dead", closed_port).await.unwrap();

    let results = timeout(TEST_TIMEOUT, a.sync_with_all()).await.unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results["node-dead"].errors, 1);
    assert_eq!(results["node-dead"].files_downloaded, 0);
    assert_eq!(results["node-b"].files_downloaded, 1);
    assert_eq!(results["node-b"].errors, 0);
    assert!(a_dir.path().join("shared.txt").is_file());

    let stats = a.get_stats().await;
    assert_eq!(stats.sessions.sessions_completed, 1);
    assert_eq!(stats.sessions.sessions_failed, 1);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_goodbye_removes_peer() {
    let a_dir = TempDir::new().unwrap();
    let a = start_node(a_dir.path(), "node-a").await.unwrap();
    introduce(&a, "node-b", 4000).await.unwrap();

    let peers = a.get_peers().await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].state, PeerState::Alive);
    assert_eq!(peers[0].address.port(), 4000);

    let goodbye = Envelope::seal("node-b", &Message::Goodbye).unwrap();
    a.handle_discovery(&goodbye, "127.0.0.1:42420".parse().unwrap())
        .await
        .unwrap();

    assert!(a.get_peers().await.is_empty());
    assert!(a.sync_with_peer("node-b").await.is_err());

    a.stop().await.unwrap();
}

#[tokio::test]
async fn test_silent_peer_goes_stale_then_is_reaped() {
    let directory = PeerDirectory::new(
        "node-a",
        Duration::from_secs(15),
        Duration::from_secs(60),
    );
    let source = "127.0.0.1:42420".parse().unwrap();
    let info = PeerInfo::new("desk", 4000, Vec::new());
    let start = Utc::now();

    let beat = HeartbeatInfo { transfer_port: 4000 };
    for message in [Message::Announce(info), Message::Heartbeat(beat)] {
        let envelope = Envelope::seal("node-b", &message).unwrap();
        directory.handle(&envelope, source, start).await.unwrap();
    }
    assert_eq!(directory.alive_peers(start).await.len(), 1);

    // Past the timeout the record stays but is no longer a sync target
    let later = start + chrono::Duration::seconds(20);
    assert!(directory.alive_peers(later).await.is_empty());
    directory.reap(later).await;
    let peer = directory.get("node-b").await.unwrap();
    assert_eq!(peer.state, PeerState::Stale);
    assert_eq!(directory.len().await, 1);

    let much_later = start + chrono::Duration::seconds(90);
    directory.reap(much_later).await;
    assert!(directory.get("node-b").await.is_none());
}

/// Serve a manifest with one large file, then hang up after `chunks_sent`
/// chunks of it.
async fn truncating_responder(
    connection: &mut Connection<tokio::io::DuplexStream>,
    content: &[u8],
    chunk_size: usize,
    chunks_sent: usize,
) {
    match connection.expect_message().await.unwrap() {
        Message::SyncRequest(_) => {}
        other => panic!("expected SYNC_REQUEST, got {:?}", other),
    }

    let mut manifest = Manifest::new();
    manifest.insert(FileEntry::new(
        "big.bin",
        ContentHash::of(content),
        content.len() as u64,
        BASE_MTIME,
    ));
    connection
        .send_message(&Message::SyncManifest(ManifestPayload { manifest }))
        .await
        .unwrap();

    match connection.expect_message().await.unwrap() {
        Message::SyncDelta(delta) => assert_eq!(delta.download, vec!["big.bin".to_string()]),
        other => panic!("expected SYNC_DELTA, got {:?}", other),
    }
    match connection.expect_message().await.unwrap() {
        Message::FileRequest(request) => assert_eq!(request.path, "big.bin"),
        other => panic!("expected FILE_REQUEST, got {:?}", other),
    }

    connection
        .send_message(&Message::FileHeader(FileHeader {
            path: "big.bin".to_string(),
            size: content.len() as u64,
            hash: ContentHash::of(content),
            modified_at: BASE_MTIME,
            compression: CompressionAlgorithm::None,
            chunk_size: chunk_size as u32,
        }))
        .await
        .unwrap();

    for (index, chunk) in content.chunks(chunk_size).take(chunks_sent).enumerate() {
        connection
            .send_message(&Message::FileChunk(FileChunk {
                path: "big.bin".to_string(),
                index: index as u64,
                compressed_size: chunk.len() as u32,
            }))
            .await
            .unwrap();
        connection
            .send_raw(Bytes::copy_from_slice(chunk))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_truncated_transfer_leaves_no_partial_file() {
    const CHUNK_SIZE: usize = 64 * 1024;
    let dir = TempDir::new().unwrap();
    let local = Arc::new(LocalManifest::new(
        ManifestBuilder::new(dir.path(), ManifestOptions::default()).unwrap(),
    ));
    local.rescan().await.unwrap();

    let content = generate_test_data(10 * 1024 * 1024, TestDataPattern::Zeros);
    let (client, server) = tokio::io::duplex(1024 * 1024);
    let responder = tokio::spawn(async move {
        let mut connection = Connection::new(server, "node-b", "node-a", 16 * 1024 * 1024);
        truncating_responder(&mut connection, &content, CHUNK_SIZE, 100).await;
        // Dropping the connection closes the stream mid-file
    });

    let peer = Peer::announced(
        "node-b",
        "desk",
        "127.0.0.1:4000".parse().unwrap(),
        Utc::now(),
    );
    let session = SyncSession::new("node-a", peer, Arc::clone(&local), SessionConfig::default());
    let connection = Connection::new(client, "node-a", "node-b", 16 * 1024 * 1024);

    let report = timeout(TEST_TIMEOUT, session.run_over(connection))
        .await
        .unwrap();
    responder.await.unwrap();

    assert!(!report.is_complete());
    assert_eq!(report.stats.errors, 1);
    assert_eq!(report.stats.files_downloaded, 0);
    assert_eq!(report.stats.failed_paths, vec!["big.bin".to_string()]);
    assert_eq!(report.tasks.len(), 1);
    assert_eq!(report.tasks[0].state, TransferState::Failed);
    assert_eq!(report.tasks[0].bytes_transferred, 100 * CHUNK_SIZE as u64);

    assert!(!dir.path().join("big.bin").exists());
    assert!(partial_files(dir.path()).is_empty());
    assert!(local.get("big.bin").await.is_none());
}

#[tokio::test]
async fn test_excluded_remote_file_is_skipped() {
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    write_file(b_dir.path(), "keep.txt", b"keep", BASE_MTIME).unwrap();
    write_file(b_dir.path(), "draft.swp", b"swap", BASE_MTIME).unwrap();

    let a = start_node(a_dir.path(), "node-a").await.unwrap();
    let mut b_config = lansync_tests::test_utils::node_config(b_dir.path(), "node-b");
    b_config.node.exclude.clear();
    let b = SyncOrchestrator::with_config(b_config).unwrap();
    b.start().await.unwrap();
    introduce_both(&a, &b).await.unwrap();

    let stats = timeout(TEST_TIMEOUT, a.sync_with_peer("node-b"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(stats.files_downloaded, 1);
    assert_eq!(stats.files_skipped, 1);
    assert_eq!(stats.errors, 0);
    assert!(!a_dir.path().join("draft.swp").exists());
    assert!(a_dir.path().join("keep.txt").is_file());

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn manifest_hashes_match_file_content(
            files in proptest::collection::btree_map("[a-z]{1,8}", proptest::collection::vec(any::<u8>(), 0..4096), 1..6)
        ) {
            let dir = TempDir::new().unwrap();
            for (name, data) in &files {
                write_file(dir.path(), &format!("{}.dat", name), data, BASE_MTIME).unwrap();
            }

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let manifest = runtime.block_on(async {
                let mut builder = ManifestBuilder::new(dir.path(), ManifestOptions::default()).unwrap();
                builder.build().await.unwrap()
            });

            prop_assert_eq!(manifest.len(), files.len());
            for (name, data) in &files {
                let entry = manifest.get(&format!("{}.dat", name)).unwrap();
                prop_assert_eq!(entry.content_hash, ContentHash::of(data));
                prop_assert_eq!(entry.size_bytes, data.len() as u64);
                prop_assert_eq!(entry.modified_at, BASE_MTIME);
            }
        }
    }
}
