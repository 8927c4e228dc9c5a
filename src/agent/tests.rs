//! Agent Module Tests
//!
//! Covers the handler registry, the filesystem store operations, the
//! inventory walk with pause/resume, and a full handshake + command
//! session against a scripted master socket.

#[cfg(test)]
mod tests {
    use crate::agent::fs::NodeStore;
    use crate::agent::node::{AgentConfig, NodeAgent};
    use crate::agent::registry::CommandRegistry;
    use crate::error::Fault;
    use crate::protocol::codec::{FrameReader, FrameWriter};
    use crate::protocol::types::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::{mpsc, watch};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn store_with_files(files: &[(&str, &str)]) -> (tempfile::TempDir, Arc<NodeStore>) {
        let dir = tempfile::tempdir().unwrap();
        for (path, contents) in files {
            let full = dir.path().join(path.trim_start_matches('/'));
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, contents).unwrap();
        }
        let store = NodeStore::new(dir.path().to_path_buf(), GIB);
        (dir, store)
    }

    // ============================================================
    // REGISTRY TESTS
    // ============================================================

    #[tokio::test]
    async fn test_unknown_command_is_a_typed_fault() {
        let registry = CommandRegistry::new();
        registry.register("echo", |payload| async move { Ok(payload) });

        let reply = registry.dispatch("echo", b"hi".to_vec()).await.unwrap();
        assert_eq!(reply, b"hi");

        match registry.dispatch("nosuch", vec![]).await {
            Err(Fault::OperationNotSupported(name)) => assert_eq!(name, "nosuch"),
            other => panic!("expected unsupported fault, got {:?}", other),
        }
    }

    // ============================================================
    // FILESYSTEM STORE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_path_escape_is_rejected() {
        let (_dir, store) = store_with_files(&[]);

        match store.delete("/../outside").await {
            Err(Fault::Rejected(_)) => {}
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_and_rename() {
        let (_dir, store) = store_with_files(&[("/incoming/a.iso", "data")]);

        store
            .rename("/incoming/a.iso", "/archive", "a.iso")
            .await
            .unwrap();
        let entries = store.listing("/archive").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.iso");
        assert_eq!(entries[0].size, 4);

        store.delete("/archive/a.iso").await.unwrap();
        assert!(store.listing("/archive").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_checksum_is_stable_and_content_sensitive() {
        let (_dir, store) =
            store_with_files(&[("/a.bin", "same"), ("/b.bin", "same"), ("/c.bin", "other")]);

        let a = store.checksum("/a.bin").await.unwrap();
        let b = store.checksum("/b.bin").await.unwrap();
        let c = store.checksum("/c.bin").await.unwrap();

        // SHA3-256 hex digest.
        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_disk_status_reflects_usage() {
        let (_dir, store) = store_with_files(&[("/x/one", "12345"), ("/two", "123")]);

        let status = store.disk_status().await.unwrap();
        assert_eq!(status.total_bytes, GIB);
        assert_eq!(status.free_bytes, GIB - 8);
        assert_eq!(status.active_transfers, 0);
    }

    #[tokio::test]
    async fn test_integrity_check_flags_mismatches() {
        let (_dir, store) = store_with_files(&[("/good", "aaa"), ("/bad", "bbb")]);

        let good_sum = store.checksum("/good").await.unwrap();

        let reply = store
            .integrity_check(&IntegrityCheckArgs {
                path: "/".to_string(),
                job_id: "job-1".to_string(),
                expected: vec![
                    ("/good".to_string(), good_sum),
                    ("/bad".to_string(), "0".repeat(64)),
                    ("/gone".to_string(), "0".repeat(64)),
                ],
            })
            .await
            .unwrap();

        assert_eq!(reply.checked, 3);
        assert!(!reply.aborted);
        assert_eq!(reply.corrupt, vec!["/bad", "/gone"]);
    }

    #[tokio::test]
    async fn test_aborted_integrity_check_stops_at_first_checkpoint() {
        let (_dir, store) = store_with_files(&[("/a", "1"), ("/b", "2")]);

        // Raise the abort flag before the scan reaches its first file.
        store.register_job("scan-1");
        store.abort_job("scan-1").unwrap();

        let reply = store
            .integrity_check(&IntegrityCheckArgs {
                path: "/".to_string(),
                job_id: "scan-1".to_string(),
                expected: vec![
                    ("/a".to_string(), "0".repeat(64)),
                    ("/b".to_string(), "0".repeat(64)),
                ],
            })
            .await
            .unwrap();

        assert!(reply.aborted);
        assert_eq!(reply.checked, 0);
    }

    #[tokio::test]
    async fn test_abort_unknown_job_is_rejected() {
        let (_dir, store) = store_with_files(&[]);

        match store.abort_job("nope") {
            Err(Fault::Rejected(_)) => {}
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    // ============================================================
    // INVENTORY WALK TESTS
    // ============================================================

    #[tokio::test]
    async fn test_walk_batches_every_file_once() {
        let (_dir, store) = store_with_files(&[
            ("/site/a", "1"),
            ("/site/sub/b", "22"),
            ("/site/sub/c", "333"),
        ]);

        let (_pause_tx, pause_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::channel(8);

        store.walk_inventory("/", 2, pause_rx, tx).await.unwrap();

        let mut paths = Vec::new();
        while let Some(batch) = rx.recv().await {
            assert!(batch.entries.len() <= 2);
            paths.extend(batch.entries.into_iter().map(|e| e.path));
        }
        paths.sort();

        assert_eq!(paths, vec!["/site/a", "/site/sub/b", "/site/sub/c"]);
    }

    #[tokio::test]
    async fn test_walk_blocks_while_paused() {
        let (_dir, store) = store_with_files(&[("/a", "1"), ("/b", "2")]);

        let (pause_tx, pause_rx) = watch::channel(true);
        let (tx, mut rx) = mpsc::channel(8);

        let walker = {
            let store = store.clone();
            tokio::spawn(async move { store.walk_inventory("/", 1, pause_rx, tx).await })
        };

        // Paused from the start: nothing may come out.
        let early = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(early.is_err(), "walk emitted a batch while paused");

        pause_tx.send(true).ok();
        pause_tx.send(false).unwrap();

        let mut count = 0;
        while let Some(batch) = rx.recv().await {
            count += batch.entries.len();
        }
        assert_eq!(count, 2);
        walker.await.unwrap().unwrap();
    }

    // ============================================================
    // SESSION TESTS
    // ============================================================

    fn agent_config(addr: &str, root: std::path::PathBuf) -> AgentConfig {
        AgentConfig {
            name: "alpha".to_string(),
            master_addr: addr.to_string(),
            root,
            capacity_bytes: GIB,
            extensions: vec![EXT_BASIC.to_string(), EXT_TRANSFER.to_string()],
            capabilities: Capabilities {
                encrypted_channel: false,
            },
        }
    }

    #[tokio::test]
    async fn test_session_handshake_and_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hello").unwrap();

        let agent = NodeAgent::new(agent_config(&addr.to_string(), dir.path().to_path_buf()));
        let session = tokio::spawn(async move { agent.session().await });

        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        match reader.read_frame().await.unwrap() {
            Frame::Hello {
                name, extensions, ..
            } => {
                assert_eq!(name, "alpha");
                assert!(extensions.contains(&EXT_BASIC.to_string()));
            }
            other => panic!("expected Hello, got {:?}", other),
        }

        writer
            .write_frame(&Frame::Require {
                extensions: vec![EXT_BASIC.to_string()],
            })
            .await
            .unwrap();

        match reader.read_frame().await.unwrap() {
            Frame::HandshakeAck { ok: true, .. } => {}
            other => panic!("expected ack, got {:?}", other),
        }

        // Ping round trip.
        writer
            .write_frame(&Frame::Command {
                index: 1,
                name: CMD_PING.to_string(),
                payload: vec![],
            })
            .await
            .unwrap();
        match reader.read_frame().await.unwrap() {
            Frame::Response { index: 1, result } => assert_eq!(result, Ok(vec![])),
            other => panic!("expected response, got {:?}", other),
        }

        // Listing sees the seeded file.
        writer
            .write_frame(&Frame::Command {
                index: 2,
                name: CMD_LISTING.to_string(),
                payload: encode_payload(&ListingArgs {
                    path: "/".to_string(),
                })
                .unwrap(),
            })
            .await
            .unwrap();
        match reader.read_frame().await.unwrap() {
            Frame::Response {
                index: 2,
                result: Ok(payload),
            } => {
                let reply: ListingReply = decode_payload(&payload).unwrap();
                assert_eq!(reply.entries.len(), 1);
                assert_eq!(reply.entries[0].name, "hello.txt");
            }
            other => panic!("expected listing reply, got {:?}", other),
        }

        // Dropping the master side ends the session cleanly.
        drop(reader);
        drop(writer);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_session_rejects_unsupported_requirements() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let agent = NodeAgent::new(agent_config(&addr.to_string(), dir.path().to_path_buf()));
        let session = tokio::spawn(async move { agent.session().await });

        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        reader.read_frame().await.unwrap(); // Hello

        writer
            .write_frame(&Frame::Require {
                extensions: vec![EXT_BASIC.to_string(), "quantum".to_string()],
            })
            .await
            .unwrap();

        match reader.read_frame().await.unwrap() {
            Frame::HandshakeAck {
                ok: false,
                error: Some(error),
            } => assert!(error.contains("quantum")),
            other => panic!("expected refusal, got {:?}", other),
        }

        assert!(session.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_remerge_streams_batches_then_answers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("f{}", i)), "x").unwrap();
        }

        let agent = NodeAgent::new(agent_config(&addr.to_string(), dir.path().to_path_buf()));
        let _session = tokio::spawn(async move { agent.session().await });

        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        reader.read_frame().await.unwrap(); // Hello
        writer
            .write_frame(&Frame::Require {
                extensions: vec![EXT_BASIC.to_string()],
            })
            .await
            .unwrap();
        reader.read_frame().await.unwrap(); // Ack

        writer
            .write_frame(&Frame::Command {
                index: 9,
                name: CMD_REMERGE.to_string(),
                payload: encode_payload(&RemergeArgs {
                    root: "/".to_string(),
                    batch_size: 2,
                })
                .unwrap(),
            })
            .await
            .unwrap();

        let mut inventoried = 0;
        loop {
            match reader.read_frame().await.unwrap() {
                Frame::Event { name, payload } => {
                    assert_eq!(name, EVENT_INVENTORY);
                    let batch: InventoryBatch = decode_payload(&payload).unwrap();
                    inventoried += batch.entries.len();
                }
                Frame::Response { index: 9, result } => {
                    assert_eq!(result, Ok(vec![]));
                    break;
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }

        assert_eq!(inventoried, 5);
    }
}
