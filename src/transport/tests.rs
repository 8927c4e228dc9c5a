//! Transport Module Tests
//!
//! Exercises the correlation contract end to end against a scripted fake
//! node on a loopback socket: out-of-order responses, timeouts with late
//! replies, and the disconnect sweep.

#[cfg(test)]
mod tests {
    use crate::error::Fault;
    use crate::protocol::codec::{FrameReader, FrameWriter};
    use crate::protocol::types::{encode_payload, Frame, InventoryBatch, InventoryEntry, EVENT_INVENTORY};
    use crate::transport::link::{LinkEvent, NodeLink};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    /// Connects a link to a freshly bound listener and hands the accepted
    /// stream (the "node side") to the caller's script.
    async fn link_pair() -> (Arc<NodeLink>, TcpStream, mpsc::Receiver<LinkEvent>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (events_tx, events_rx) = mpsc::channel(64);
        let link = NodeLink::start(client, events_tx);

        (link, server, events_rx)
    }

    #[tokio::test]
    async fn test_concurrent_calls_get_matching_responses() {
        let (link, server, _events) = link_pair().await;
        let (read_half, write_half) = server.into_split();

        // Node side: buffer all commands, then answer them in reverse order,
        // echoing each command's payload back.
        tokio::spawn(async move {
            let mut reader = FrameReader::new(read_half);
            let mut writer = FrameWriter::new(write_half);
            let mut seen = Vec::new();

            for _ in 0..16 {
                if let Frame::Command { index, payload, .. } = reader.read_frame().await.unwrap() {
                    seen.push((index, payload));
                }
            }

            for (index, payload) in seen.into_iter().rev() {
                writer
                    .write_frame(&Frame::Response {
                        index,
                        result: Ok(payload),
                    })
                    .await
                    .unwrap();
            }
        });

        let mut handles = Vec::new();
        for i in 0..16u32 {
            let link = link.clone();
            handles.push(tokio::spawn(async move {
                let payload = format!("call-{}", i).into_bytes();
                let reply = link
                    .call("ping", payload.clone(), Duration::from_secs(5))
                    .await
                    .unwrap();
                assert_eq!(reply, payload, "caller {} got someone else's response", i);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(link.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_faults_only_the_waiting_call() {
        let (link, server, _events) = link_pair().await;
        let (read_half, write_half) = server.into_split();

        tokio::spawn(async move {
            let mut reader = FrameReader::new(read_half);
            let mut writer = FrameWriter::new(write_half);

            // First command: sit on it past the caller's deadline, then
            // answer anyway (the late response must be discarded).
            let first = match reader.read_frame().await.unwrap() {
                Frame::Command { index, .. } => index,
                other => panic!("unexpected frame: {:?}", other),
            };
            tokio::time::sleep(Duration::from_millis(200)).await;
            writer
                .write_frame(&Frame::Response {
                    index: first,
                    result: Ok(b"too late".to_vec()),
                })
                .await
                .unwrap();

            // Second command: answer promptly.
            if let Frame::Command { index, .. } = reader.read_frame().await.unwrap() {
                writer
                    .write_frame(&Frame::Response {
                        index,
                        result: Ok(b"on time".to_vec()),
                    })
                    .await
                    .unwrap();
            }
        });

        let outcome = link
            .call("ping", vec![], Duration::from_millis(50))
            .await;
        assert_eq!(outcome, Err(Fault::Timeout));

        // The link survives the late response and keeps serving calls.
        let reply = link
            .call("ping", vec![], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply, b"on time");
        assert_eq!(link.pending_count(), 0);
        assert!(link.is_alive());
    }

    #[tokio::test]
    async fn test_disconnect_drains_all_pending_calls() {
        let (link, server, mut events) = link_pair().await;
        let (read_half, write_half) = server.into_split();

        // Node side: swallow commands, never answer, then vanish.
        let reader_task = tokio::spawn(async move {
            let _write_half = write_half;
            let mut reader = FrameReader::new(read_half);
            for _ in 0..8 {
                reader.read_frame().await.unwrap();
            }
            // read half + write half dropped here: connection closes.
        });

        let mut handles = Vec::new();
        for _ in 0..8 {
            let link = link.clone();
            handles.push(tokio::spawn(async move {
                // Generous deadline: resolution must come from the sweep,
                // not from the timer.
                link.call("ping", vec![], Duration::from_secs(30)).await
            }));
        }

        reader_task.await.unwrap();

        for handle in handles {
            match handle.await.unwrap() {
                Err(Fault::NodeUnavailable(_)) => {}
                other => panic!("expected unavailable fault, got {:?}", other),
            }
        }

        assert_eq!(link.pending_count(), 0);
        assert!(!link.is_alive());

        match events.recv().await {
            Some(LinkEvent::Disconnected { .. }) => {}
            other => panic!("expected disconnect event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_issue_on_dead_link_fails_fast() {
        let (link, server, _events) = link_pair().await;
        drop(server);

        // Give the reader loop a moment to observe the close.
        tokio::time::sleep(Duration::from_millis(50)).await;

        match link.call("ping", vec![], Duration::from_secs(5)).await {
            Err(Fault::NodeUnavailable(_)) => {}
            other => panic!("expected unavailable fault, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inventory_events_bypass_the_pending_table() {
        let (link, server, mut events) = link_pair().await;
        let (_read_half, write_half) = server.into_split();

        let batch = InventoryBatch {
            entries: vec![InventoryEntry {
                path: "/site/a.rar".to_string(),
                size: 1024,
                modified_ms: 1,
                checksum: None,
            }],
        };

        let mut writer = FrameWriter::new(write_half);
        writer
            .write_frame(&Frame::Event {
                name: EVENT_INVENTORY.to_string(),
                payload: encode_payload(&batch).unwrap(),
            })
            .await
            .unwrap();

        match events.recv().await {
            Some(LinkEvent::Inventory(received)) => {
                assert_eq!(received.entries, batch.entries);
            }
            other => panic!("expected inventory event, got {:?}", other),
        }

        assert_eq!(link.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_correlation_indices_unique_among_outstanding() {
        let (link, server, _events) = link_pair().await;
        let (read_half, _write_half) = server.into_split();

        // Node side keeps the connection open but never answers.
        tokio::spawn(async move {
            let mut reader = FrameReader::new(read_half);
            while reader.read_frame().await.is_ok() {}
        });

        let mut indices = std::collections::HashSet::new();
        let mut replies = Vec::new();
        for _ in 0..64 {
            let reply = link.issue("ping", vec![]).await.unwrap();
            assert!(indices.insert(reply.index()), "index reused while pending");
            replies.push(reply);
        }

        assert_eq!(link.pending_count(), 64);
    }
}
