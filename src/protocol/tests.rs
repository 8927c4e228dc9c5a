//! Protocol Module Tests
//!
//! Validates the wire framing and host-mask authorization logic.

#[cfg(test)]
mod tests {
    use crate::error::Fault;
    use crate::protocol::codec::{FrameReader, FrameWriter};
    use crate::protocol::mask::{compile_glob, HostMask, MaskSet};
    use crate::protocol::types::*;
    use std::net::IpAddr;

    // ============================================================
    // FRAME CODEC TESTS
    // ============================================================

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let frame = Frame::Command {
            index: 7,
            name: CMD_DELETE.to_string(),
            payload: encode_payload(&DeleteArgs {
                path: "/incoming/old.iso".to_string(),
            })
            .unwrap(),
        };

        writer.write_frame(&frame).await.unwrap();

        match reader.read_frame().await.unwrap() {
            Frame::Command {
                index,
                name,
                payload,
            } => {
                assert_eq!(index, 7);
                assert_eq!(name, CMD_DELETE);
                let args: DeleteArgs = decode_payload(&payload).unwrap();
                assert_eq!(args.path, "/incoming/old.iso");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_frames_preserve_order_on_one_connection() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        for index in 0..10u32 {
            writer
                .write_frame(&Frame::Response {
                    index,
                    result: Ok(vec![]),
                })
                .await
                .unwrap();
        }

        for expected in 0..10u32 {
            match reader.read_frame().await.unwrap() {
                Frame::Response { index, .. } => assert_eq!(index, expected),
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_fault_response_roundtrip() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer
            .write_frame(&Frame::Response {
                index: 3,
                result: Err(Fault::OperationNotSupported("zipscan".to_string())),
            })
            .await
            .unwrap();

        match reader.read_frame().await.unwrap() {
            Frame::Response { index, result } => {
                assert_eq!(index, 3);
                assert_eq!(
                    result,
                    Err(Fault::OperationNotSupported("zipscan".to_string()))
                );
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_is_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(server);

        // Claim a frame far beyond the cap.
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        assert!(reader.read_frame().await.is_err());
    }

    // ============================================================
    // HOST MASK TESTS
    // ============================================================

    #[test]
    fn test_exact_mask() {
        let mask = HostMask::new("127.0.0.1").unwrap();
        let addr: IpAddr = "127.0.0.1".parse().unwrap();
        let other: IpAddr = "127.0.0.2".parse().unwrap();

        assert!(mask.matches(&addr));
        assert!(!mask.matches(&other));
    }

    #[test]
    fn test_wildcard_mask() {
        let mask = HostMask::new("192.168.1.*").unwrap();

        let inside: IpAddr = "192.168.1.42".parse().unwrap();
        let outside: IpAddr = "192.168.2.42".parse().unwrap();

        assert!(mask.matches(&inside));
        assert!(!mask.matches(&outside));
    }

    #[test]
    fn test_dot_is_not_a_wildcard() {
        // "10.0.0.1" must not match "10x0y0z1" via regex dot semantics.
        let mask = HostMask::new("10.0.0.1").unwrap();
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(mask.matches(&addr));
        assert!(!compile_glob("10.0.0.1").unwrap().is_match("10a0b0c1"));
    }

    #[test]
    fn test_empty_mask_set_allows_all() {
        let set = MaskSet::default();
        let addr: IpAddr = "203.0.113.9".parse().unwrap();
        assert!(set.allows(&addr));
    }

    #[test]
    fn test_mask_set_any_match_wins() {
        let set = MaskSet::new(&["10.*".to_string(), "127.0.0.1".to_string()]).unwrap();

        let local: IpAddr = "127.0.0.1".parse().unwrap();
        let lan: IpAddr = "10.1.2.3".parse().unwrap();
        let wan: IpAddr = "8.8.8.8".parse().unwrap();

        assert!(set.allows(&local));
        assert!(set.allows(&lan));
        assert!(!set.allows(&wan));
    }
}
