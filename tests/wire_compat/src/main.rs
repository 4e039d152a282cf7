fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use peerxfer_protocol::relay::{
        FLAG_FILE_DATA, FOO_PACKET, Packet, PacketHeader, split_message,
    };
    use peerxfer_protocol::socks5::{ConnectMessage, REP_SUCCEEDED, destination_hash};
    use peerxfer_protocol::{Envelope, Method, SignalMessage};

    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Parses a fixture envelope, re-serializes it and compares the JSON
    /// values (key order independent).
    fn roundtrip(name: &str) -> Envelope {
        let fixture = load_fixture(name);
        let parsed: Envelope = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to serialize {name}: {e}"));
        assert_eq!(fixture, reserialized, "roundtrip mismatch for {name}");
        parsed
    }

    fn unhex(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    // -- signaling --

    #[test]
    fn offer() {
        let envelope = roundtrip("offer.json");
        let SignalMessage::Offer { file, methods } = envelope.message.clone() else {
            panic!("expected offer");
        };
        assert_eq!(file.mime_type.as_deref(), Some("image/jpeg"));
        assert_eq!(methods, Method::FALLBACK_ORDER.to_vec());
        assert_eq!(envelope.key().peer, "alice@example.com/laptop");
    }

    #[test]
    fn streamhost_offer() {
        let envelope = roundtrip("streamhost_offer.json");
        let SignalMessage::StreamhostOffer { hosts } = envelope.message else {
            panic!("expected streamhost offer");
        };
        assert_eq!(hosts.len(), 2);
        assert!(hosts[0].zeroconf.is_none());
        assert_eq!(hosts[1].zeroconf.as_deref(), Some("_presence._tcp"));
    }

    #[test]
    fn relay_offer() {
        let envelope = roundtrip("relay_offer.json");
        assert!(matches!(
            envelope.message,
            SignalMessage::RelayOffer { port: 443, session: 0x0102_0304, .. }
        ));
    }

    #[test]
    fn in_band_data_is_base64() {
        let envelope = roundtrip("in_band_data.json");
        assert_eq!(
            envelope.message,
            SignalMessage::InBandData {
                seq: 7,
                data: b"hello".to_vec()
            }
        );
    }

    #[test]
    fn in_band_opened() {
        let envelope = roundtrip("in_band_opened.json");
        assert_eq!(envelope.message, SignalMessage::InBandOpened { block_size: 1024 });
    }

    #[test]
    fn cancel() {
        let envelope = roundtrip("cancel.json");
        assert_eq!(envelope.message.kind(), "cancel");
    }

    #[test]
    fn unit_messages_carry_only_their_tag() {
        for (message, json) in [
            (SignalMessage::Decline, r#"{"type":"decline"}"#),
            (SignalMessage::StreamhostFailed, r#"{"type":"streamhost_failed"}"#),
            (SignalMessage::RelayFailed, r#"{"type":"relay_failed"}"#),
            (SignalMessage::InBandClose, r#"{"type":"in_band_close"}"#),
            (
                SignalMessage::Cancel {
                    reason: String::new(),
                },
                r#"{"type":"cancel"}"#,
            ),
        ] {
            assert_eq!(serde_json::to_string(&message).unwrap(), json);
        }
    }

    // -- relay framing --

    const DATA_FRAME: &str = "35000000\
        04030201 01000000 0000000000000000 0500000000000000 05000000 30000001\
        00000000 00000000 0000000000000000 68656c6c6f";

    const ACK_FRAME: &str = "30000000\
        04030201 02000000 0000000000000000 0500000000000000 00000000 02000000\
        01000000 00000000 0500000000000000";

    const HANDSHAKE_FRAME: &str = "30000000\
        00000000 00000000 0000000000000000 0000000000000000 00000000 00010000\
        00010203 04050607 08090a0b0c0d0e0f";

    fn frame(s: &str) -> Vec<u8> {
        unhex(&s.replace(' ', ""))
    }

    #[test]
    fn foo_probe_bytes() {
        assert_eq!(FOO_PACKET.to_vec(), unhex("04000000666f6f00"));
    }

    #[test]
    fn data_packet_bytes() {
        let packets = split_message(0x0102_0304, 1, b"hello", 1352);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].header.flags, FLAG_FILE_DATA);
        assert_eq!(packets[0].encode().unwrap(), frame(DATA_FRAME));
        assert_eq!(Packet::decode(&frame(DATA_FRAME)).unwrap(), packets[0]);
    }

    #[test]
    fn ack_packet_bytes() {
        let data = Packet::decode(&frame(DATA_FRAME)).unwrap();
        let ack = Packet::control(PacketHeader::ack_for(&data.header));
        assert!(ack.header.is_ack());
        assert_eq!(ack.encode().unwrap(), frame(ACK_FRAME));
    }

    #[test]
    fn handshake_packet_bytes() {
        let nonce: [u8; 16] = std::array::from_fn(|i| i as u8);
        let handshake = Packet::control(PacketHeader::handshake(&nonce));
        assert_eq!(handshake.encode().unwrap(), frame(HANDSHAKE_FRAME));

        let parsed = Packet::decode(&frame(HANDSHAKE_FRAME)).unwrap();
        assert!(parsed.header.is_handshake());
        assert_eq!(parsed.header.nonce(), nonce);
    }

    // -- socks5 --

    #[test]
    fn destination_hash_vector() {
        assert_eq!(
            destination_hash("sid-1", "alice@example.com/laptop", "bob@example.com/desk"),
            "a9177438c88ab7cc920a2fd4a54870eb70453cea"
        );
    }

    #[test]
    fn connect_request_bytes() {
        let hash = "a9177438c88ab7cc920a2fd4a54870eb70453cea";
        let mut expected = vec![0x05, 0x01, 0x00, 0x03, 40];
        expected.extend_from_slice(hash.as_bytes());
        expected.extend_from_slice(&[0x00, 0x00]);
        assert_eq!(ConnectMessage::request(hash).encode().unwrap(), expected);

        let reply = ConnectMessage::reply(REP_SUCCEEDED, hash).encode().unwrap();
        assert_eq!(reply[..2], [0x05, 0x00]);
        assert_eq!(reply.len(), expected.len());
    }
}
