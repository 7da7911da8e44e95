//! MQTT Codec Tests
//!
//! Encoding and decoding of the MQTT v3.1.1 packets exchanged with the broker.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;

use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, SubscribeTopic, UnsubAck, Unsubscribe,
    Will,
};

// ============================================================================
// Helper functions
// ============================================================================

fn encode_packet(packet: &Packet) -> BytesMut {
    let mut buf = BytesMut::new();
    Encoder::new().encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(buf: &[u8]) -> Result<Packet, DecodeError> {
    match Decoder::new().decode(buf)? {
        Some((packet, consumed)) => {
            assert_eq!(consumed, buf.len());
            Ok(packet)
        }
        None => Err(DecodeError::InsufficientData),
    }
}

fn roundtrip(packet: Packet) {
    let encoded = encode_packet(&packet);
    let decoded = decode_packet(&encoded).unwrap();
    assert_eq!(packet, decoded);
}

// ============================================================================
// CONNECT / CONNACK
// ============================================================================

#[test]
fn test_connect_bytes() {
    let packet = Packet::Connect(Box::new(Connect {
        client_id: "gowon_mqttbroker".to_string(),
        clean_session: true,
        keep_alive: 30,
        ..Default::default()
    }));

    let encoded = encode_packet(&packet);
    assert_eq!(encoded[0], 0x10);
    // Variable header: "MQTT", level 4, clean session, keep alive 30
    assert_eq!(&encoded[2..12], &[0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 30]);
    assert_eq!(&encoded[12..14], &[0x00, 16]);
    assert_eq!(&encoded[14..], b"gowon_mqttbroker");
}

#[test]
fn test_connect_with_credentials_and_will() {
    roundtrip(Packet::Connect(Box::new(Connect {
        client_id: "bridge".to_string(),
        clean_session: false,
        keep_alive: 300,
        username: Some("user".to_string()),
        password: Some(Bytes::from("secret")),
        will: Some(Will {
            topic: "gowon/status".to_string(),
            payload: Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
    })));
}

#[test]
fn test_connect_rejects_password_without_username() {
    let encoded = encode_packet(&Packet::Connect(Box::new(Connect {
        client_id: "c".to_string(),
        password: Some(Bytes::from("p")),
        ..Default::default()
    })));
    // Password flag set, username flag clear
    assert_eq!(encoded[9] & 0xC0, 0x40);
    assert_eq!(decode_packet(&encoded), Err(DecodeError::InvalidFlags));
}

#[test]
fn test_connect_rejects_wrong_protocol_level() {
    let mut encoded = encode_packet(&Packet::Connect(Box::default()));
    encoded[8] = 5;
    assert_eq!(
        decode_packet(&encoded),
        Err(DecodeError::InvalidProtocolLevel(5))
    );
}

#[test]
fn test_connack() {
    let encoded = encode_packet(&Packet::ConnAck(ConnAck {
        session_present: true,
        return_code: ConnectReturnCode::Accepted,
    }));
    assert_eq!(&encoded[..], &[0x20, 0x02, 0x01, 0x00]);

    roundtrip(Packet::ConnAck(ConnAck {
        session_present: false,
        return_code: ConnectReturnCode::NotAuthorized,
    }));
}

#[test]
fn test_connack_invalid_return_code() {
    assert_eq!(
        decode_packet(&[0x20, 0x02, 0x00, 0x06]),
        Err(DecodeError::InvalidReturnCode(6))
    );
}

#[test]
fn test_connack_reserved_flags() {
    assert_eq!(
        decode_packet(&[0x20, 0x02, 0x02, 0x00]),
        Err(DecodeError::InvalidFlags)
    );
}

// ============================================================================
// PUBLISH and acknowledgements
// ============================================================================

#[test]
fn test_publish_qos0() {
    let packet = Packet::Publish(Publish {
        topic: Arc::from("/gowon/input"),
        payload: Bytes::from(r#"{"module":"x","command":"y"}"#),
        ..Default::default()
    });

    let encoded = encode_packet(&packet);
    assert_eq!(encoded[0], 0x30);
    roundtrip(packet);
}

#[test]
fn test_publish_qos1_retained() {
    roundtrip(Packet::Publish(Publish {
        dup: true,
        qos: QoS::AtLeastOnce,
        retain: true,
        topic: Arc::from("/gowon/output"),
        packet_id: Some(42),
        payload: Bytes::from_static(b"payload"),
    }));
}

#[test]
fn test_publish_qos2_empty_payload() {
    roundtrip(Packet::Publish(Publish {
        qos: QoS::ExactlyOnce,
        topic: Arc::from("a/b"),
        packet_id: Some(7),
        ..Default::default()
    }));
}

#[test]
fn test_publish_requires_packet_id_for_qos1() {
    let packet = Packet::Publish(Publish {
        qos: QoS::AtLeastOnce,
        topic: Arc::from("a"),
        packet_id: None,
        ..Default::default()
    });
    let mut buf = BytesMut::new();
    assert!(Encoder::new().encode(&packet, &mut buf).is_err());
}

#[test]
fn test_publish_invalid_qos() {
    // QoS bits 11
    let buf = [0x36, 0x05, 0x00, 0x01, b'a', 0x00, 0x01];
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidQoS(3)));
}

#[test]
fn test_publish_dup_with_qos0() {
    let buf = [0x38, 0x03, 0x00, 0x01, b'a'];
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_publish_wildcard_topic() {
    let buf = [0x30, 0x03, 0x00, 0x01, b'#'];
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_publish_zero_packet_id() {
    let buf = [0x32, 0x05, 0x00, 0x01, b'a', 0x00, 0x00];
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_acks() {
    roundtrip(Packet::PubAck(PubAck { packet_id: 1 }));
    roundtrip(Packet::PubRec(PubRec { packet_id: 2 }));
    roundtrip(Packet::PubRel(PubRel { packet_id: 3 }));
    roundtrip(Packet::PubComp(PubComp { packet_id: 4 }));
    roundtrip(Packet::UnsubAck(UnsubAck { packet_id: 5 }));
}

#[test]
fn test_pubrel_requires_flags() {
    assert_eq!(
        decode_packet(&[0x60, 0x02, 0x00, 0x01]),
        Err(DecodeError::InvalidFlags)
    );
}

// ============================================================================
// SUBSCRIBE / UNSUBSCRIBE
// ============================================================================

#[test]
fn test_subscribe() {
    let packet = Packet::Subscribe(Subscribe {
        packet_id: 10,
        topics: vec![
            SubscribeTopic {
                filter: "/gowon/output".to_string(),
                qos: QoS::AtMostOnce,
            },
            SubscribeTopic {
                filter: "sensors/+/temp".to_string(),
                qos: QoS::AtLeastOnce,
            },
        ],
    });

    let encoded = encode_packet(&packet);
    assert_eq!(encoded[0], 0x82);
    roundtrip(packet);
}

#[test]
fn test_subscribe_without_topics() {
    assert!(matches!(
        decode_packet(&[0x82, 0x02, 0x00, 0x01]),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_suback() {
    roundtrip(Packet::SubAck(SubAck {
        packet_id: 10,
        return_codes: vec![
            SubscribeReturnCode::Success(QoS::AtMostOnce),
            SubscribeReturnCode::Success(QoS::ExactlyOnce),
            SubscribeReturnCode::Failure,
        ],
    }));
}

#[test]
fn test_suback_invalid_code() {
    assert_eq!(
        decode_packet(&[0x90, 0x03, 0x00, 0x01, 0x03]),
        Err(DecodeError::InvalidReturnCode(3))
    );
}

#[test]
fn test_unsubscribe() {
    roundtrip(Packet::Unsubscribe(Unsubscribe {
        packet_id: 11,
        filters: vec!["/gowon/output".to_string(), "a/#".to_string()],
    }));
}

// ============================================================================
// Control packets
// ============================================================================

#[test]
fn test_ping_and_disconnect() {
    assert_eq!(&encode_packet(&Packet::PingReq)[..], &[0xC0, 0x00]);
    assert_eq!(&encode_packet(&Packet::PingResp)[..], &[0xD0, 0x00]);
    assert_eq!(&encode_packet(&Packet::Disconnect)[..], &[0xE0, 0x00]);
    roundtrip(Packet::PingReq);
    roundtrip(Packet::PingResp);
    roundtrip(Packet::Disconnect);
}

#[test]
fn test_pingresp_with_flags() {
    assert_eq!(decode_packet(&[0xD1, 0x00]), Err(DecodeError::InvalidFlags));
}

// ============================================================================
// Framing
// ============================================================================

#[test]
fn test_partial_buffers_wait_for_more() {
    let encoded = encode_packet(&Packet::Publish(Publish {
        topic: Arc::from("/gowon/output"),
        payload: Bytes::from_static(b"{\"module\":\"m\"}"),
        ..Default::default()
    }));

    let decoder = Decoder::new();
    for len in 0..encoded.len() {
        assert_eq!(decoder.decode(&encoded[..len]), Ok(None), "prefix {}", len);
    }
    assert!(decoder.decode(&encoded).unwrap().is_some());
}

#[test]
fn test_two_packets_in_one_buffer() {
    let mut buf = encode_packet(&Packet::PingResp);
    buf.extend_from_slice(&encode_packet(&Packet::PubAck(PubAck { packet_id: 9 })));

    let decoder = Decoder::new();
    let (first, consumed) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PingResp);
    assert_eq!(consumed, 2);

    let (second, _) = decoder.decode(&buf[consumed..]).unwrap().unwrap();
    assert_eq!(second, Packet::PubAck(PubAck { packet_id: 9 }));
}

#[test]
fn test_large_remaining_length() {
    let payload = Bytes::from(vec![b'x'; 20_000]);
    roundtrip(Packet::Publish(Publish {
        topic: Arc::from("big"),
        payload,
        ..Default::default()
    }));
}

#[test]
fn test_packet_too_large() {
    let encoded = encode_packet(&Packet::Publish(Publish {
        topic: Arc::from("t"),
        payload: Bytes::from(vec![0u8; 512]),
        ..Default::default()
    }));
    let decoder = Decoder::new().with_max_packet_size(128);
    assert_eq!(decoder.decode(&encoded), Err(DecodeError::PacketTooLarge));
}

#[test]
fn test_invalid_remaining_length() {
    assert_eq!(
        Decoder::new().decode(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
        Err(DecodeError::InvalidRemainingLength)
    );
}

#[test]
fn test_invalid_packet_type() {
    assert_eq!(
        decode_packet(&[0xF0, 0x00]),
        Err(DecodeError::InvalidPacketType(15))
    );
}

#[test]
fn test_truncated_body_is_malformed() {
    // Remaining length says 3 bytes, but the topic length claims 5
    assert!(matches!(
        decode_packet(&[0x30, 0x03, 0x00, 0x05, b'a']),
        Err(DecodeError::MalformedPacket(_))
    ));
}
