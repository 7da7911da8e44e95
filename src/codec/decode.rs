//! MQTT Packet Decoder

use std::sync::Arc;

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PacketType, PubAck, PubComp, PubRec,
    PubRel, Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, SubscribeTopic, UnsubAck,
    Unsubscribe, Will, PROTOCOL_LEVEL, PROTOCOL_NAME,
};

/// MQTT Packet Decoder
pub struct Decoder {
    /// Maximum remaining length accepted
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(super::MAX_REMAINING_LENGTH);
        self
    }

    /// Decode one packet from the front of the buffer.
    ///
    /// Returns `Ok(None)` until a complete packet is buffered, and
    /// `(packet, bytes_consumed)` once one is.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];

        let packet_type =
            PacketType::from_u8(packet_type).ok_or(DecodeError::InvalidPacketType(packet_type))?;

        let packet = match packet_type {
            PacketType::Connect => Self::decode_connect(flags, body),
            PacketType::ConnAck => Self::decode_connack(flags, body),
            PacketType::Publish => Self::decode_publish(flags, body),
            PacketType::PubAck => Self::decode_packet_id(flags, 0, body)
                .map(|packet_id| Packet::PubAck(PubAck { packet_id })),
            PacketType::PubRec => Self::decode_packet_id(flags, 0, body)
                .map(|packet_id| Packet::PubRec(PubRec { packet_id })),
            PacketType::PubRel => Self::decode_packet_id(flags, 0x02, body)
                .map(|packet_id| Packet::PubRel(PubRel { packet_id })),
            PacketType::PubComp => Self::decode_packet_id(flags, 0, body)
                .map(|packet_id| Packet::PubComp(PubComp { packet_id })),
            PacketType::Subscribe => Self::decode_subscribe(flags, body),
            PacketType::SubAck => Self::decode_suback(flags, body),
            PacketType::Unsubscribe => Self::decode_unsubscribe(flags, body),
            PacketType::UnsubAck => Self::decode_packet_id(flags, 0, body)
                .map(|packet_id| Packet::UnsubAck(UnsubAck { packet_id })),
            PacketType::PingReq => Self::decode_empty(flags, body, Packet::PingReq),
            PacketType::PingResp => Self::decode_empty(flags, body, Packet::PingResp),
            PacketType::Disconnect => Self::decode_empty(flags, body, Packet::Disconnect),
        };

        // The frame is complete, so running out of bytes inside it is malformed
        let packet = packet.map_err(|e| match e {
            DecodeError::InsufficientData => {
                DecodeError::MalformedPacket("packet shorter than its remaining length")
            }
            e => e,
        })?;

        Ok(Some((packet, total_len)))
    }

    fn decode_empty(flags: u8, body: &[u8], packet: Packet) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if !body.is_empty() {
            return Err(DecodeError::MalformedPacket("unexpected payload"));
        }
        Ok(packet)
    }

    fn decode_packet_id(flags: u8, expected_flags: u8, body: &[u8]) -> Result<u16, DecodeError> {
        if flags != expected_flags {
            return Err(DecodeError::InvalidFlags);
        }
        if body.len() != 2 {
            return Err(DecodeError::MalformedPacket("expected a bare packet identifier"));
        }
        read_u16(body)
    }

    fn decode_connect(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let mut pos = 0;

        let (protocol_name, len) = read_string(&body[pos..])?;
        pos += len;
        if protocol_name != PROTOCOL_NAME {
            return Err(DecodeError::InvalidProtocolName);
        }

        let level = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;
        if level != PROTOCOL_LEVEL {
            return Err(DecodeError::InvalidProtocolLevel(level));
        }

        let connect_flags = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;

        // Reserved bit must be 0
        if (connect_flags & 0x01) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let clean_session = (connect_flags & 0x02) != 0;
        let will_flag = (connect_flags & 0x04) != 0;
        let will_qos = (connect_flags >> 3) & 0x03;
        let will_retain = (connect_flags & 0x20) != 0;
        let password_flag = (connect_flags & 0x40) != 0;
        let username_flag = (connect_flags & 0x80) != 0;

        // [MQTT-3.1.2-22] If username flag is 0, password flag must be 0
        if !username_flag && password_flag {
            return Err(DecodeError::InvalidFlags);
        }
        let will_qos = QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?;
        if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(DecodeError::InvalidFlags);
        }

        let keep_alive = read_u16(&body[pos..])?;
        pos += 2;

        let (client_id, len) = read_string(&body[pos..])?;
        pos += len;

        let will = if will_flag {
            let (topic, len) = read_string(&body[pos..])?;
            pos += len;
            let (payload, len) = read_binary(&body[pos..])?;
            pos += len;
            Some(Will {
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(payload),
                qos: will_qos,
                retain: will_retain,
            })
        } else {
            None
        };

        let username = if username_flag {
            let (username, len) = read_string(&body[pos..])?;
            pos += len;
            Some(username.to_string())
        } else {
            None
        };

        let password = if password_flag {
            let (password, len) = read_binary(&body[pos..])?;
            pos += len;
            Some(Bytes::copy_from_slice(password))
        } else {
            None
        };

        if pos != body.len() {
            return Err(DecodeError::MalformedPacket("trailing bytes after CONNECT payload"));
        }

        Ok(Packet::Connect(Box::new(Connect {
            client_id: client_id.to_string(),
            clean_session,
            keep_alive,
            username,
            password,
            will,
        })))
    }

    fn decode_connack(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if body.len() != 2 {
            return Err(DecodeError::MalformedPacket("CONNACK must be 2 bytes"));
        }

        let ack_flags = body[0];
        if (ack_flags & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let return_code =
            ConnectReturnCode::from_u8(body[1]).ok_or(DecodeError::InvalidReturnCode(body[1]))?;

        Ok(Packet::ConnAck(ConnAck {
            session_present: (ack_flags & 0x01) != 0,
            return_code,
        }))
    }

    fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
        let retain = (flags & 0x01) != 0;

        // DUP must be 0 for QoS 0
        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let mut pos = 0;

        let (topic, len) = read_string(&body[pos..])?;
        pos += len;

        if topic.contains('+') || topic.contains('#') {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }

        let packet_id = if qos != QoS::AtMostOnce {
            let id = read_u16(&body[pos..])?;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: Arc::from(topic),
            packet_id,
            payload: Bytes::copy_from_slice(&body[pos..]),
        }))
    }

    fn decode_subscribe(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(body)?;
        let mut pos = 2;
        let mut topics = Vec::new();

        while pos < body.len() {
            let (filter, len) = read_string(&body[pos..])?;
            pos += len;

            let options = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
            pos += 1;
            if (options & 0xFC) != 0 {
                return Err(DecodeError::MalformedPacket("reserved subscription bits set"));
            }
            let qos = QoS::from_u8(options).ok_or(DecodeError::InvalidQoS(options))?;

            topics.push(SubscribeTopic {
                filter: filter.to_string(),
                qos,
            });
        }

        if topics.is_empty() {
            return Err(DecodeError::MalformedPacket("SUBSCRIBE without topic filters"));
        }

        Ok(Packet::Subscribe(Subscribe { packet_id, topics }))
    }

    fn decode_suback(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(body)?;
        let return_codes = body[2..]
            .iter()
            .map(|&code| {
                SubscribeReturnCode::from_u8(code).ok_or(DecodeError::InvalidReturnCode(code))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if return_codes.is_empty() {
            return Err(DecodeError::MalformedPacket("SUBACK without return codes"));
        }

        Ok(Packet::SubAck(SubAck {
            packet_id,
            return_codes,
        }))
    }

    fn decode_unsubscribe(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(body)?;
        let mut pos = 2;
        let mut filters = Vec::new();

        while pos < body.len() {
            let (filter, len) = read_string(&body[pos..])?;
            pos += len;
            filters.push(filter.to_string());
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket("UNSUBSCRIBE without topic filters"));
        }

        Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
