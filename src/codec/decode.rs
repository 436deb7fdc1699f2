//! Packet decoder
//!
//! `Decoder::decode` works on a partially filled read buffer: it returns
//! `Ok(None)` until a whole packet is available and reports how many bytes
//! the packet used so the caller can advance its buffer.

use std::sync::Arc;

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Disconnect, Packet, PacketType, Properties, ProtocolVersion,
    PubAck, Publish, QoS, ReasonCode, SubAck, Subscribe, Subscription, SubscriptionOptions,
    UnsubAck, Unsubscribe, Will,
};

/// Sequential reader over one packet body
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.rest().first().ok_or(DecodeError::InsufficientData)?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let v = read_u16(self.rest())?;
        self.pos += 2;
        Ok(v)
    }

    fn packet_id(&mut self) -> Result<u16, DecodeError> {
        match self.u16()? {
            0 => Err(DecodeError::MalformedPacket("packet id cannot be 0")),
            id => Ok(id),
        }
    }

    fn string(&mut self) -> Result<&'a str, DecodeError> {
        let (s, len) = read_string(self.rest())?;
        self.pos += len;
        Ok(s)
    }

    fn binary(&mut self) -> Result<&'a [u8], DecodeError> {
        let (data, len) = read_binary(self.rest())?;
        self.pos += len;
        Ok(data)
    }

    fn properties(&mut self) -> Result<Properties, DecodeError> {
        let (props, len) = Properties::decode(self.rest())?;
        self.pos += len;
        Ok(props)
    }
}

/// Stateful decoder; the protocol version is learned from CONNECT
pub struct Decoder {
    max_packet_size: usize,
    protocol_version: Option<ProtocolVersion>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
            protocol_version: None,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = Some(version);
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.protocol_version
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == Some(ProtocolVersion::V5)
    }

    /// Decode one packet from the front of `buf`.
    /// Returns the packet and the number of bytes it occupied.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let Some(&first_byte) = buf.first() else {
            return Ok(None);
        };

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };
        let remaining_length = remaining_length as usize;
        if remaining_length > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let header_len = 1 + len_bytes;
        let total_len = header_len + remaining_length;
        if buf.len() < total_len {
            return Ok(None);
        }

        let packet_type = PacketType::from_u8(first_byte >> 4)
            .ok_or(DecodeError::InvalidPacketType(first_byte >> 4))?;
        let flags = first_byte & 0x0F;
        let body = &buf[header_len..total_len];

        // Only PUBLISH carries free-form flags; SUBSCRIBE and UNSUBSCRIBE
        // must be 0b0010, everything else zero.
        let expected_flags = match packet_type {
            PacketType::Publish => None,
            PacketType::Subscribe | PacketType::Unsubscribe => Some(0x02),
            _ => Some(0x00),
        };
        if expected_flags.is_some_and(|f| f != flags) {
            return Err(DecodeError::InvalidFlags);
        }

        let packet = match packet_type {
            PacketType::Connect => self.decode_connect(body)?,
            PacketType::ConnAck => self.decode_connack(body)?,
            PacketType::Publish => self.decode_publish(flags, body)?,
            PacketType::PubAck => self.decode_puback(body)?,
            PacketType::Subscribe => self.decode_subscribe(body)?,
            PacketType::SubAck => self.decode_suback(body)?,
            PacketType::Unsubscribe => self.decode_unsubscribe(body)?,
            PacketType::UnsubAck => self.decode_unsuback(body)?,
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => self.decode_disconnect(body)?,
        };

        Ok(Some((packet, total_len)))
    }

    fn decode_connect(&mut self, body: &[u8]) -> Result<Packet, DecodeError> {
        let mut r = Reader::new(body);

        let protocol_name = r.string()?;
        if protocol_name != "MQTT" && protocol_name != "MQIsdp" {
            return Err(DecodeError::InvalidProtocolName);
        }

        let level = r.u8()?;
        let protocol_version =
            ProtocolVersion::from_u8(level).ok_or(DecodeError::InvalidProtocolVersion(level))?;
        self.protocol_version = Some(protocol_version);

        let flags = r.u8()?;
        if flags & 0x01 != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let clean_start = flags & 0x02 != 0;
        let will_flag = flags & 0x04 != 0;
        let will_qos_bits = (flags >> 3) & 0x03;
        let will_retain = flags & 0x20 != 0;
        let password_flag = flags & 0x40 != 0;
        let username_flag = flags & 0x80 != 0;

        let will_qos = QoS::from_u8(will_qos_bits).ok_or(DecodeError::InvalidQoS(will_qos_bits))?;
        if !will_flag && (will_qos_bits != 0 || will_retain) {
            return Err(DecodeError::InvalidFlags);
        }
        // v3.1.1 forbids a password without a username
        if protocol_version == ProtocolVersion::V311 && password_flag && !username_flag {
            return Err(DecodeError::InvalidFlags);
        }

        let keep_alive = r.u16()?;
        let properties = if protocol_version == ProtocolVersion::V5 {
            r.properties()?
        } else {
            Properties::default()
        };

        let client_id = r.string()?.to_string();

        let will = if will_flag {
            let properties = if protocol_version == ProtocolVersion::V5 {
                r.properties()?
            } else {
                Properties::default()
            };
            let topic = r.string()?.to_string();
            let payload = Bytes::copy_from_slice(r.binary()?);
            Some(Will {
                topic,
                payload,
                qos: will_qos,
                retain: will_retain,
                properties,
            })
        } else {
            None
        };

        let username = if username_flag {
            Some(r.string()?.to_string())
        } else {
            None
        };
        let password = if password_flag {
            Some(Bytes::copy_from_slice(r.binary()?))
        } else {
            None
        };

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version,
            client_id,
            clean_start,
            keep_alive,
            username,
            password,
            will,
            properties,
        })))
    }

    fn decode_connack(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        let mut r = Reader::new(body);

        let ack_flags = r.u8()?;
        if ack_flags & 0xFE != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let code = r.u8()?;

        let (reason_code, properties) = if self.is_v5() {
            let reason = ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?;
            let props = if r.is_empty() {
                Properties::default()
            } else {
                r.properties()?
            };
            (reason, props)
        } else {
            (ReasonCode::from_v3_connack_code(code), Properties::default())
        };

        Ok(Packet::ConnAck(ConnAck {
            session_present: ack_flags & 0x01 != 0,
            reason_code,
            properties,
        }))
    }

    fn decode_publish(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        let dup = flags & 0x08 != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = flags & 0x01 != 0;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let mut r = Reader::new(body);
        let topic = r.string()?;
        if topic.contains(['+', '#']) {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }

        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            Some(r.packet_id()?)
        };

        let properties = if self.is_v5() {
            r.properties()?
        } else {
            Properties::default()
        };

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: Arc::from(topic),
            packet_id,
            payload: Bytes::copy_from_slice(r.rest()),
            properties,
        }))
    }

    fn decode_puback(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        let mut r = Reader::new(body);
        let packet_id = r.u16()?;

        // v5.0 may omit the reason code (success) and the property block
        let mut ack = PubAck::new(packet_id);
        if self.is_v5() && !r.is_empty() {
            let code = r.u8()?;
            ack.reason_code =
                ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?;
            if !r.is_empty() {
                ack.properties = r.properties()?;
            }
        }

        Ok(Packet::PubAck(ack))
    }

    fn decode_subscribe(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        let mut r = Reader::new(body);
        let packet_id = r.packet_id()?;
        let properties = if self.is_v5() {
            r.properties()?
        } else {
            Properties::default()
        };

        let mut subscriptions = Vec::new();
        while !r.is_empty() {
            let filter = r.string()?;
            if filter.is_empty() {
                return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
            }
            let options_byte = r.u8()?;
            let options = if self.is_v5() {
                SubscriptionOptions::from_byte(options_byte)
                    .ok_or(DecodeError::InvalidSubscriptionOptions)?
            } else {
                // v3.1.1 only defines the QoS bits
                if options_byte & 0xFC != 0 {
                    return Err(DecodeError::InvalidSubscriptionOptions);
                }
                let qos = QoS::from_u8(options_byte).ok_or(DecodeError::InvalidQoS(options_byte))?;
                SubscriptionOptions::with_qos(qos)
            };
            subscriptions.push(Subscription {
                filter: filter.to_string(),
                options,
            });
        }

        if subscriptions.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "SUBSCRIBE must have at least one topic",
            ));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions,
            properties,
        }))
    }

    fn decode_suback(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        let mut r = Reader::new(body);
        let packet_id = r.u16()?;
        let properties = if self.is_v5() {
            r.properties()?
        } else {
            Properties::default()
        };

        let mut reason_codes = Vec::new();
        while !r.is_empty() {
            let code = r.u8()?;
            let reason = if self.is_v5() {
                ReasonCode::from_u8(code)
            } else {
                ReasonCode::from_v3_suback_code(code)
            };
            reason_codes.push(reason.ok_or(DecodeError::InvalidReasonCode(code))?);
        }

        Ok(Packet::SubAck(SubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_unsubscribe(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        let mut r = Reader::new(body);
        let packet_id = r.packet_id()?;
        let properties = if self.is_v5() {
            r.properties()?
        } else {
            Properties::default()
        };

        let mut filters = Vec::new();
        while !r.is_empty() {
            let filter = r.string()?;
            if filter.is_empty() {
                return Err(DecodeError::MalformedPacket("topic filter cannot be empty"));
            }
            filters.push(filter.to_string());
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "UNSUBSCRIBE must have at least one topic",
            ));
        }

        Ok(Packet::Unsubscribe(Unsubscribe {
            packet_id,
            filters,
            properties,
        }))
    }

    fn decode_unsuback(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        let mut r = Reader::new(body);
        let packet_id = r.u16()?;

        let mut ack = UnsubAck {
            packet_id,
            reason_codes: Vec::new(),
            properties: Properties::default(),
        };
        if self.is_v5() {
            ack.properties = r.properties()?;
            while !r.is_empty() {
                let code = r.u8()?;
                ack.reason_codes
                    .push(ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?);
            }
        }

        Ok(Packet::UnsubAck(ack))
    }

    fn decode_disconnect(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        if !self.is_v5() {
            if !body.is_empty() {
                return Err(DecodeError::MalformedPacket(
                    "v3.1.1 DISCONNECT has no payload",
                ));
            }
            return Ok(Packet::Disconnect(Disconnect::default()));
        }

        let mut r = Reader::new(body);
        let mut disconnect = Disconnect::default();
        if !r.is_empty() {
            let code = r.u8()?;
            disconnect.reason_code =
                ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?;
            if !r.is_empty() {
                disconnect.properties = r.properties()?;
            }
        }
        Ok(Packet::Disconnect(disconnect))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
