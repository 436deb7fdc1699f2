//! Packet encoder
//!
//! Each packet body is serialized first and the fixed header is written
//! in front of it once the remaining length is known.

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, Disconnect, EncodeError, Packet, ProtocolVersion, PubAck, Publish, QoS,
    ReasonCode, SubAck, Subscribe, UnsubAck, Unsubscribe,
};

pub struct Encoder {
    protocol_version: ProtocolVersion,
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            protocol_version: version,
        }
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == ProtocolVersion::V5
    }

    /// Append the wire form of `packet` to `buf`
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::new();
        let first_byte = match packet {
            Packet::Connect(p) => {
                self.connect_body(p, &mut body)?;
                0x10
            }
            Packet::ConnAck(p) => {
                self.connack_body(p, &mut body)?;
                0x20
            }
            Packet::Publish(p) => {
                self.publish_body(p, &mut body)?;
                0x30 | ((p.dup as u8) << 3) | ((p.qos as u8) << 1) | (p.retain as u8)
            }
            Packet::PubAck(p) => {
                self.puback_body(p, &mut body)?;
                0x40
            }
            Packet::Subscribe(p) => {
                self.subscribe_body(p, &mut body)?;
                0x82
            }
            Packet::SubAck(p) => {
                self.suback_body(p, &mut body)?;
                0x90
            }
            Packet::Unsubscribe(p) => {
                self.unsubscribe_body(p, &mut body)?;
                0xA2
            }
            Packet::UnsubAck(p) => {
                self.unsuback_body(p, &mut body)?;
                0xB0
            }
            Packet::PingReq => 0xC0,
            Packet::PingResp => 0xD0,
            Packet::Disconnect(p) => {
                self.disconnect_body(p, &mut body)?;
                0xE0
            }
        };

        buf.reserve(5 + body.len());
        buf.put_u8(first_byte);
        write_variable_int(buf, body.len() as u32)?;
        buf.put_slice(&body);
        Ok(())
    }

    fn connect_body(&self, p: &Connect, body: &mut BytesMut) -> Result<(), EncodeError> {
        let v5 = p.protocol_version == ProtocolVersion::V5;

        write_string(body, "MQTT")?;
        body.put_u8(p.protocol_version as u8);

        let mut flags = 0u8;
        if p.clean_start {
            flags |= 0x02;
        }
        if let Some(ref will) = p.will {
            flags |= 0x04 | ((will.qos as u8) << 3);
            if will.retain {
                flags |= 0x20;
            }
        }
        if p.password.is_some() {
            flags |= 0x40;
        }
        if p.username.is_some() {
            flags |= 0x80;
        }
        body.put_u8(flags);
        body.put_u16(p.keep_alive);

        if v5 {
            p.properties.encode(body)?;
        }
        write_string(body, &p.client_id)?;

        if let Some(ref will) = p.will {
            if v5 {
                will.properties.encode(body)?;
            }
            write_string(body, &will.topic)?;
            write_binary(body, &will.payload)?;
        }
        if let Some(ref username) = p.username {
            write_string(body, username)?;
        }
        if let Some(ref password) = p.password {
            write_binary(body, password)?;
        }
        Ok(())
    }

    fn connack_body(&self, p: &ConnAck, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u8(p.session_present as u8);
        if self.is_v5() {
            body.put_u8(p.reason_code as u8);
            p.properties.encode(body)?;
        } else {
            body.put_u8(p.reason_code.to_v3_connack_code());
        }
        Ok(())
    }

    fn publish_body(&self, p: &Publish, body: &mut BytesMut) -> Result<(), EncodeError> {
        write_string(body, &p.topic)?;
        if p.qos != QoS::AtMostOnce {
            body.put_u16(p.packet_id.unwrap_or_default());
        }
        if self.is_v5() {
            p.properties.encode(body)?;
        }
        body.put_slice(&p.payload);
        Ok(())
    }

    fn puback_body(&self, p: &PubAck, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(p.packet_id);
        // v5.0 short form: success without properties is just the id
        if self.is_v5() && (p.reason_code != ReasonCode::Success || !p.properties.is_empty()) {
            body.put_u8(p.reason_code as u8);
            if !p.properties.is_empty() {
                p.properties.encode(body)?;
            }
        }
        Ok(())
    }

    fn subscribe_body(&self, p: &Subscribe, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(p.packet_id);
        if self.is_v5() {
            p.properties.encode(body)?;
        }
        for sub in &p.subscriptions {
            write_string(body, &sub.filter)?;
            body.put_u8(if self.is_v5() {
                sub.options.to_byte()
            } else {
                sub.options.qos as u8
            });
        }
        Ok(())
    }

    fn suback_body(&self, p: &SubAck, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(p.packet_id);
        if self.is_v5() {
            p.properties.encode(body)?;
            body.extend(p.reason_codes.iter().map(|c| *c as u8));
        } else {
            body.extend(p.reason_codes.iter().map(|c| c.to_v3_suback_code()));
        }
        Ok(())
    }

    fn unsubscribe_body(&self, p: &Unsubscribe, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(p.packet_id);
        if self.is_v5() {
            p.properties.encode(body)?;
        }
        for filter in &p.filters {
            write_string(body, filter)?;
        }
        Ok(())
    }

    fn unsuback_body(&self, p: &UnsubAck, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(p.packet_id);
        if self.is_v5() {
            p.properties.encode(body)?;
            body.extend(p.reason_codes.iter().map(|c| *c as u8));
        }
        Ok(())
    }

    fn disconnect_body(&self, p: &Disconnect, body: &mut BytesMut) -> Result<(), EncodeError> {
        // v3.1.1 DISCONNECT is always empty; v5.0 omits a bare normal disconnect
        if self.is_v5() && (p.reason_code != ReasonCode::Success || !p.properties.is_empty()) {
            body.put_u8(p.reason_code as u8);
            if !p.properties.is_empty() {
                p.properties.encode(body)?;
            }
        }
        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(ProtocolVersion::V5)
    }
}
