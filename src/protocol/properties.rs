//! v5.0 properties
//!
//! Only properties the broker acts on are kept. Everything else is
//! validated by its wire type and skipped, so a peer sending e.g. a
//! content type or user properties is still decoded correctly.

use bytes::{BufMut, BytesMut};

use crate::codec::{
    read_binary, read_string, read_u16, read_u32, read_variable_int, variable_int_len,
    write_string, write_variable_int,
};
use crate::protocol::{DecodeError, EncodeError};

/// Property identifiers the broker reads or writes
mod id {
    pub const SUBSCRIPTION_IDENTIFIER: u8 = 0x0B;
    pub const SESSION_EXPIRY_INTERVAL: u8 = 0x11;
    pub const ASSIGNED_CLIENT_IDENTIFIER: u8 = 0x12;
    pub const SERVER_KEEP_ALIVE: u8 = 0x13;
    pub const REASON_STRING: u8 = 0x1F;
    pub const RECEIVE_MAXIMUM: u8 = 0x21;
    pub const TOPIC_ALIAS_MAXIMUM: u8 = 0x22;
    pub const TOPIC_ALIAS: u8 = 0x23;
    pub const MAXIMUM_QOS: u8 = 0x24;
    pub const RETAIN_AVAILABLE: u8 = 0x25;
    pub const MAXIMUM_PACKET_SIZE: u8 = 0x27;
    pub const WILDCARD_SUBSCRIPTION_AVAILABLE: u8 = 0x28;
    pub const SUBSCRIPTION_IDENTIFIER_AVAILABLE: u8 = 0x29;
    pub const SHARED_SUBSCRIPTION_AVAILABLE: u8 = 0x2A;
}

/// Encoding of a property value on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireType {
    Byte,
    TwoByte,
    FourByte,
    VarInt,
    Utf8,
    Binary,
    Utf8Pair,
}

fn wire_type(prop_id: u8) -> Option<WireType> {
    use WireType::*;
    Some(match prop_id {
        0x01 | 0x17 | 0x19 | 0x24 | 0x25 | 0x28 | 0x29 | 0x2A => Byte,
        0x13 | 0x21 | 0x22 | 0x23 => TwoByte,
        0x02 | 0x11 | 0x18 | 0x27 => FourByte,
        0x0B => VarInt,
        0x03 | 0x08 | 0x12 | 0x15 | 0x1A | 0x1C | 0x1F => Utf8,
        0x09 | 0x16 => Binary,
        0x26 => Utf8Pair,
        _ => return None,
    })
}

/// Properties relevant to the broker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    /// May repeat (PUBLISH to a subscriber with overlapping subscriptions)
    pub subscription_identifiers: Vec<u32>,
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<u8>,
    pub maximum_packet_size: Option<u32>,
    pub wildcard_subscription_available: Option<u8>,
    pub subscription_identifier_available: Option<u8>,
    pub shared_subscription_available: Option<u8>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.encoded_size() == 0
    }

    /// Size of the property block, excluding its length prefix
    pub fn encoded_size(&self) -> usize {
        let byte = |v: &Option<u8>| v.map_or(0, |_| 2);
        let two = |v: &Option<u16>| v.map_or(0, |_| 3);
        let four = |v: &Option<u32>| v.map_or(0, |_| 5);
        let utf8 = |v: &Option<String>| v.as_ref().map_or(0, |s| 3 + s.len());

        self.subscription_identifiers
            .iter()
            .map(|id| 1 + variable_int_len(*id))
            .sum::<usize>()
            + four(&self.session_expiry_interval)
            + utf8(&self.assigned_client_identifier)
            + two(&self.server_keep_alive)
            + utf8(&self.reason_string)
            + two(&self.receive_maximum)
            + two(&self.topic_alias_maximum)
            + two(&self.topic_alias)
            + byte(&self.maximum_qos)
            + byte(&self.retain_available)
            + four(&self.maximum_packet_size)
            + byte(&self.wildcard_subscription_available)
            + byte(&self.subscription_identifier_available)
            + byte(&self.shared_subscription_available)
    }

    /// Decode a length-prefixed property block.
    /// Returns the properties and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        let (prop_len, len_bytes) = read_variable_int(buf)?;
        let end = len_bytes + prop_len as usize;
        if buf.len() < end {
            return Err(DecodeError::InsufficientData);
        }

        let block = &buf[len_bytes..end];
        let mut props = Properties::new();
        let mut pos = 0;

        while pos < block.len() {
            let (raw_id, id_len) = read_variable_int(&block[pos..])?;
            pos += id_len;
            let prop_id = u8::try_from(raw_id).map_err(|_| DecodeError::InvalidPropertyId(0xFF))?;
            let kind = wire_type(prop_id).ok_or(DecodeError::InvalidPropertyId(prop_id))?;
            let value = &block[pos..];

            pos += match kind {
                WireType::Byte => {
                    let v = *value.first().ok_or(DecodeError::InsufficientData)?;
                    let slot = match prop_id {
                        id::MAXIMUM_QOS => Some(&mut props.maximum_qos),
                        id::RETAIN_AVAILABLE => Some(&mut props.retain_available),
                        id::WILDCARD_SUBSCRIPTION_AVAILABLE => {
                            Some(&mut props.wildcard_subscription_available)
                        }
                        id::SUBSCRIPTION_IDENTIFIER_AVAILABLE => {
                            Some(&mut props.subscription_identifier_available)
                        }
                        id::SHARED_SUBSCRIPTION_AVAILABLE => {
                            Some(&mut props.shared_subscription_available)
                        }
                        _ => None,
                    };
                    if let Some(slot) = slot {
                        set_once(slot, v, prop_id)?;
                    }
                    1
                }
                WireType::TwoByte => {
                    let v = read_u16(value)?;
                    let slot = match prop_id {
                        id::SERVER_KEEP_ALIVE => Some(&mut props.server_keep_alive),
                        id::RECEIVE_MAXIMUM => {
                            if v == 0 {
                                return Err(DecodeError::MalformedPacket(
                                    "receive maximum cannot be 0",
                                ));
                            }
                            Some(&mut props.receive_maximum)
                        }
                        id::TOPIC_ALIAS_MAXIMUM => Some(&mut props.topic_alias_maximum),
                        id::TOPIC_ALIAS => Some(&mut props.topic_alias),
                        _ => None,
                    };
                    if let Some(slot) = slot {
                        set_once(slot, v, prop_id)?;
                    }
                    2
                }
                WireType::FourByte => {
                    let v = read_u32(value)?;
                    let slot = match prop_id {
                        id::SESSION_EXPIRY_INTERVAL => Some(&mut props.session_expiry_interval),
                        id::MAXIMUM_PACKET_SIZE => {
                            if v == 0 {
                                return Err(DecodeError::MalformedPacket(
                                    "maximum packet size cannot be 0",
                                ));
                            }
                            Some(&mut props.maximum_packet_size)
                        }
                        _ => None,
                    };
                    if let Some(slot) = slot {
                        set_once(slot, v, prop_id)?;
                    }
                    4
                }
                WireType::VarInt => {
                    let (v, len) = read_variable_int(value)?;
                    if v == 0 {
                        return Err(DecodeError::MalformedPacket(
                            "subscription identifier cannot be 0",
                        ));
                    }
                    props.subscription_identifiers.push(v);
                    len
                }
                WireType::Utf8 => {
                    let (s, len) = read_string(value)?;
                    let slot = match prop_id {
                        id::ASSIGNED_CLIENT_IDENTIFIER => {
                            Some(&mut props.assigned_client_identifier)
                        }
                        id::REASON_STRING => Some(&mut props.reason_string),
                        _ => None,
                    };
                    if let Some(slot) = slot {
                        set_once(slot, s.to_string(), prop_id)?;
                    }
                    len
                }
                WireType::Binary => read_binary(value)?.1,
                WireType::Utf8Pair => {
                    let (_, key_len) = read_string(value)?;
                    let (_, val_len) = read_string(&value[key_len..])?;
                    key_len + val_len
                }
            };
        }

        Ok((props, end))
    }

    /// Encode the property block with its length prefix
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_variable_int(buf, self.encoded_size() as u32)?;

        for sub_id in &self.subscription_identifiers {
            buf.put_u8(id::SUBSCRIPTION_IDENTIFIER);
            write_variable_int(buf, *sub_id)?;
        }
        if let Some(v) = self.session_expiry_interval {
            buf.put_u8(id::SESSION_EXPIRY_INTERVAL);
            buf.put_u32(v);
        }
        if let Some(ref s) = self.assigned_client_identifier {
            buf.put_u8(id::ASSIGNED_CLIENT_IDENTIFIER);
            write_string(buf, s)?;
        }
        if let Some(v) = self.server_keep_alive {
            buf.put_u8(id::SERVER_KEEP_ALIVE);
            buf.put_u16(v);
        }
        if let Some(ref s) = self.reason_string {
            buf.put_u8(id::REASON_STRING);
            write_string(buf, s)?;
        }
        for (prop_id, v) in [
            (id::RECEIVE_MAXIMUM, self.receive_maximum),
            (id::TOPIC_ALIAS_MAXIMUM, self.topic_alias_maximum),
            (id::TOPIC_ALIAS, self.topic_alias),
        ] {
            if let Some(v) = v {
                buf.put_u8(prop_id);
                buf.put_u16(v);
            }
        }
        for (prop_id, v) in [
            (id::MAXIMUM_QOS, self.maximum_qos),
            (id::RETAIN_AVAILABLE, self.retain_available),
        ] {
            if let Some(v) = v {
                buf.put_u8(prop_id);
                buf.put_u8(v);
            }
        }
        if let Some(v) = self.maximum_packet_size {
            buf.put_u8(id::MAXIMUM_PACKET_SIZE);
            buf.put_u32(v);
        }
        for (prop_id, v) in [
            (
                id::WILDCARD_SUBSCRIPTION_AVAILABLE,
                self.wildcard_subscription_available,
            ),
            (
                id::SUBSCRIPTION_IDENTIFIER_AVAILABLE,
                self.subscription_identifier_available,
            ),
            (
                id::SHARED_SUBSCRIPTION_AVAILABLE,
                self.shared_subscription_available,
            ),
        ] {
            if let Some(v) = v {
                buf.put_u8(prop_id);
                buf.put_u8(v);
            }
        }

        Ok(())
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, prop_id: u8) -> Result<(), DecodeError> {
    if slot.is_some() {
        return Err(DecodeError::DuplicateProperty(prop_id));
    }
    *slot = Some(value);
    Ok(())
}
