//! Wire-level protocol types
//!
//! Packet, property and reason code definitions shared by the codec and the
//! broker. Both MQTT v3.1.1 and v5.0 framings are represented by the same
//! types; v5.0-only fields are simply left empty for v3.1.1 peers.

mod error;
mod packet;
mod properties;
mod reason;

pub use error::{DecodeError, EncodeError, ProtocolError};
pub use packet::*;
pub use properties::Properties;
pub use reason::ReasonCode;

/// Protocol level negotiated in CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolVersion {
    /// MQTT v3.1.1 (protocol level 4)
    V311 = 4,
    /// MQTT v5.0 (protocol level 5)
    V5 = 5,
}

impl ProtocolVersion {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            // Level 3 (MQIsdp) is framed identically for the packets we handle
            3 | 4 => Some(ProtocolVersion::V311),
            5 => Some(ProtocolVersion::V5),
            _ => None,
        }
    }
}

/// Delivery guarantee of a message or subscription
///
/// `ExactlyOnce` exists only so it can be decoded and refused; the broker
/// never grants or forwards it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Downgrade: the lower of two levels
    #[inline]
    pub fn min(self, other: Self) -> Self {
        if self <= other {
            self
        } else {
            other
        }
    }
}

/// When retained messages are sent for a new subscription (v5.0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RetainHandling {
    #[default]
    SendAtSubscribe = 0,
    SendAtSubscribeIfNew = 1,
    DoNotSend = 2,
}

impl RetainHandling {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RetainHandling::SendAtSubscribe),
            1 => Some(RetainHandling::SendAtSubscribeIfNew),
            2 => Some(RetainHandling::DoNotSend),
            _ => None,
        }
    }
}

/// Per-filter options carried in SUBSCRIBE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    /// Do not deliver messages published by the subscribing session itself
    pub no_local: bool,
    /// Keep the publisher's retain flag on live deliveries
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

impl SubscriptionOptions {
    pub fn with_qos(qos: QoS) -> Self {
        Self {
            qos,
            ..Default::default()
        }
    }

    /// Parse the v5.0 options byte. Reserved bits must be zero.
    pub fn from_byte(byte: u8) -> Option<Self> {
        if byte & 0xC0 != 0 {
            return None;
        }
        Some(Self {
            qos: QoS::from_u8(byte & 0x03)?,
            no_local: byte & 0x04 != 0,
            retain_as_published: byte & 0x08 != 0,
            retain_handling: RetainHandling::from_u8((byte >> 4) & 0x03)?,
        })
    }

    pub fn to_byte(self) -> u8 {
        (self.qos as u8)
            | ((self.no_local as u8) << 2)
            | ((self.retain_as_published as u8) << 3)
            | ((self.retain_handling as u8) << 4)
    }
}

/// Control packet type from the high nibble of the fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    /// Types outside the supported set (QoS 2 flow, AUTH) map to `None`
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnAck),
            3 => Some(PacketType::Publish),
            4 => Some(PacketType::PubAck),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::SubAck),
            10 => Some(PacketType::Unsubscribe),
            11 => Some(PacketType::UnsubAck),
            12 => Some(PacketType::PingReq),
            13 => Some(PacketType::PingResp),
            14 => Some(PacketType::Disconnect),
            _ => None,
        }
    }
}
