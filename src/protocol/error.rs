//! Protocol error types

use std::fmt;

/// Errors raised while parsing bytes from the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data in buffer
    InsufficientData,
    /// Packet type is reserved or not supported by this broker
    InvalidPacketType(u8),
    /// Variable byte integer longer than four bytes
    InvalidRemainingLength,
    InvalidProtocolName,
    InvalidProtocolVersion(u8),
    InvalidQoS(u8),
    InvalidUtf8,
    /// Unknown property identifier
    InvalidPropertyId(u8),
    /// A property that may appear once appeared twice
    DuplicateProperty(u8),
    /// Fixed header flags do not match the packet type
    InvalidFlags,
    MalformedPacket(&'static str),
    /// Packet exceeds the configured maximum size
    PacketTooLarge,
    InvalidReasonCode(u8),
    InvalidSubscriptionOptions,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::InvalidPacketType(t) => write!(f, "invalid packet type: {}", t),
            Self::InvalidRemainingLength => write!(f, "invalid remaining length encoding"),
            Self::InvalidProtocolName => write!(f, "invalid protocol name"),
            Self::InvalidProtocolVersion(v) => write!(f, "invalid protocol version: {}", v),
            Self::InvalidQoS(q) => write!(f, "invalid QoS value: {}", q),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::InvalidPropertyId(id) => write!(f, "invalid property identifier: {:#04x}", id),
            Self::DuplicateProperty(id) => write!(f, "duplicate property: {:#04x}", id),
            Self::InvalidFlags => write!(f, "invalid packet flags"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::InvalidReasonCode(r) => write!(f, "invalid reason code: {:#04x}", r),
            Self::InvalidSubscriptionOptions => write!(f, "invalid subscription options"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors raised while serializing a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Remaining length does not fit a variable byte integer
    PacketTooLarge,
    /// String or binary field longer than 65535 bytes
    StringTooLong,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string too long"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Errors that end a client connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Decode(DecodeError),
    Encode(EncodeError),
    /// The client broke a protocol rule after a successful decode
    ProtocolViolation(&'static str),
    /// Feature the broker does not offer (QoS 2, topic aliases, ...)
    Unsupported(&'static str),
    KeepAliveTimeout,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::Unsupported(what) => write!(f, "unsupported: {}", what),
            Self::KeepAliveTimeout => write!(f, "keep alive timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        ProtocolError::Decode(e)
    }
}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        ProtocolError::Encode(e)
    }
}
