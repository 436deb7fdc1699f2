//! Packet codec
//!
//! Streaming decoder and encoder for the supported MQTT v3.1.1 / v5.0
//! packets, plus the primitive readers and writers shared with the
//! property codec.

mod decode;
mod encode;


pub use decode::Decoder;
pub use encode::Encoder;

use bytes::{BufMut, BytesMut};

use crate::protocol::{DecodeError, EncodeError};

/// Largest value a four byte variable integer can carry
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default limit applied by the broker to incoming packets
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Read a variable byte integer. Returns (value, bytes consumed).
#[inline]
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut value: u32 = 0;
    for (i, byte) in buf.iter().take(4).enumerate() {
        value |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if buf.len() >= 4 {
        Err(DecodeError::InvalidRemainingLength)
    } else {
        Err(DecodeError::InsufficientData)
    }
}

/// Write a variable byte integer. Returns bytes written.
#[inline]
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<usize, EncodeError> {
    if value as usize > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLarge);
    }
    let mut written = 0;
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        written += 1;
        if value == 0 {
            return Ok(written);
        }
    }
}

/// Encoded width of a variable byte integer
#[inline]
pub fn variable_int_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

#[inline]
pub fn read_u16(buf: &[u8]) -> Result<u16, DecodeError> {
    match buf {
        [a, b, ..] => Ok(u16::from_be_bytes([*a, *b])),
        _ => Err(DecodeError::InsufficientData),
    }
}

#[inline]
pub fn read_u32(buf: &[u8]) -> Result<u32, DecodeError> {
    match buf {
        [a, b, c, d, ..] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
        _ => Err(DecodeError::InsufficientData),
    }
}

/// Read length-prefixed binary data. Returns (data, bytes consumed).
#[inline]
pub fn read_binary(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    let len = read_u16(buf)? as usize;
    let data = buf
        .get(2..2 + len)
        .ok_or(DecodeError::InsufficientData)?;
    Ok((data, 2 + len))
}

/// Read a length-prefixed UTF-8 string. NUL characters are rejected.
#[inline]
pub fn read_string(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let (raw, consumed) = read_binary(buf)?;
    let s = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
    if s.contains('\0') {
        return Err(DecodeError::MalformedPacket("string contains null character"));
    }
    Ok((s, consumed))
}

#[inline]
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::StringTooLong)?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

#[inline]
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    write_binary(buf, s.as_bytes())
}
