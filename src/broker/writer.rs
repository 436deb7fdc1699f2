//! Direct write buffer for network sessions.
//!
//! The dispatcher appends encoded packets to a per-connection buffer from
//! whatever task is publishing, and the connection task flushes the buffer
//! to the socket when notified. Appending never awaits.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::codec::Encoder;
use crate::protocol::{EncodeError, Packet, Properties, ProtocolVersion, Publish, QoS};
use crate::session::Delivery;

/// Error when handing a packet to a session outlet
#[derive(Debug)]
pub enum SendError {
    /// Connection or session is closed
    Closed,
    /// Packet could not be encoded
    Encoding(EncodeError),
    /// Packet exceeds the maximum size the client accepts
    PacketTooLarge,
    /// Inline session has no handler for the subscription
    NoHandler,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed => write!(f, "session closed"),
            SendError::Encoding(e) => write!(f, "encoding failed: {}", e),
            SendError::PacketTooLarge => write!(f, "packet exceeds client maximum size"),
            SendError::NoHandler => write!(f, "no handler for subscription"),
        }
    }
}

impl std::error::Error for SendError {}

impl From<EncodeError> for SendError {
    fn from(e: EncodeError) -> Self {
        SendError::Encoding(e)
    }
}

/// Shared write buffer between the dispatcher and one connection task
pub struct SharedWriter {
    /// Encoded bytes waiting to be written
    buffer: Mutex<BytesMut>,
    /// Wakes the connection loop when the buffer goes from empty to non-empty
    notify: Notify,
    encoder: Encoder,
    alive: AtomicBool,
    next_packet_id: AtomicU16,
    /// Maximum packet size the client is willing to receive
    max_packet_size: u32,
}

impl SharedWriter {
    pub fn new(protocol_version: ProtocolVersion, max_packet_size: u32) -> Self {
        Self {
            buffer: Mutex::new(BytesMut::with_capacity(2048)),
            notify: Notify::new(),
            encoder: Encoder::new(protocol_version),
            alive: AtomicBool::new(true),
            next_packet_id: AtomicU16::new(1),
            max_packet_size,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.encoder.protocol_version()
    }

    /// Mark the connection as closed and wake the connection loop
    pub fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Take all pending data from the buffer
    pub fn take_buffer(&self) -> BytesMut {
        self.buffer.lock().split()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Queue a control packet (CONNACK, SUBACK, PUBACK, ...)
    pub fn send_packet(&self, packet: &Packet) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }
        self.append(packet)
    }

    /// Queue a PUBLISH built from a dispatcher delivery.
    ///
    /// QoS 1 deliveries get a fresh packet identifier; the client's PUBACK
    /// is accepted but nothing is retransmitted.
    pub fn send_publish(&self, delivery: &Delivery) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }

        let packet_id = match delivery.qos {
            QoS::AtMostOnce => None,
            _ => Some(self.next_packet_id()),
        };
        let mut properties = Properties::new();
        if self.protocol_version() == ProtocolVersion::V5 {
            properties.subscription_identifiers = delivery.subscription_ids.to_vec();
        }

        let publish = Publish {
            dup: false,
            qos: delivery.qos,
            retain: delivery.retain,
            topic: delivery.topic.clone(),
            packet_id,
            payload: delivery.payload.clone(),
            properties,
        };
        self.append(&Packet::Publish(publish))
    }

    fn append(&self, packet: &Packet) -> Result<(), SendError> {
        let was_empty = {
            let mut buffer = self.buffer.lock();
            let start_len = buffer.len();
            if let Err(e) = self.encoder.encode(packet, &mut buffer) {
                buffer.truncate(start_len);
                return Err(e.into());
            }
            if buffer.len() - start_len > self.max_packet_size as usize {
                buffer.truncate(start_len);
                return Err(SendError::PacketTooLarge);
            }
            start_len == 0
        };

        // Coalesce wakeups during bursts
        if was_empty {
            self.notify.notify_one();
        }
        Ok(())
    }

    fn next_packet_id(&self) -> u16 {
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl fmt::Debug for SharedWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedWriter")
            .field("buffer_len", &self.buffer_len())
            .field("alive", &self.is_alive())
            .field("protocol_version", &self.protocol_version())
            .finish()
    }
}
